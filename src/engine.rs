use crate::capture::{InterfaceCapture, PacketCapture};
use crate::connection::Connection;
use crate::discovery::{ConnectionFilter, ConnectionSource, ProcessConnections};
use crate::errors::*;
use crate::gateway::{GatewayInfo, GatewayResolver, Resolve};
use crate::injector::{SegmentInjector, DEFAULT_OFFSETS};
use crate::layer2::{Layer2Attacker, Outcome};
use crate::monitor::ConnectionMonitor;
use crate::net::DEFAULT_WINDOW;
use crate::pool::{self, Shutdown, Task, WorkerPool};
use crate::probe::{ReachabilityProbe, TcpConnectProbe};
use crate::tracker::SequenceTracker;
use crate::transmit::{FrameTransmitter, IpLayerTransmitter, Layer, LinkLayerTransmitter};

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Summary shown when there is nothing to attack.
pub const NO_CONNECTION: &str = "No active connection";
pub const SUMMARY_ERROR: &str = "Error retrieving connection info";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Opaque to the engine, the host application binds it.
    pub hotkey: String,
    pub game_port: u16,
    pub worker_threads: usize,
    pub process_name: String,
    /// Interface for capture and gateway lookup, picked automatically if unset.
    pub interface: Option<String>,
    pub allow_link_layer: bool,
    pub offsets: Vec<u32>,
    pub poll_interval: Duration,
    /// Triggers within this window of the last accepted one are ignored.
    pub debounce: Duration,
    /// The watchdog clears an activation older than this.
    pub watchdog_timeout: Duration,
    pub watchdog_tick: Duration,
    /// Unconditional release after an ip layer attack was launched.
    pub release_delay: Duration,
    pub probe_timeout: Duration,
    pub layer2_probe_timeout: Duration,
    pub layer2_duration: Duration,
    pub layer2_interval: Duration,
    pub arp_timeout: Duration,
    pub arp_attempts: u32,
    pub join_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            hotkey: "f9".into(),
            game_port: 6112,
            worker_threads: 4,
            process_name: "PathOfExile".into(),
            interface: None,
            allow_link_layer: true,
            offsets: DEFAULT_OFFSETS.to_vec(),
            poll_interval: Duration::from_secs(1),
            debounce: Duration::from_secs(8),
            watchdog_timeout: Duration::from_secs(10),
            watchdog_tick: Duration::from_secs(1),
            release_delay: Duration::from_millis(250),
            probe_timeout: Duration::from_millis(500),
            layer2_probe_timeout: Duration::from_millis(300),
            layer2_duration: Duration::from_secs(6),
            layer2_interval: Duration::from_millis(30),
            arp_timeout: Duration::from_secs(1),
            arp_attempts: 2,
            join_timeout: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    pub fn filter(&self) -> ConnectionFilter {
        ConnectionFilter {
            process_name: self.process_name.clone(),
            remote_port: self.game_port,
        }
    }
}

pub type IpTransmitterFactory = Box<dyn Fn(usize) -> Result<Arc<dyn FrameTransmitter>> + Send + Sync>;
pub type LinkTransmitterFactory =
    Box<dyn Fn(&GatewayInfo, usize) -> Result<Arc<dyn FrameTransmitter>> + Send + Sync>;

/// The os facing collaborators of an engine.
pub struct Backend {
    pub source: Arc<dyn ConnectionSource>,
    pub capture: Arc<dyn PacketCapture>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub resolver: Arc<dyn Resolve>,
    pub ip_transmitter: IpTransmitterFactory,
    pub link_transmitter: LinkTransmitterFactory,
}

impl Backend {
    pub fn system(config: &EngineConfig) -> Backend {
        Backend {
            source: Arc::new(ProcessConnections::new(config.filter())),
            capture: Arc::new(InterfaceCapture::new(config.interface.clone())),
            probe: Arc::new(TcpConnectProbe),
            resolver: Arc::new(GatewayResolver {
                interface: config.interface.clone(),
                timeout: config.arp_timeout,
                attempts: config.arp_attempts,
            }),
            ip_transmitter: Box::new(|sockets: usize| {
                IpLayerTransmitter::open(sockets).map(|tx| Arc::new(tx) as Arc<dyn FrameTransmitter>)
            }),
            link_transmitter: Box::new(|gateway: &GatewayInfo, sockets: usize| {
                LinkLayerTransmitter::open(gateway, sockets).map(|tx| Arc::new(tx) as Arc<dyn FrameTransmitter>)
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivationState {
    pub is_active: bool,
    pub last_active_time: Option<Instant>,
}

/// Process wide activation flag, shared by the trigger path, the attack
/// tasks and the watchdog.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    state: Arc<Mutex<ActivationState>>,
}

impl Activation {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, ActivationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Becomes active unless the last activation is younger than `debounce`.
    pub fn try_activate(&self, debounce: Duration) -> bool {
        let mut state = self.lock();
        let now = Instant::now();
        if let Some(last) = state.last_active_time {
            if now.duration_since(last) < debounce {
                return false;
            }
        }
        state.is_active = true;
        state.last_active_time = Some(now);
        true
    }

    /// Clears the flag, the debounce window keeps running.
    pub fn release(&self) {
        self.lock().is_active = false;
    }

    /// Undoes an activation that never launched an attack.
    pub fn cancel(&self) {
        *self.lock() = ActivationState::default();
    }

    /// Clears an activation that has been held longer than `timeout`.
    /// Returns true if it had to.
    pub fn expire_stuck(&self, timeout: Duration) -> bool {
        let mut state = self.lock();
        match state.last_active_time {
            Some(last) if state.is_active && last.elapsed() > timeout => {
                state.is_active = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_active
    }

    pub fn snapshot(&self) -> ActivationState {
        *self.lock()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything an ip layer attack task needs.
struct Attack {
    injector: SegmentInjector,
    transmitter: Arc<dyn FrameTransmitter>,
    tracker: SequenceTracker,
    probe: Arc<dyn ReachabilityProbe>,
    activation: Activation,
    in_flight: AtomicUsize,
    probe_timeout: Duration,
}

impl Attack {
    /// One burst, a probe, and a second burst at the freshest sequence if
    /// the server still answers.
    fn ip_layer(&self, conn: &Connection) {
        let _in_flight = InFlight(&self.in_flight);
        let id = conn.id();

        let seq = self.tracker.get_or_zero(&id);
        self.injector.inject(&self.transmitter, conn, seq, DEFAULT_WINDOW);

        if !self.probe.is_reachable(conn.remote, self.probe_timeout) {
            info!("{} terminated", conn);
            self.activation.release();
            return;
        }

        let seq = self.tracker.get(&id).unwrap_or(seq);
        self.injector.inject(&self.transmitter, conn, seq, DEFAULT_WINDOW);
    }
}

/// Public entry point, owns every background thread of the tool.
pub struct TerminationEngine {
    config: EngineConfig,
    backend: Arc<Backend>,
    filter: ConnectionFilter,
    monitor: ConnectionMonitor,
    attack: Arc<Attack>,
    attacks: WorkerPool,
    gateway: Option<GatewayInfo>,
    shutdown: Shutdown,
    watchdog: Mutex<Option<Task>>,
}

impl TerminationEngine {
    /// Starts an engine against the real network stack.
    pub fn start(config: EngineConfig) -> Result<TerminationEngine> {
        let backend = Backend::system(&config);
        TerminationEngine::with_backend(config, backend)
    }

    pub fn with_backend(config: EngineConfig, backend: Backend) -> Result<TerminationEngine> {
        TerminationEngine::launch(config, Arc::new(backend))
    }

    fn launch(config: EngineConfig, backend: Arc<Backend>) -> Result<TerminationEngine> {
        info!(
            "starting for {} on port {} with {} workers (hotkey {})",
            config.process_name, config.game_port, config.worker_threads, config.hotkey
        );

        if !backend.capture.available() {
            warn!("no interface to capture on, attacks will start from seq=0");
        }

        let workers = config.worker_threads.max(1);
        let (transmitter, gateway) = select_transmitter(&config, &backend, workers)?;
        info!("injecting on the {}", transmitter.layer());

        let tracker = SequenceTracker::new();
        let monitor = ConnectionMonitor::new(
            Arc::clone(&backend.source),
            Arc::clone(&backend.capture),
            tracker.clone(),
            config.poll_interval,
        );

        let attack = Arc::new(Attack {
            injector: SegmentInjector::new(config.offsets.clone(), workers)?,
            transmitter,
            tracker,
            probe: Arc::clone(&backend.probe),
            activation: Activation::default(),
            in_flight: AtomicUsize::new(0),
            probe_timeout: config.probe_timeout,
        });
        let attacks = WorkerPool::new("attack", workers)?;

        monitor.start()?;

        let shutdown = Shutdown::new();
        let watchdog = match spawn_watchdog(&config, attack.activation.clone(), shutdown.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                monitor.stop(config.join_timeout);
                return Err(e.into());
            }
        };

        Ok(TerminationEngine {
            filter: config.filter(),
            config,
            backend,
            monitor,
            attack,
            attacks,
            gateway,
            shutdown,
            watchdog: Mutex::new(Some(watchdog)),
        })
    }

    /// Fires a termination attempt at every live game connection.
    ///
    /// Returns the number of connections attacked. Only the launch is
    /// reported, whether the server really dropped the session can't be
    /// known from here.
    pub fn trigger(&self) -> Result<usize> {
        if self.shutdown.is_signaled() {
            return Err(Error::Stopped);
        }

        let activation = &self.attack.activation;
        if !activation.try_activate(self.config.debounce) {
            debug!("trigger ignored, previous attempt is too recent");
            return Err(Error::Debounced);
        }

        let conns = match self.targets() {
            Ok(conns) if conns.is_empty() => {
                activation.cancel();
                return Err(Error::NoConnection);
            }
            Ok(conns) => conns,
            Err(e) => {
                activation.cancel();
                return Err(e);
            }
        };

        info!("terminating {} connection(s) on the {}", conns.len(), self.layer());
        if self.gateway.is_some() {
            self.link_layer(&conns);
        } else {
            self.ip_layer(&conns);
        }

        Ok(conns.len())
    }

    fn targets(&self) -> Result<Vec<Connection>> {
        let mut conns = self
            .monitor
            .discover()?
            .into_iter()
            .filter(|conn| self.filter.matches_connection(conn))
            .collect::<Vec<_>>();
        conns.sort_by_key(Connection::id);
        Ok(conns)
    }

    fn link_layer(&self, conns: &[Connection]) {
        let attacker = Layer2Attacker {
            injector: &self.attack.injector,
            transmitter: &self.attack.transmitter,
            tracker: &self.attack.tracker,
            source: self.backend.source.as_ref(),
            probe: self.attack.probe.as_ref(),
            duration: self.config.layer2_duration,
            interval: self.config.layer2_interval,
            probe_timeout: self.config.layer2_probe_timeout,
        };

        let outcomes = attacker.run(conns, &self.attack.activation);
        let terminated = outcomes.iter().filter(|o| **o == Outcome::Terminated).count();
        info!("{}/{} connection(s) confirmed terminated", terminated, conns.len());
    }

    fn ip_layer(&self, conns: &[Connection]) {
        for conn in conns {
            let attack = Arc::clone(&self.attack);
            let conn = *conn;
            attack.in_flight.fetch_add(1, Ordering::SeqCst);
            if !self.attacks.execute(move || attack.ip_layer(&conn)) {
                self.attack.in_flight.fetch_sub(1, Ordering::SeqCst);
                warn!("attack pool is gone, {} not attacked", conn);
            }
        }

        let activation = self.attack.activation.clone();
        let delay = self.config.release_delay;
        let spawned = thread::Builder::new().name("release".into()).spawn(move || {
            thread::sleep(delay);
            activation.release();
        });
        if let Err(e) = spawned {
            debug!("could not schedule release ({}), releasing now", e);
            self.attack.activation.release();
        }
    }

    /// Human readable list of the live game connections.
    pub fn connection_summary(&self) -> String {
        if self.shutdown.is_signaled() {
            return NO_CONNECTION.into();
        }
        match self.targets() {
            Ok(conns) if conns.is_empty() => NO_CONNECTION.into(),
            Ok(conns) => conns
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            Err(e) => {
                debug!("{}", e);
                SUMMARY_ERROR.into()
            }
        }
    }

    /// Stops every background thread. Returns false if some of them did not
    /// exit within the join timeout.
    pub fn stop(&self) -> bool {
        if !self.shutdown.signal() {
            return true;
        }
        info!("stopping");

        let monitor = self.monitor.stop(self.config.join_timeout);
        let watchdog = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let watchdog = pool::join_within(watchdog.into_iter().collect(), self.config.join_timeout);
        self.attack.activation.release();

        monitor && watchdog
    }

    /// Stops this engine and starts a fresh one with the same settings.
    pub fn restart(&self) -> Result<TerminationEngine> {
        self.stop();
        TerminationEngine::launch(self.config.clone(), Arc::clone(&self.backend))
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_signaled()
    }

    pub fn is_active(&self) -> bool {
        self.attack.activation.is_active()
    }

    pub fn attacks_in_flight(&self) -> usize {
        self.attack.in_flight.load(Ordering::SeqCst)
    }

    pub fn layer(&self) -> Layer {
        self.attack.transmitter.layer()
    }

    pub fn gateway(&self) -> Option<&GatewayInfo> {
        self.gateway.as_ref()
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.attack.tracker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for TerminationEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Picks the link layer if the gateway resolves, the ip layer otherwise.
fn select_transmitter(
    config: &EngineConfig,
    backend: &Backend,
    workers: usize,
) -> Result<(Arc<dyn FrameTransmitter>, Option<GatewayInfo>)> {
    if config.allow_link_layer {
        match backend.resolver.resolve() {
            Ok(gateway) => match (backend.link_transmitter)(&gateway, workers) {
                Ok(tx) => return Ok((tx, Some(gateway))),
                Err(e) => warn!("{}, falling back to the ip layer", e),
            },
            Err(e) => info!("{}, falling back to the ip layer", e),
        }
    }

    let tx = (backend.ip_transmitter)(workers)?;
    Ok((tx, None))
}

fn spawn_watchdog(config: &EngineConfig, activation: Activation, shutdown: Shutdown) -> io::Result<Task> {
    let tick = config.watchdog_tick;
    let timeout = config.watchdog_timeout;
    Task::spawn("watchdog".into(), move || {
        while !shutdown.sleep(tick) {
            if activation.expire_stuck(timeout) {
                warn!("activation held for more than {:?}, resetting", timeout);
            }
        }
    })
}
