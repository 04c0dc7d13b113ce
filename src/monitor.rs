use crate::capture::PacketCapture;
use crate::connection::{Connection, ConnectionId};
use crate::discovery::ConnectionSource;
use crate::errors::*;
use crate::net::ObservedSegment;
use crate::pool::{self, Shutdown, Task};
use crate::tracker::SequenceTracker;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Sequence number the peer expects next from us after seeing this segment.
#[inline]
pub fn next_sequence(sequence: u32, payload_len: u32) -> u32 {
    sequence.wrapping_add(payload_len)
}

/// Whether `segment` carries the client's own stream position.
///
/// Resets are skipped, the packet socket also sees the ones we forge and
/// their sequence numbers are guesses, not the stream's.
#[inline]
pub fn tracks_sequence(conn: &Connection, segment: &ObservedSegment) -> bool {
    segment.source == conn.local && !segment.rst
}

struct CaptureTask {
    stop: Shutdown,
    task: Task,
}

#[derive(Default)]
struct Tasks {
    scanner: Option<Task>,
    captures: HashMap<ConnectionId, CaptureTask>,
    /// Stopped captures that may still be blocked in a read.
    retired: Vec<Task>,
}

struct Shared {
    source: Arc<dyn ConnectionSource>,
    capture: Arc<dyn PacketCapture>,
    tracker: SequenceTracker,
    poll_interval: Duration,
    shutdown: Shutdown,
    live: Mutex<HashSet<Connection>>,
    tasks: Mutex<Tasks>,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live(&self) -> MutexGuard<'_, HashSet<Connection>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps one capture thread per live game connection so the tracker always
/// holds the client's current sequence number.
pub struct ConnectionMonitor {
    shared: Arc<Shared>,
}

impl ConnectionMonitor {
    pub fn new(
        source: Arc<dyn ConnectionSource>,
        capture: Arc<dyn PacketCapture>,
        tracker: SequenceTracker,
        poll_interval: Duration,
    ) -> ConnectionMonitor {
        ConnectionMonitor {
            shared: Arc::new(Shared {
                source,
                capture,
                tracker,
                poll_interval,
                shutdown: Shutdown::new(),
                live: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Asks the os for the current connections, bypassing the poll loop.
    pub fn discover(&self) -> Result<HashSet<Connection>> {
        self.shared.source.discover()
    }

    /// Connections seen by the last poll.
    pub fn live(&self) -> HashSet<Connection> {
        self.shared.live().clone()
    }

    pub fn is_capturing(&self, id: &ConnectionId) -> bool {
        self.shared.tasks().captures.contains_key(id)
    }

    pub fn start(&self) -> Result<()> {
        if self.shared.shutdown.is_signaled() {
            return Err(Error::Stopped);
        }

        let mut tasks = self.shared.tasks();
        if tasks.scanner.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        tasks.scanner = Some(Task::spawn("monitor".into(), move || scan(&shared))?);
        Ok(())
    }

    /// Signals every thread to exit and waits up to `timeout` for them.
    /// Returns false if some capture is still blocked afterwards.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.shared.shutdown.signal();

        let pending = {
            let mut tasks = self.shared.tasks();
            let mut pending = tasks.retired.drain(..).collect::<Vec<_>>();
            for (_, capture) in tasks.captures.drain() {
                capture.stop.signal();
                pending.push(capture.task);
            }
            if let Some(scanner) = tasks.scanner.take() {
                pending.push(scanner);
            }
            pending
        };

        let joined = pool::join_within(pending, timeout);
        if !joined {
            warn!("some monitor threads did not exit within {:?}", timeout);
        }
        joined
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.shared.shutdown.signal();
    }
}

fn scan(shared: &Arc<Shared>) {
    debug!("connection monitor started");
    while !shared.shutdown.is_signaled() {
        match shared.source.discover() {
            Ok(current) => reconcile(shared, current),
            Err(e) => debug!("{}, retrying next poll", e),
        }
        if shared.shutdown.sleep(shared.poll_interval) {
            break;
        }
    }
    debug!("connection monitor stopped");
}

/// Starts captures for new connections and stops the ones that went away.
fn reconcile(shared: &Arc<Shared>, current: HashSet<Connection>) {
    let mut tasks = shared.tasks();
    tasks.retired.retain(|task| !task.is_finished());

    let gone = tasks
        .captures
        .keys()
        .filter(|id| !current.iter().any(|conn| conn.id() == **id))
        .copied()
        .collect::<Vec<_>>();
    for id in gone {
        if let Some(capture) = tasks.captures.remove(&id) {
            info!("connection {} closed", id);
            capture.stop.signal();
            tasks.retired.push(capture.task);
        }
    }

    for conn in &current {
        if tasks.captures.contains_key(&conn.id()) {
            continue;
        }
        info!("tracking connection {} (pid {})", conn, conn.pid);
        let stop = Shutdown::new();
        match spawn_capture(shared, *conn, stop.clone()) {
            Ok(task) => {
                tasks.captures.insert(conn.id(), CaptureTask { stop, task });
            }
            Err(e) => warn!("could not start capture for {}: {}", conn, e),
        }
    }
    drop(tasks);

    *shared.live() = current;
}

fn spawn_capture(shared: &Arc<Shared>, conn: Connection, stop: Shutdown) -> Result<Task> {
    let shared = Arc::clone(shared);
    let task = Task::spawn(format!("capture-{}", conn.local_port()), move || {
        let id = conn.id();
        let should_stop = || stop.is_signaled() || shared.shutdown.is_signaled();

        let result = shared.capture.capture(&conn, &should_stop, &mut |segment| {
            if should_stop() || !tracks_sequence(&conn, &segment) {
                return;
            }
            let next = next_sequence(segment.sequence, segment.payload_len);
            trace!("{} seq={}", id, next);
            shared.tracker.update(id, next);
        });

        match result {
            Ok(()) => debug!("capture for {} stopped", id),
            Err(e) => warn!("{}, {} stays untracked", e, id),
        }
    })?;
    Ok(task)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::{self, ResetKind, Segment};
    use pnet::util::MacAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    /// Connection table that tests can edit while the monitor runs.
    #[derive(Default)]
    pub struct FakeSource {
        pub connections: Mutex<HashSet<Connection>>,
        pub polls: AtomicUsize,
        pub fail: AtomicBool,
    }

    impl FakeSource {
        pub fn with(conns: &[Connection]) -> FakeSource {
            let source = FakeSource::default();
            source.connections.lock().unwrap().extend(conns.iter().copied());
            source
        }

        pub fn set(&self, conns: &[Connection]) {
            let mut connections = self.connections.lock().unwrap();
            connections.clear();
            connections.extend(conns.iter().copied());
        }
    }

    impl ConnectionSource for FakeSource {
        fn discover(&self) -> Result<HashSet<Connection>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Discovery("simulated".into()));
            }
            Ok(self.connections.lock().unwrap().clone())
        }
    }

    /// Emits an outgoing segment every few milliseconds, advancing the
    /// sequence by 10 each time, plus an incoming one that must be ignored.
    #[derive(Default)]
    pub struct FakeCapture {
        pub running: AtomicUsize,
        pub finished: AtomicUsize,
        pub emitted: AtomicUsize,
    }

    impl PacketCapture for FakeCapture {
        fn capture(
            &self,
            conn: &Connection,
            should_stop: &dyn Fn() -> bool,
            observe: &mut dyn FnMut(ObservedSegment),
        ) -> Result<()> {
            self.running.fetch_add(1, Ordering::SeqCst);
            let mut seq = 1000u32;
            while !should_stop() {
                observe(ObservedSegment {
                    source: conn.local,
                    destination: conn.remote,
                    sequence: seq,
                    payload_len: 10,
                    rst: false,
                });
                observe(ObservedSegment {
                    source: conn.remote,
                    destination: conn.local,
                    sequence: 7,
                    payload_len: 0,
                    rst: false,
                });
                self.emitted.fetch_add(1, Ordering::SeqCst);
                seq = seq.wrapping_add(10);
                thread::sleep(Duration::from_millis(5));
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Replays one live outgoing segment followed by a reset frame as our
    /// own injector would put it on the wire.
    #[derive(Default)]
    struct ReplayCapture {
        replayed: AtomicBool,
    }

    impl PacketCapture for ReplayCapture {
        fn capture(
            &self,
            conn: &Connection,
            should_stop: &dyn Fn() -> bool,
            observe: &mut dyn FnMut(ObservedSegment),
        ) -> Result<()> {
            observe(ObservedSegment {
                source: conn.local,
                destination: conn.remote,
                sequence: 1000,
                payload_len: 0,
                rst: false,
            });

            let forged = Segment::reset(conn, ResetKind::Rst, 1015, 0);
            let frame = net::build_ethernet_frame(
                MacAddr::new(2, 0, 0, 0, 0, 1),
                MacAddr::new(0, 0x11, 0x22, 0x33, 0x44, 0x55),
                &forged,
            )?;
            if let Some(segment) = net::parse_frame(&frame) {
                observe(segment);
            }
            self.replayed.store(true, Ordering::SeqCst);

            while !should_stop() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    pub fn conn(local_port: u16) -> Connection {
        Connection::new(
            42,
            format!("10.0.0.2:{}", local_port).parse().unwrap(),
            "203.0.113.9:6112".parse().unwrap(),
        )
    }

    fn wait_for<F: Fn() -> bool>(timeout: Duration, f: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    #[test]
    fn next_sequence_adds_payload() {
        assert_eq!(next_sequence(1000, 0), 1000);
        assert_eq!(next_sequence(1000, 100), 1100);
        assert_eq!(next_sequence(u32::MAX, 2), 1);
    }

    #[test]
    fn tracks_outgoing_sequence_of_new_connections() {
        let source = Arc::new(FakeSource::with(&[conn(50000)]));
        let capture = Arc::new(FakeCapture::default());
        let tracker = SequenceTracker::new();
        let monitor = ConnectionMonitor::new(source, capture.clone(), tracker.clone(), Duration::from_millis(20));
        monitor.start().unwrap();

        let id = conn(50000).id();
        assert!(wait_for(Duration::from_secs(2), || tracker.get(&id).map_or(false, |seq| seq >= 1010)));
        // incoming segments never reach the tracker
        assert_ne!(tracker.get(&id), Some(7));
        assert!(monitor.is_capturing(&id));
        assert!(monitor.live().contains(&conn(50000)));

        assert!(monitor.stop(Duration::from_secs(1)));
        assert_eq!(capture.running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resets_never_count_as_stream_position() {
        let c = conn(50000);
        let live = ObservedSegment {
            source: c.local,
            destination: c.remote,
            sequence: 1000,
            payload_len: 0,
            rst: false,
        };
        assert!(tracks_sequence(&c, &live));
        assert!(!tracks_sequence(&c, &ObservedSegment { rst: true, ..live }));
        assert!(!tracks_sequence(&c, &ObservedSegment { source: c.remote, destination: c.local, ..live }));
    }

    #[test]
    fn own_forged_resets_leave_the_tracker_alone() {
        let capture = Arc::new(ReplayCapture::default());
        let tracker = SequenceTracker::new();
        let monitor = ConnectionMonitor::new(
            Arc::new(FakeSource::with(&[conn(50000)])),
            capture.clone(),
            tracker.clone(),
            Duration::from_millis(20),
        );
        monitor.start().unwrap();

        let id = conn(50000).id();
        assert!(wait_for(Duration::from_secs(2), || capture.replayed.load(Ordering::SeqCst)));
        assert_eq!(tracker.get(&id), Some(1000));

        assert!(monitor.stop(Duration::from_secs(1)));
    }

    #[test]
    fn capture_stops_one_poll_after_connection_disappears() {
        let poll = Duration::from_millis(100);
        let source = Arc::new(FakeSource::with(&[conn(50000)]));
        let capture = Arc::new(FakeCapture::default());
        let tracker = SequenceTracker::new();
        let monitor = ConnectionMonitor::new(source.clone(), capture.clone(), tracker.clone(), poll);
        monitor.start().unwrap();

        let id = conn(50000).id();
        assert!(wait_for(Duration::from_secs(2), || tracker.get(&id).is_some()));

        source.set(&[]);
        assert!(wait_for(poll * 3, || capture.finished.load(Ordering::SeqCst) == 1));
        assert!(!monitor.is_capturing(&id));

        let frozen = tracker.get(&id);
        thread::sleep(poll);
        assert_eq!(tracker.get(&id), frozen);

        assert!(monitor.stop(Duration::from_secs(1)));
    }

    #[test]
    fn discovery_errors_are_retried() {
        let source = Arc::new(FakeSource::with(&[conn(50000)]));
        source.fail.store(true, Ordering::SeqCst);
        let capture = Arc::new(FakeCapture::default());
        let monitor = ConnectionMonitor::new(source.clone(), capture.clone(), SequenceTracker::new(), Duration::from_millis(10));
        monitor.start().unwrap();

        assert!(wait_for(Duration::from_secs(2), || source.polls.load(Ordering::SeqCst) >= 3));
        assert_eq!(capture.running.load(Ordering::SeqCst), 0);

        source.fail.store(false, Ordering::SeqCst);
        assert!(wait_for(Duration::from_secs(2), || monitor.is_capturing(&conn(50000).id())));
        assert!(monitor.stop(Duration::from_secs(1)));
    }

    #[test]
    fn stopped_monitor_does_not_restart() {
        let monitor = ConnectionMonitor::new(
            Arc::new(FakeSource::default()),
            Arc::new(FakeCapture::default()),
            SequenceTracker::new(),
            Duration::from_millis(10),
        );
        monitor.start().unwrap();
        assert!(monitor.stop(Duration::from_secs(1)));
        assert!(matches!(monitor.start(), Err(Error::Stopped)));
    }
}
