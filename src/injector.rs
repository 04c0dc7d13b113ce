use crate::connection::Connection;
use crate::errors::*;
use crate::net::{ResetKind, Segment};
use crate::pool::WorkerPool;
use crate::transmit::FrameTransmitter;
use crossbeam_channel::RecvTimeoutError;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Offsets added to the tracked sequence number. Repeated values are sent
/// twice on purpose, a lost frame must not lose the guess.
pub const DEFAULT_OFFSETS: [u32; 10] = [0, 0, 2, 2, 7, 7, 10, 10, 15, 15];

/// How long `inject` waits for its workers to report back.
const BURST_TIMEOUT: Duration = Duration::from_millis(500);

/// `(base + offset) mod 2^32` for every offset, duplicates included.
pub fn sequence_candidates(base: u32, offsets: &[u32]) -> Vec<u32> {
    offsets.iter().map(|offset| base.wrapping_add(*offset)).collect()
}

/// Deals `items` round robin onto at most `workers` chunks.
pub fn partition(items: &[u32], workers: usize) -> Vec<Vec<u32>> {
    let workers = workers.max(1);
    let mut chunks = vec![Vec::new(); workers];
    for (i, item) in items.iter().enumerate() {
        chunks[i % workers].push(*item);
    }
    chunks.retain(|chunk| !chunk.is_empty());
    chunks
}

/// Sends a RST and a RST-ACK for every sequence number, in order.
///
/// Failed sends are logged and skipped, returns how many went out.
pub fn send_burst(tx: &dyn FrameTransmitter, conn: &Connection, sequences: &[u32], window: u16) -> usize {
    let mut sent = 0;
    for seq in sequences {
        for kind in &ResetKind::ALL {
            let segment = Segment::reset(conn, *kind, *seq, window);
            match tx.transmit(&segment) {
                Ok(()) => sent += 1,
                Err(e) => debug!("{:?} seq={} to {} dropped: {}", kind, seq, conn.remote, e),
            }
        }
    }
    sent
}

/// Fires reset bursts across a fixed pool of sender threads.
pub struct SegmentInjector {
    offsets: Vec<u32>,
    pool: WorkerPool,
}

impl SegmentInjector {
    pub fn new(offsets: Vec<u32>, workers: usize) -> Result<SegmentInjector> {
        let pool = WorkerPool::with_init("injector", workers, raise_priority)?;
        Ok(SegmentInjector { offsets, pool })
    }

    /// Sends the whole offset set around `base` and returns the number of
    /// segments handed to the os. Workers that haven't reported back within
    /// the burst timeout are not counted.
    pub fn inject(&self, tx: &Arc<dyn FrameTransmitter>, conn: &Connection, base: u32, window: u16) -> usize {
        let sequences = sequence_candidates(base, &self.offsets);
        let chunks = partition(&sequences, self.pool.size());

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let mut pending = 0;
        for chunk in chunks {
            let tx = Arc::clone(tx);
            let done_tx = done_tx.clone();
            let conn = *conn;
            let queued = self.pool.execute(move || {
                let sent = send_burst(tx.as_ref(), &conn, &chunk, window);
                let _ = done_tx.send(sent);
            });
            if queued {
                pending += 1;
            }
        }
        drop(done_tx);

        let deadline = Instant::now() + BURST_TIMEOUT;
        let mut sent = 0;
        while pending > 0 {
            match done_rx.recv_deadline(deadline) {
                Ok(n) => {
                    sent += n;
                    pending -= 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!("{} burst workers still busy after {:?}", pending, BURST_TIMEOUT);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!("sent {} segments to {} around seq={}", sent, conn, base);
        sent
    }
}

/// Burst timing matters relative to the next legitimate segment, ask for a
/// better nice value. Without the privilege this silently stays the default.
#[cfg(target_os = "linux")]
fn raise_priority() {
    // on linux this only affects the calling thread
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
    if ret != 0 {
        trace!("could not raise thread priority: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmit::tests::RecordingTransmitter;
    use crate::transmit::Layer;

    fn conn() -> Connection {
        Connection::new(7, "192.168.1.20:51000".parse().unwrap(), "203.0.113.9:6112".parse().unwrap())
    }

    #[test]
    fn candidates_keep_duplicates() {
        assert_eq!(
            sequence_candidates(1000, &DEFAULT_OFFSETS),
            vec![1000, 1000, 1002, 1002, 1007, 1007, 1010, 1010, 1015, 1015]
        );
    }

    #[test]
    fn candidates_wrap_around() {
        assert_eq!(
            sequence_candidates(u32::MAX - 1, &[0, 2, 15]),
            vec![u32::MAX - 1, 0, 13]
        );
    }

    #[test]
    fn partition_round_robin() {
        let chunks = partition(&[0, 0, 2, 2, 7, 7, 10, 10, 15, 15], 4);
        assert_eq!(
            chunks,
            vec![vec![0, 7, 15], vec![0, 7, 15], vec![2, 10], vec![2, 10]]
        );
    }

    #[test]
    fn partition_drops_empty_chunks() {
        assert_eq!(partition(&[1, 2], 8), vec![vec![1], vec![2]]);
        assert_eq!(partition(&[1, 2], 0), vec![vec![1, 2]]);
    }

    #[test]
    fn inject_sends_rst_and_rst_ack_per_offset() {
        let recorder = Arc::new(RecordingTransmitter::new(Layer::Ip));
        let tx: Arc<dyn FrameTransmitter> = recorder.clone();
        let injector = SegmentInjector::new(DEFAULT_OFFSETS.to_vec(), 4).unwrap();

        let sent = injector.inject(&tx, &conn(), 1000, 512);
        assert_eq!(sent, 20);

        let segments = recorder.sent();
        assert_eq!(segments.len(), 20);
        for kind in &ResetKind::ALL {
            let mut seqs = segments
                .iter()
                .filter(|s| s.kind == *kind)
                .map(|s| s.sequence)
                .collect::<Vec<_>>();
            seqs.sort();
            assert_eq!(seqs, vec![1000, 1000, 1002, 1002, 1007, 1007, 1010, 1010, 1015, 1015]);
        }
        for segment in &segments {
            assert_eq!(segment.source, conn().local);
            assert_eq!(segment.destination, conn().remote);
            assert_eq!(segment.window, 512);
        }
    }

    #[test]
    fn failed_sends_do_not_abort_the_burst() {
        let recorder = Arc::new(RecordingTransmitter::failing(Layer::Ip));
        let tx: Arc<dyn FrameTransmitter> = recorder.clone();
        let injector = SegmentInjector::new(DEFAULT_OFFSETS.to_vec(), 2).unwrap();

        assert_eq!(injector.inject(&tx, &conn(), 1, 0), 0);
        assert_eq!(recorder.attempts(), 20);
    }
}
