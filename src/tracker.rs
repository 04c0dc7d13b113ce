use crate::connection::ConnectionId;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Last observed sequence number per connection.
///
/// Cloning is cheap and every clone shares the same map. Each capture thread
/// writes only its own key, readers are the attack paths.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    inner: Arc<Mutex<HashMap<ConnectionId, u32>>>,
}

impl SequenceTracker {
    pub fn new() -> SequenceTracker {
        SequenceTracker::default()
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, u32>> {
        // a panicking writer can't leave a half-written u32 behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[inline]
    pub fn update(&self, id: ConnectionId, seq: u32) {
        self.lock().insert(id, seq);
    }

    #[inline]
    pub fn get(&self, id: &ConnectionId) -> Option<u32> {
        self.lock().get(id).copied()
    }

    /// Sequence to attack with, `0` for connections that were never captured.
    #[inline]
    pub fn get_or_zero(&self, id: &ConnectionId) -> u32 {
        self.get(id).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn id(local_port: u16) -> ConnectionId {
        ConnectionId {
            local: format!("10.0.0.2:{}", local_port).parse().unwrap(),
            remote: "1.2.3.4:6112".parse().unwrap(),
        }
    }

    #[test]
    fn latest_write_wins_per_key() {
        let tracker = SequenceTracker::new();
        tracker.update(id(1), 100);
        tracker.update(id(2), 200);
        tracker.update(id(1), 150);

        assert_eq!(tracker.get(&id(1)), Some(150));
        assert_eq!(tracker.get(&id(2)), Some(200));
        assert_eq!(tracker.get(&id(3)), None);
        assert_eq!(tracker.get_or_zero(&id(3)), 0);
    }

    #[test]
    fn concurrent_writers_never_cross_keys() {
        let tracker = SequenceTracker::new();
        let handles = (0..4u16)
            .map(|n| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for i in 0..1000u32 {
                        tracker.update(id(n), u32::from(n) * 1_000_000 + i);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        for n in 0..4u16 {
            assert_eq!(tracker.get(&id(n)), Some(u32::from(n) * 1_000_000 + 999));
        }
        assert_eq!(tracker.len(), 4);
    }
}
