//! Fan-out of committed snapshots and log lines to any number of
//! subscribers.  Publishing never waits on a subscriber: a receiver that
//! falls behind skips ahead to the latest snapshot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use tuner_proto::protocol::Snapshot;

const STATE_CAPACITY: usize = 64;
const LOG_CAPACITY: usize = 256;
const LOG_TAIL: usize = 200;

#[derive(Clone)]
pub struct StateBroadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    latest: watch::Sender<Arc<Snapshot>>,
    states: broadcast::Sender<Arc<Snapshot>>,
    logs: broadcast::Sender<String>,
    tail: Mutex<VecDeque<String>>,
}

impl StateBroadcaster {
    pub fn new(initial: Snapshot) -> Self {
        let (latest, _) = watch::channel(Arc::new(initial));
        let (states, _) = broadcast::channel(STATE_CAPACITY);
        let (logs, _) = broadcast::channel(LOG_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                latest,
                states,
                logs,
                tail: Mutex::new(VecDeque::with_capacity(LOG_TAIL)),
            }),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        self.inner.latest.send_replace(snapshot.clone());
        // No subscribers is fine.
        let _ = self.inner.states.send(snapshot);
    }

    /// Point-in-time pull of the last committed snapshot.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.inner.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            states: self.inner.states.subscribe(),
            latest: self.inner.latest.subscribe(),
        }
    }

    pub fn push_log(&self, line: String) {
        if let Ok(mut tail) = self.inner.tail.lock() {
            if tail.len() == LOG_TAIL {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        let _ = self.inner.logs.send(line);
    }

    pub fn log_tail(&self) -> Vec<String> {
        self.inner
            .tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.inner.logs.subscribe()
    }
}

pub struct Subscription {
    states: broadcast::Receiver<Arc<Snapshot>>,
    latest: watch::Receiver<Arc<Snapshot>>,
}

impl Subscription {
    /// Next snapshot for this subscriber; `None` once the broadcaster is gone.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        match self.states.recv().await {
            Ok(snapshot) => Some(snapshot),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("broadcast: subscriber lagged by {}, resyncing", n);
                self.states = self.states.resubscribe();
                Some(self.latest.borrow().clone())
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tuner_proto::protocol::StreamStatus;

    fn snapshot(rev: u64) -> Snapshot {
        Snapshot {
            rev,
            pack: None,
            station: None,
            station_index: 0,
            volume: 40,
            status: StreamStatus::Stopped,
            power: false,
            cache_progress: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_publish() {
        let b = StateBroadcaster::new(snapshot(0));
        let mut s1 = b.subscribe();
        let mut s2 = b.subscribe();
        b.publish(snapshot(1));
        assert_eq!(s1.next().await.unwrap().rev, 1);
        assert_eq!(s2.next().await.unwrap().rev, 1);
        assert_eq!(b.latest().rev, 1);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_gets_latest() {
        let b = StateBroadcaster::new(snapshot(0));
        let mut slow = b.subscribe();
        for rev in 1..=(STATE_CAPACITY as u64 + 10) {
            b.publish(snapshot(rev));
        }
        let got = slow.next().await.unwrap();
        assert_eq!(got.rev, STATE_CAPACITY as u64 + 10);
    }

    #[test]
    fn test_publish_without_subscribers_does_not_block() {
        let b = StateBroadcaster::new(snapshot(0));
        for rev in 1..1000 {
            b.publish(snapshot(rev));
        }
        assert_eq!(b.latest().rev, 999);
    }

    #[test]
    fn test_log_tail_is_bounded() {
        let b = StateBroadcaster::new(snapshot(0));
        for i in 0..(LOG_TAIL + 5) {
            b.push_log(format!("line {}", i));
        }
        let tail = b.log_tail();
        assert_eq!(tail.len(), LOG_TAIL);
        assert_eq!(tail[0], "line 5");
    }
}
