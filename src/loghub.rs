//! Per-run bounded log buffer with multicast to live subscribers.
//!
//! Publishing never waits on a subscriber. Each subscriber owns a bounded
//! queue; when `try_send` finds it full the subscriber is removed and its
//! stream ends, exactly as if it had disconnected.

use crate::clock::Clock;
use crate::model::{LogLine, RunId};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHubConfig {
    pub ring_capacity: usize,
    /// Live lines a subscriber may have outstanding on top of the replay.
    pub subscriber_queue: usize,
}

impl Default for LogHubConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 500,
            subscriber_queue: 256,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LogLine>,
}

struct RunLog {
    ring: VecDeque<LogLine>,
    next_sequence: u64,
    next_subscriber: u64,
    subscribers: Vec<Subscriber>,
}

impl RunLog {
    fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            next_sequence: 0,
            next_subscriber: 0,
            subscribers: Vec::new(),
        }
    }
}

pub struct LogHub {
    cfg: LogHubConfig,
    clock: Arc<dyn Clock>,
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunLog>>>>,
}

impl LogHub {
    pub fn new(cfg: LogHubConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg: LogHubConfig {
                ring_capacity: cfg.ring_capacity.max(1),
                subscriber_queue: cfg.subscriber_queue.max(1),
            },
            clock,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> LogHubConfig {
        self.cfg
    }

    fn run_log(&self, run_id: &RunId) -> Arc<Mutex<RunLog>> {
        if let Some(log) = self.runs.read().get(run_id) {
            return log.clone();
        }
        self.runs
            .write()
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RunLog::new(self.cfg.ring_capacity))))
            .clone()
    }

    /// Append a line to the run's ring and hand it to every live subscriber.
    pub fn publish(&self, run_id: &RunId, stream_tag: &str, text: impl Into<String>) -> LogLine {
        let log = self.run_log(run_id);
        let timestamp = self.clock.now();
        let mut log = log.lock();

        let line = LogLine {
            run_id: run_id.clone(),
            sequence: log.next_sequence,
            stream_tag: stream_tag.to_string(),
            text: text.into(),
            timestamp,
        };
        log.next_sequence += 1;

        if log.ring.len() == self.cfg.ring_capacity {
            log.ring.pop_front();
        }
        log.ring.push_back(line.clone());

        log.subscribers.retain(|sub| match sub.tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(run_id = %run_id, subscriber = sub.id, "subscriber queue full, dropping");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(run_id = %run_id, subscriber = sub.id, "subscriber gone");
                false
            }
        });

        line
    }

    /// Subscribe to a run's output. The current ring is replayed first,
    /// oldest to newest, followed by live lines.
    pub fn subscribe(&self, run_id: &RunId) -> LogSubscription {
        let log = self.run_log(run_id);
        let weak = Arc::downgrade(&log);
        let mut guard = log.lock();

        let (tx, rx) = mpsc::channel(guard.ring.len() + self.cfg.subscriber_queue);
        for line in &guard.ring {
            // Capacity covers the whole ring, so this cannot be full.
            let _ = tx.try_send(line.clone());
        }

        let id = guard.next_subscriber;
        guard.next_subscriber += 1;
        guard.subscribers.push(Subscriber { id, tx });
        tracing::debug!(run_id = %run_id, subscriber = id, replayed = guard.ring.len(), "subscribed");

        LogSubscription {
            id,
            run_id: run_id.clone(),
            rx,
            run_log: weak,
        }
    }

    /// Last `n` buffered lines, oldest first.
    pub fn recent(&self, run_id: &RunId, n: usize) -> Vec<LogLine> {
        let Some(log) = self.runs.read().get(run_id).cloned() else {
            return Vec::new();
        };
        let log = log.lock();
        let skip = log.ring.len().saturating_sub(n);
        log.ring.iter().skip(skip).cloned().collect()
    }

    /// Empty the ring ahead of a new execution. Subscribers stay attached and
    /// sequence numbers keep counting up.
    pub fn clear(&self, run_id: &RunId) {
        if let Some(log) = self.runs.read().get(run_id) {
            log.lock().ring.clear();
        }
    }

    /// Drop all state for a run. Live subscriptions end.
    pub fn forget(&self, run_id: &RunId) {
        self.runs.write().remove(run_id);
    }

    pub fn subscriber_count(&self, run_id: &RunId) -> usize {
        self.runs
            .read()
            .get(run_id)
            .map(|log| log.lock().subscribers.len())
            .unwrap_or(0)
    }
}

/// Handle returned by [`LogHub::subscribe`]. Dropping it unsubscribes.
pub struct LogSubscription {
    id: u64,
    run_id: RunId,
    rx: mpsc::Receiver<LogLine>,
    run_log: Weak<Mutex<RunLog>>,
}

impl LogSubscription {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Next line, or `None` once unsubscribed, dropped for overflow, or the
    /// run was forgotten.
    pub async fn recv(&mut self) -> Option<LogLine> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<LogLine, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn into_stream(self) -> impl Stream<Item = LogLine> {
        futures::stream::unfold(self, |mut sub| async move {
            let line = sub.recv().await?;
            Some((line, sub))
        })
    }

    /// Release the subscription. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(log) = self.run_log.upgrade() {
            let id = self.id;
            log.lock().subscribers.retain(|sub| sub.id != id);
        }
        self.run_log = Weak::new();
        self.rx.close();
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use futures::StreamExt;
    use std::time::Duration;

    fn hub(ring_capacity: usize, subscriber_queue: usize) -> LogHub {
        LogHub::new(
            LogHubConfig {
                ring_capacity,
                subscriber_queue,
            },
            Arc::new(SystemClock),
        )
    }

    fn drain(sub: &mut LogSubscription) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Ok(line) = sub.try_recv() {
            seqs.push(line.sequence);
        }
        seqs
    }

    #[test]
    fn ring_evicts_oldest_and_replays_in_order() {
        let hub = hub(500, 16);
        let run = RunId::from("r");
        for i in 0..501 {
            hub.publish(&run, "solve", format!("line {i}"));
        }

        let mut sub = hub.subscribe(&run);
        let seqs = drain(&mut sub);
        assert_eq!(seqs, (1..=500).collect::<Vec<u64>>());
    }

    #[test]
    fn replay_then_live_without_gaps() {
        let hub = hub(10, 16);
        let run = RunId::from("r");
        hub.publish(&run, "solve", "a");
        hub.publish(&run, "solve", "b");

        let mut sub = hub.subscribe(&run);
        hub.publish(&run, "solve", "c");

        let lines: Vec<String> = std::iter::from_fn(|| sub.try_recv().ok())
            .map(|l| l.text)
            .collect();
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn slow_subscriber_is_dropped_without_affecting_others() {
        let hub = hub(100, 2);
        let run = RunId::from("r");
        let mut slow = hub.subscribe(&run);
        let mut fast = hub.subscribe(&run);

        let mut fast_seen = Vec::new();
        for i in 0..5 {
            hub.publish(&run, "solve", format!("{i}"));
            fast_seen.extend(drain(&mut fast));
        }

        assert_eq!(fast_seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(hub.subscriber_count(&run), 1);
        // The dropped subscriber keeps what was queued, then sees the end.
        assert_eq!(drain(&mut slow), vec![0, 1]);
        assert!(matches!(slow.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn unsubscribe_is_idempotent_and_immediate() {
        let hub = hub(10, 4);
        let run = RunId::from("r");
        let mut sub = hub.subscribe(&run);
        assert_eq!(hub.subscriber_count(&run), 1);

        sub.unsubscribe();
        assert_eq!(hub.subscriber_count(&run), 0);
        sub.unsubscribe();
        assert_eq!(hub.subscriber_count(&run), 0);

        hub.publish(&run, "solve", "after");
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn dropping_a_subscription_releases_it() {
        let hub = hub(10, 4);
        let run = RunId::from("r");
        {
            let _sub = hub.subscribe(&run);
            assert_eq!(hub.subscriber_count(&run), 1);
        }
        assert_eq!(hub.subscriber_count(&run), 0);
    }

    #[test]
    fn clear_keeps_sequence_counting() {
        let hub = hub(10, 4);
        let run = RunId::from("r");
        hub.publish(&run, "solve", "a");
        hub.publish(&run, "solve", "b");
        hub.clear(&run);
        assert!(hub.recent(&run, 5).is_empty());

        let line = hub.publish(&run, "solve", "c");
        assert_eq!(line.sequence, 2);
    }

    #[test]
    fn recent_returns_tail_oldest_first() {
        let hub = hub(10, 4);
        let run = RunId::from("r");
        for t in ["a", "b", "c", "d"] {
            hub.publish(&run, "solve", t);
        }
        let texts: Vec<String> = hub.recent(&run, 3).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["b", "c", "d"]);
        assert!(hub.recent(&RunId::from("other"), 3).is_empty());
    }

    #[test]
    fn runs_are_independent() {
        let hub = hub(10, 4);
        let a = RunId::from("a");
        let b = RunId::from("b");
        hub.publish(&a, "solve", "a0");
        let line = hub.publish(&b, "solve", "b0");
        assert_eq!(line.sequence, 0);
        assert_eq!(hub.recent(&a, 10).len(), 1);
    }

    #[tokio::test]
    async fn stream_ends_when_run_is_forgotten() {
        let hub = Arc::new(hub(10, 4));
        let run = RunId::from("r");
        hub.publish(&run, "solve", "first");
        let stream = hub.subscribe(&run).into_stream();

        let publisher = hub.clone();
        let run2 = run.clone();
        tokio::spawn(async move {
            publisher.publish(&run2, "solve", "second");
            publisher.forget(&run2);
        });

        let lines: Vec<LogLine> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }
}
