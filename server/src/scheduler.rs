//! Cancellable one-shot timers keyed by an arbitrary key
//!
//! Each scheduled timer is a sleeping tokio task that, when it wakes, posts
//! a [`Fired`] notice to the owner's channel. Cancelling aborts the task,
//! but an abort can lose the race against a task that has already posted
//! its notice, so every timer also carries a generation number:
//! [`TimerScheduler::take_fired`] only hands back the payload when the
//! notice belongs to the timer that is still registered under its key.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Notice posted when a timer's delay has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired<K> {
    pub key: K,
    pub generation: u64,
}

struct PendingTimer<V> {
    generation: u64,
    handle: JoinHandle<()>,
    payload: V,
}

pub struct TimerScheduler<K, V> {
    pending: HashMap<K, PendingTimer<V>>,
    next_generation: u64,
    fired_tx: mpsc::UnboundedSender<Fired<K>>,
}

impl<K, V> TimerScheduler<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Creates a scheduler and the receiver its notices arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Fired<K>>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: HashMap::new(),
                next_generation: 1,
                fired_tx,
            },
            fired_rx,
        )
    }

    /// Arms a timer, replacing (and cancelling) any timer under the same key.
    /// Must be called from within a tokio runtime.
    pub fn schedule(&mut self, key: K, delay: Duration, payload: V) {
        self.cancel(&key);

        let generation = self.next_generation;
        self.next_generation += 1;

        let fired_tx = self.fired_tx.clone();
        let notice_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the owner shut down.
            let _ = fired_tx.send(Fired {
                key: notice_key,
                generation,
            });
        });

        self.pending.insert(
            key,
            PendingTimer {
                generation,
                handle,
                payload,
            },
        );
    }

    /// Disarms the timer under `key`. Returns false if none was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.pending.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Claims the payload for a notice, or `None` if that timer was cancelled
    /// or superseded after it fired.
    pub fn take_fired(&mut self, fired: &Fired<K>) -> Option<V> {
        let current = self.pending.get(&fired.key)?.generation;
        if current != fired.generation {
            return None;
        }
        self.pending.remove(&fired.key).map(|timer| timer.payload)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<K, V> Drop for TimerScheduler<K, V> {
    fn drop(&mut self) {
        for timer in self.pending.values() {
            timer.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Instant};

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (mut scheduler, mut fired_rx) = TimerScheduler::<String, u32>::new();
        let started = Instant::now();

        scheduler.schedule("A".to_string(), Duration::from_millis(150), 7);
        let fired = fired_rx.recv().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(fired.key, "A");
        assert_eq!(scheduler.take_fired(&fired), Some(7));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (mut scheduler, mut fired_rx) = TimerScheduler::<String, u32>::new();

        scheduler.schedule("A".to_string(), Duration::from_millis(100), 1);
        assert!(scheduler.cancel(&"A".to_string()));
        sleep(Duration::from_secs(1)).await;

        assert!(fired_rx.try_recv().is_err());
        assert!(!scheduler.cancel(&"A".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notice_after_cancel_is_discarded() {
        let (mut scheduler, mut fired_rx) = TimerScheduler::<String, u32>::new();

        scheduler.schedule("A".to_string(), Duration::from_millis(100), 1);
        let fired = fired_rx.recv().await.unwrap();

        // Cancelled between posting and processing.
        scheduler.cancel(&"A".to_string());
        assert_eq!(scheduler.take_fired(&fired), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_supersedes_previous_timer() {
        let (mut scheduler, mut fired_rx) = TimerScheduler::<String, &str>::new();

        scheduler.schedule("A".to_string(), Duration::from_millis(100), "first");
        let stale = Fired {
            key: "A".to_string(),
            generation: 1,
        };
        scheduler.schedule("A".to_string(), Duration::from_millis(300), "second");

        assert_eq!(scheduler.take_fired(&stale), None);
        assert_eq!(scheduler.len(), 1);

        let fired = fired_rx.recv().await.unwrap();
        assert_eq!(fired.generation, 2);
        assert_eq!(scheduler.take_fired(&fired), Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_keys() {
        let (mut scheduler, mut fired_rx) = TimerScheduler::<String, u32>::new();

        scheduler.schedule("slow".to_string(), Duration::from_secs(30), 1);
        scheduler.schedule("fast".to_string(), Duration::from_millis(150), 2);

        let fired = fired_rx.recv().await.unwrap();
        assert_eq!(fired.key, "fast");
        assert_eq!(scheduler.take_fired(&fired), Some(2));
        assert!(scheduler.is_pending(&"slow".to_string()));
    }
}
