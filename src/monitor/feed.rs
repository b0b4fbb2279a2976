use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tracing::{debug, warn};

use crate::retry::Backoff;
use crate::store::ResultStore;
use crate::task::Transition;

pub const DEFAULT_FEED_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FEED_BATCH: usize = 500;

/// Cursor-based subscription to the transition log.
///
/// Polls the store for transitions past the cursor. A failed read is logged
/// and retried with backoff from the same cursor, so no transition is
/// skipped or repeated across a reconnect.
pub struct TransitionFeed {
    store: Arc<dyn ResultStore>,
    cursor: i64,
    poll_interval: Duration,
    batch: usize,
    backoff: Backoff,
}

impl TransitionFeed {
    pub fn new(store: Arc<dyn ResultStore>, cursor: i64) -> Self {
        Self {
            store,
            cursor: cursor.max(0),
            poll_interval: DEFAULT_FEED_INTERVAL,
            batch: DEFAULT_FEED_BATCH,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(30)),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Turns the feed into an endless stream of transitions.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Transition> + Send>> {
        let Self {
            store,
            mut cursor,
            poll_interval,
            batch,
            mut backoff,
        } = self;

        Box::pin(async_stream::stream! {
            loop {
                match store.transitions_since(cursor, batch).await {
                    Ok(page) => {
                        if backoff.attempts() > 0 {
                            debug!(cursor, "Transition feed reconnected");
                            backoff.reset();
                        }
                        let full = page.len() >= batch;
                        for transition in page {
                            cursor = transition.seq;
                            yield transition;
                        }
                        if !full {
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(
                            error = %e,
                            cursor,
                            retry_in_ms = delay.as_millis() as u64,
                            "Transition feed lost the store, reconnecting"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::task::{Task, TaskState, TransitionUpdate};
    use futures::StreamExt;
    use serde_json::json;

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(5), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_feed_replays_then_follows() {
        let store = Arc::new(MemoryStore::new());
        let task = Task::new("t", json!([]));
        store.create_pending(&task, None).await.unwrap();

        let mut stream = TransitionFeed::new(store.clone(), 0)
            .with_poll_interval(Duration::from_millis(5))
            .into_stream();

        let first = stream.next().await.unwrap();
        assert_eq!(first.to, TaskState::Pending);

        store
            .transition(task.id, TransitionUpdate::started("w1"))
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.to, TaskState::Started);
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn test_feed_resumes_from_cursor_after_outage() {
        let store = Arc::new(MemoryStore::new());
        let task = Task::new("t", json!([]));
        store.create_pending(&task, None).await.unwrap();

        let mut stream = TransitionFeed::new(store.clone(), 0)
            .with_poll_interval(Duration::from_millis(5))
            .with_backoff(fast_backoff())
            .into_stream();
        let first = stream.next().await.unwrap();

        store.set_available(false);
        let recovering = store.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            recovering.set_available(true);
            recovering
                .transition(task_id, TransitionUpdate::started("w1"))
                .await
                .unwrap();
        });

        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.seq, first.seq + 1);
        assert_eq!(next.to, TaskState::Started);
    }

    #[tokio::test]
    async fn test_feed_starts_after_cursor() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..3 {
            store
                .create_pending(&Task::new("t", json!([])), None)
                .await
                .unwrap();
        }

        let feed = TransitionFeed::new(store.clone(), 2).with_batch(10);
        assert_eq!(feed.cursor(), 2);
        let mut stream = feed.into_stream();
        let next = stream.next().await.unwrap();
        assert_eq!(next.seq, 3);
    }
}
