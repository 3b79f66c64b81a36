use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    ChangeFeed, FeedSource, ProbeDocument, ProbeKey, ProbeSettings, RaceResult, RecordWriter,
    SequenceCursor,
};
use crate::error::{MonitorError, MonitorResult};
use crate::timing::Deadline;

// ─── Task guard ──────────────────────────────────────────────────

/// Aborts the task when the probe returns early, so an observer cannot
/// outlive its caller.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ─── Race ────────────────────────────────────────────────────────

/// Runs one write/observe race and returns the propagation latency.
///
/// The cursor is fetched before either task starts. The observer is
/// spawned before the writer and both run until they have each produced a
/// timestamp; completion order does not matter. When `timeout` passes
/// with the observer still pending the probe fails with `NotFound` and the
/// write timestamp, if any, is discarded. A task error returns at once and
/// aborts the other task.
pub async fn measure_latency<K, C, CFut, W, WFut, O, OFut>(
    mint_key: K,
    cursor_fetch: C,
    write_fn: W,
    observe_fn: O,
    timeout: Duration,
) -> MonitorResult<RaceResult>
where
    K: FnOnce() -> ProbeKey,
    C: FnOnce() -> CFut,
    CFut: Future<Output = MonitorResult<SequenceCursor>>,
    W: FnOnce(ProbeKey) -> WFut,
    WFut: Future<Output = MonitorResult<Instant>> + Send + 'static,
    O: FnOnce(ProbeKey, SequenceCursor, Deadline) -> OFut,
    OFut: Future<Output = MonitorResult<Instant>> + Send + 'static,
{
    let deadline = Deadline::after(timeout);
    let key = mint_key();

    let cursor = tokio::time::timeout_at(deadline.at(), cursor_fetch())
        .await
        .map_err(|_| MonitorError::infra("change feed", "timed out fetching sequence cursor"))??;
    debug!(%key, %cursor, "probe anchored");

    let mut observe = AbortOnDrop(tokio::spawn(observe_fn(
        key.clone(),
        cursor.clone(),
        deadline,
    )));
    let mut write = AbortOnDrop(tokio::spawn(write_fn(key.clone())));

    let expiry = tokio::time::sleep_until(deadline.at());
    tokio::pin!(expiry);

    let mut written: Option<Instant> = None;
    let mut observed: Option<Instant> = None;
    let (write_completed_at, observation_confirmed_at) = loop {
        if let (Some(w), Some(o)) = (written, observed) {
            break (w, o);
        }
        tokio::select! {
            res = &mut write.0, if written.is_none() => {
                written = Some(res??);
                trace!(%key, "write acknowledged");
            }
            res = &mut observe.0, if observed.is_none() => {
                observed = Some(res??);
                trace!(%key, "key observed");
            }
            () = &mut expiry => {
                return Err(if observed.is_none() {
                    MonitorError::NotFound {
                        key,
                        cursor,
                        waited: deadline.elapsed(),
                    }
                } else {
                    MonitorError::infra("writer", format!("write of `{key}` not acknowledged within {timeout:?}"))
                });
            }
        }
    };

    RaceResult::new(key, write_completed_at, observation_confirmed_at)
}

// ─── Observer ────────────────────────────────────────────────────

/// Long-polls `feed` from `cursor` until a response carries `key`,
/// returning the instant that response arrived.
///
/// Each round blocks at most `heartbeat`, capped by what is left of the
/// deadline. A round without the key re-polls after `repoll_delay`,
/// continuing from the position the feed reported. Feed errors propagate
/// immediately.
pub async fn observe_key(
    feed: &dyn ChangeFeed,
    key: &ProbeKey,
    cursor: &SequenceCursor,
    settings: &ProbeSettings,
    deadline: Deadline,
) -> MonitorResult<Instant> {
    let not_found = || MonitorError::NotFound {
        key: key.clone(),
        cursor: cursor.clone(),
        waited: deadline.elapsed(),
    };

    let mut since = cursor.clone();
    let mut rounds = 0u32;
    loop {
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(not_found());
        }
        let heartbeat = settings.heartbeat.min(remaining);

        let batch = tokio::time::timeout_at(deadline.at(), feed.poll(&since, heartbeat))
            .await
            .map_err(|_| not_found())??;
        let seen_at = Instant::now();
        rounds += 1;

        if batch.contains(key) {
            debug!(%key, rounds, "key found in change feed");
            return Ok(seen_at);
        }
        trace!(%key, rounds, records = batch.records.len(), "no match, re-polling");
        if let Some(next) = batch.last_seq {
            since = next;
        }

        if !deadline.sleep(settings.repoll_delay).await {
            return Err(not_found());
        }
    }
}

// ─── Wired probe ─────────────────────────────────────────────────

/// Binds a writer, a feed source and settings into a reusable probe.
#[derive(Clone)]
pub struct LatencyProbe {
    writer: Arc<dyn RecordWriter>,
    feeds: Arc<dyn FeedSource>,
    settings: ProbeSettings,
}

impl LatencyProbe {
    pub fn new(
        writer: Arc<dyn RecordWriter>,
        feeds: Arc<dyn FeedSource>,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            writer,
            feeds,
            settings,
        }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// One latency sample. `seq` seeds the generated document.
    ///
    /// Each call opens its own feed; the observer holds it until it
    /// returns or is aborted.
    pub async fn measure(&self, seq: u64) -> MonitorResult<RaceResult> {
        let feed = tokio::time::timeout(self.settings.timeout, self.feeds.open())
            .await
            .map_err(|_| MonitorError::infra("change feed", "timed out opening feed"))??;
        let observer_feed = feed.clone();
        let writer = self.writer.clone();
        let settings = self.settings.clone();
        let doc = ProbeDocument::generate(seq, self.settings.payload_size);

        measure_latency(
            || ProbeKey::mint(&self.settings.key_prefix),
            || feed.current_cursor(),
            move |key| async move {
                writer.write(&key, &doc).await?;
                Ok::<_, MonitorError>(Instant::now())
            },
            move |key, cursor, deadline| async move {
                observe_key(observer_feed.as_ref(), &key, &cursor, &settings, deadline).await
            },
            self.settings.timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn key() -> ProbeKey {
        ProbeKey::from("K")
    }

    async fn cursor() -> MonitorResult<SequenceCursor> {
        Ok(SequenceCursor::from("0-0"))
    }

    #[tokio::test(start_paused = true)]
    async fn observer_may_finish_before_writer() {
        // Timestamps decide the latency, not completion order.
        let res = measure_latency(
            key,
            cursor,
            |_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let at = Instant::now();
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(at)
            },
            |_, _, _| async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(Instant::now())
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(res.latency_ms(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn write_error_aborts_observer() {
        let observer_finished = Arc::new(AtomicBool::new(false));
        let flag = observer_finished.clone();
        let err = measure_latency(
            key,
            cursor,
            |_| async { Err(MonitorError::infra("writer", "503")) },
            move |_, _, _| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(Instant::now())
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MonitorError::Infra { .. }));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!observer_finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_writer_is_infra_not_not_found() {
        let err = measure_latency(
            key,
            cursor,
            |_| std::future::pending::<MonitorResult<Instant>>(),
            |_, _, _| async { Ok(Instant::now()) },
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MonitorError::Infra { ref target, .. } if target == "writer"));
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_errors_fail_before_tasks_start() {
        let wrote = Arc::new(AtomicBool::new(false));
        let flag = wrote.clone();
        let err = measure_latency(
            key,
            || async { Err(MonitorError::infra("change feed", "connection refused")) },
            move |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(Instant::now())
            },
            |_, _, _| async { Ok(Instant::now()) },
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MonitorError::Infra { .. }));
        assert!(!wrote.load(Ordering::SeqCst));
    }
}
