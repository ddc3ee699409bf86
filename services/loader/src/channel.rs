//! Most-recent-value delivery channel.
//!
//! A [`ProgressiveChannel`] holds a single slot. Producers [`push`] successive
//! refinements into it and every push overwrites whatever the consumer has
//! not looked at yet, so a slow consumer only ever sees the newest result.
//! Consumers [`drain`] the channel as a stream that ends once the channel is
//! done or yields the failure once it has failed.
//!
//! ```text
//! producer:  push(a)  push(b)        push(c, final)
//! slot:      [a]      [b]     (b taken)   [c]
//! consumer:           ------ b ------------ c -> end
//! ```
//!
//! [`push`]: ProgressiveChannel::push
//! [`drain`]: ProgressiveChannel::drain

use crate::error::{ChannelError, LoadError};
use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

struct State<T> {
    latest: Option<T>,
    /// Bumped on every push; drains remember the last generation they saw
    generation: u64,
    done: bool,
    error: Option<Arc<LoadError>>,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    wake: Notify,
}

enum Step<T> {
    Yield(T, u64),
    Fail(Arc<LoadError>),
    End,
}

impl<T: Clone> Shared<T> {
    /// Wait until there is something to report to a drain that has seen
    /// everything up to `seen`.
    async fn next_step(&self, seen: u64) -> Step<T> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if let Some(error) = &state.error {
                    return Step::Fail(error.clone());
                }
                if state.generation > seen {
                    if let Some(value) = &state.latest {
                        return Step::Yield(value.clone(), state.generation);
                    }
                }
                if state.done {
                    return Step::End;
                }
            }

            trace!(channel = %self.name, "Waiting for next value");
            notified.await;
        }
    }
}

/// Single-slot, overwrite-on-arrival delivery channel
///
/// Cloning yields another handle to the same channel.
pub struct ProgressiveChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ProgressiveChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for ProgressiveChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ProgressiveChannel")
            .field("name", &self.shared.name)
            .field("generation", &state.generation)
            .field("done", &state.done)
            .field("failed", &state.error.is_some())
            .finish()
    }
}

impl<T> ProgressiveChannel<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    latest: None,
                    generation: 0,
                    done: false,
                    error: None,
                }),
                wake: Notify::new(),
            }),
        }
    }

    /// Adapt a future into a channel that receives its output as the final
    /// value, or its error as the failure. Must be called within a Tokio
    /// runtime.
    pub fn from_future<Fut>(name: impl Into<String>, future: Fut) -> Self
    where
        Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
    {
        let channel = Self::new(name);
        let producer = channel.clone();
        tokio::spawn(async move {
            match future.await {
                Ok(value) => producer.push(value, true),
                Err(error) => producer.fail(error),
            }
        });
        channel
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Replace the latest value; `is_final` marks the channel done.
    pub fn push(&self, value: T, is_final: bool) {
        {
            let mut state = self.shared.state.lock();
            state.latest = Some(value);
            state.generation += 1;
            state.done |= is_final;
        }
        self.shared.wake.notify_waiters();
    }

    /// Record a failure; drains and peeks raise it from now on. The first
    /// failure sticks.
    pub fn fail(&self, error: impl Into<Arc<LoadError>>) {
        let error = error.into();
        {
            let mut state = self.shared.state.lock();
            if let Some(existing) = &state.error {
                debug!(
                    channel = %self.shared.name,
                    error = %error,
                    existing = %existing,
                    "Channel already failed"
                );
                return;
            }
            state.error = Some(error.clone());
        }
        warn!(channel = %self.shared.name, error = %error, "Progressive channel failed");
        self.shared.wake.notify_waiters();
    }

    /// Mark done, keeping the latest value without delivering it again.
    pub fn finish(&self) {
        self.shared.state.lock().done = true;
        self.shared.wake.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    pub fn has_failed(&self) -> bool {
        self.shared.state.lock().error.is_some()
    }

    /// The most recent value, without consuming or waiting.
    pub fn peek_latest(&self) -> Result<Option<T>, ChannelError> {
        let state = self.shared.state.lock();
        if let Some(error) = &state.error {
            return Err(ChannelError::Failed(error.clone()));
        }
        Ok(state.latest.clone())
    }

    /// Lazily drain the newest undelivered values until the channel is done.
    ///
    /// Each value is yielded at most once per drain; values replaced before
    /// the drain looked are skipped. A failure is yielded as the last item.
    pub fn drain(&self) -> impl Stream<Item = Result<T, ChannelError>> + Send + 'static {
        let cursor = Some((self.shared.clone(), 0u64));
        stream::unfold(cursor, |cursor| async move {
            let (shared, seen) = cursor?;
            match shared.next_step(seen).await {
                Step::Yield(value, generation) => Some((Ok(value), Some((shared, generation)))),
                Step::Fail(error) => Some((Err(ChannelError::Failed(error)), None)),
                Step::End => None,
            }
        })
    }

    /// Run `producer` against this channel.
    ///
    /// On success the channel is marked done if the producer did not do so.
    /// A producer error is logged and does not fail the channel; producers
    /// call [`fail`](Self::fail) themselves for stream failures.
    pub async fn run_producer<F, Fut, E>(&self, producer: F)
    where
        F: FnOnce(ProgressiveChannel<T>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let name = self.shared.name.clone();
        self.run_producer_with(producer, move |error: E| {
            warn!(channel = %name, error = %error, "Couldn't process producer");
        })
        .await
    }

    /// Like [`run_producer`](Self::run_producer) with a caller supplied
    /// error callback.
    pub async fn run_producer_with<F, Fut, E, C>(&self, producer: F, on_error: C)
    where
        F: FnOnce(ProgressiveChannel<T>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        C: FnOnce(E),
    {
        match producer(self.clone()).await {
            Ok(()) => {
                if !self.is_done() {
                    self.finish();
                }
            }
            Err(error) => on_error(error),
        }
    }

    /// First value delivered while draining.
    pub async fn first(&self) -> Result<T, ChannelError> {
        self.first_where(|_| true).await
    }

    /// First drained value matching `predicate`.
    pub async fn first_where<P>(&self, mut predicate: P) -> Result<T, ChannelError>
    where
        P: FnMut(&T) -> bool,
    {
        let drain = self.drain();
        futures::pin_mut!(drain);
        while let Some(item) = drain.next().await {
            let value = item?;
            if predicate(&value) {
                return Ok(value);
            }
        }
        Err(ChannelError::NothingFound)
    }

    /// Value held once the channel is done.
    pub async fn last(&self) -> Result<T, ChannelError> {
        let drain = self.drain();
        futures::pin_mut!(drain);
        let mut last = None;
        while let Some(item) = drain.next().await {
            last = Some(item?);
        }
        match last {
            Some(value) => Ok(value),
            None => self.peek_latest()?.ok_or(ChannelError::NothingFound),
        }
    }

    /// The first value as a pending result that keeps a handle on this
    /// channel.
    pub fn next_result(&self) -> PendingResult<T> {
        let channel = self.clone();
        PendingResult {
            channel: self.clone(),
            result: async move { channel.first().await }.boxed(),
        }
    }

    /// The final value as a pending result that keeps a handle on this
    /// channel.
    pub fn done_result(&self) -> PendingResult<T> {
        let channel = self.clone();
        PendingResult {
            channel: self.clone(),
            result: async move { channel.last().await }.boxed(),
        }
    }
}

/// A single awaited result plus the channel it comes from
pub struct PendingResult<T> {
    channel: ProgressiveChannel<T>,
    result: BoxFuture<'static, Result<T, ChannelError>>,
}

impl<T> PendingResult<T> {
    /// The channel this result is drawn from, for callers that want every
    /// refinement rather than one.
    pub fn channel(&self) -> &ProgressiveChannel<T> {
        &self.channel
    }
}

impl<T> From<PendingResult<T>> for ProgressiveChannel<T> {
    fn from(pending: PendingResult<T>) -> Self {
        pending.channel
    }
}

impl<T> IntoFuture for PendingResult<T> {
    type Output = Result<T, ChannelError>;
    type IntoFuture = BoxFuture<'static, Result<T, ChannelError>>;

    fn into_future(self) -> Self::IntoFuture {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    async fn collect(channel: &ProgressiveChannel<u32>) -> Vec<Result<u32, ChannelError>> {
        channel.drain().collect().await
    }

    fn values(items: Vec<Result<u32, ChannelError>>) -> Vec<u32> {
        items.into_iter().map(|item| item.unwrap()).collect()
    }

    #[test]
    fn test_peek_tracks_latest_push() {
        let channel = ProgressiveChannel::new("peek");
        assert_eq!(channel.peek_latest().unwrap(), None);
        for value in 1..=4u32 {
            channel.push(value, value == 4);
            assert_eq!(channel.peek_latest().unwrap(), Some(value));
        }
        assert!(channel.is_done());
    }

    #[tokio::test]
    async fn test_single_final_push_drains_once() {
        let channel = ProgressiveChannel::new("single");
        channel.push(7, true);
        assert_eq!(values(collect(&channel).await), vec![7]);
    }

    #[tokio::test]
    async fn test_superseded_values_are_skipped() {
        let channel = ProgressiveChannel::new("superseded");
        channel.push(1, false);
        channel.push(2, false);
        channel.push(3, true);
        assert_eq!(values(collect(&channel).await), vec![3]);
    }

    #[tokio::test]
    async fn test_fail_before_drain_raises_first() {
        let channel = ProgressiveChannel::<u32>::new("failed");
        channel.push(1, false);
        channel.fail(LoadError::Cancelled);

        let items = collect(&channel).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0].as_ref().unwrap_err().load_error(),
            Some(LoadError::Cancelled)
        ));
        assert!(channel.peek_latest().is_err());
    }

    #[test]
    fn test_drain_suspends_until_push() {
        let channel = ProgressiveChannel::new("wake");
        let mut drain = task::spawn(channel.drain());

        assert_pending!(drain.poll_next());

        channel.push(1u32, false);
        assert!(drain.is_woken());
        let item = assert_ready!(drain.poll_next());
        assert_eq!(item.unwrap().unwrap(), 1);

        assert_pending!(drain.poll_next());
        channel.push(2, false);
        channel.push(3, true);
        assert!(drain.is_woken());
        let item = assert_ready!(drain.poll_next());
        assert_eq!(item.unwrap().unwrap(), 3);

        assert!(assert_ready!(drain.poll_next()).is_none());
    }

    #[test]
    fn test_fail_wakes_waiting_drain() {
        let channel = ProgressiveChannel::<u32>::new("wake-fail");
        let mut drain = task::spawn(channel.drain());
        assert_pending!(drain.poll_next());

        channel.fail(LoadError::Purged);
        assert!(drain.is_woken());
        assert!(assert_ready!(drain.poll_next()).unwrap().is_err());
        assert!(assert_ready!(drain.poll_next()).is_none());
    }

    #[test]
    fn test_finish_does_not_redeliver() {
        let channel = ProgressiveChannel::new("finish");
        let mut drain = task::spawn(channel.drain());

        channel.push(5u32, false);
        assert_eq!(assert_ready!(drain.poll_next()).unwrap().unwrap(), 5);

        channel.finish();
        assert!(assert_ready!(drain.poll_next()).is_none());
        assert_eq!(channel.peek_latest().unwrap(), Some(5));
    }

    #[test]
    fn test_first_failure_sticks() {
        let channel = ProgressiveChannel::<u32>::new("failures");
        channel.fail(LoadError::Purged);
        channel.fail(LoadError::Cancelled);
        assert!(matches!(
            channel.peek_latest().unwrap_err().load_error(),
            Some(LoadError::Purged)
        ));
    }

    #[tokio::test]
    async fn test_run_producer_marks_done() {
        let channel = ProgressiveChannel::new("producer");
        channel
            .run_producer(|handle| async move {
                handle.push(1u32, false);
                handle.push(2, false);
                Ok::<(), LoadError>(())
            })
            .await;

        assert!(channel.is_done());
        assert_eq!(values(collect(&channel).await), vec![2]);
    }

    #[tokio::test]
    async fn test_producer_error_goes_to_callback_not_channel() {
        let channel = ProgressiveChannel::<u32>::new("producer-error");
        let reported = Arc::new(Mutex::new(None));
        let sink = reported.clone();

        channel
            .run_producer_with(
                |handle| async move {
                    handle.push(1, false);
                    Err("driver broke".to_string())
                },
                move |error| *sink.lock() = Some(error),
            )
            .await;

        assert_eq!(reported.lock().as_deref(), Some("driver broke"));
        assert!(!channel.has_failed());
        assert!(!channel.is_done());
        assert_eq!(channel.peek_latest().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_first_where_and_nothing_found() {
        let channel = ProgressiveChannel::new("first");
        let producer = channel.clone();
        let handle = tokio::spawn(async move {
            for value in [0u32, 0, 9] {
                tokio::task::yield_now().await;
                producer.push(value, value == 9);
            }
        });

        assert_eq!(channel.first_where(|v| *v > 0).await.unwrap(), 9);
        handle.await.unwrap();

        let empty = ProgressiveChannel::<u32>::new("empty");
        empty.finish();
        assert!(matches!(empty.first().await, Err(ChannelError::NothingFound)));
    }

    #[tokio::test]
    async fn test_pending_result_keeps_channel() {
        let channel = ProgressiveChannel::new("pending");
        let pending = channel.done_result();
        assert_eq!(pending.channel().name(), "pending");

        channel.push(1u32, false);
        channel.push(2, true);
        assert_eq!(pending.await.unwrap(), 2);

        let next = channel.next_result();
        let back: ProgressiveChannel<u32> = next.into();
        assert!(back.is_done());
    }

    #[tokio::test]
    async fn test_from_future() {
        let ok = ProgressiveChannel::from_future("ok", async { Ok::<u32, LoadError>(4) });
        assert_eq!(ok.last().await.unwrap(), 4);

        let failed =
            ProgressiveChannel::<u32>::from_future("err", async { Err(LoadError::Cancelled) });
        assert!(failed.first().await.is_err());
    }
}
