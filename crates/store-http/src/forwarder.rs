//! Asynchronous relay of accepted statements to forwarding targets.
//!
//! [`Forwarder::spawn`] starts a worker owning a bounded queue and returns a
//! [`ForwarderHandle`]. The handle implements
//! [`AcceptedStatementsSink`], so a
//! [`StatementStore`](lrs_store::StatementStore) hands every accepted batch
//! to it without waiting.
//!
//! For each batch the worker resolves the target list afresh, skips
//! inactive targets and delivers to the rest concurrently. Every target
//! moves through [`RelayState`] on its own, recorded in
//! [`RelayOutcome::transitions`]:
//!
//! ```text
//! Pending ──▶ Sending ──▶ Delivered
//!                │
//!                └──────▶ Exhausted   (retries used up, or a permanent failure)
//! ```
//!
//! Failures are logged and counted in [`ForwarderStats`]; they never reach
//! the writer that accepted the statements.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fail::fail_point;
use futures::future::join_all;
use lrs_store::{AcceptedStatementsSink, Statement, StoreError};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ForwarderConfig,
    delivery::DeliveryClient,
    retry::with_retry_attempts,
    target::{ForwardingTarget, TargetSource},
};

/// Progress of one batch towards one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayState {
    /// Queued, no attempt made yet.
    Pending,
    /// An attempt (or a retry) is in progress.
    Sending,
    /// The target accepted the batch.
    Delivered,
    /// Every allowed attempt failed; the batch is dropped for this target.
    Exhausted,
}

impl RelayState {
    /// Returns `true` for `Delivered` and `Exhausted`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Exhausted)
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Delivered => "delivered",
            Self::Exhausted => "exhausted",
        };
        f.write_str(label)
    }
}

/// Final result of relaying one batch to one target.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    /// URL of the target.
    pub target: String,
    /// `Delivered` or `Exhausted`.
    pub state: RelayState,
    /// Delivery attempts made.
    pub attempts: u32,
    /// Every state the relay went through, ending with `state`.
    pub transitions: Vec<RelayState>,
    /// Last error, for exhausted relays.
    pub error: Option<String>,
}

/// Process-wide forwarding counters.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    batches_queued: AtomicU64,
    batches_dropped: AtomicU64,
    batches_relayed: AtomicU64,
    deliveries: AtomicU64,
    exhausted: AtomicU64,
}

impl ForwarderStats {
    /// Batches accepted into the queue.
    #[must_use]
    pub fn batches_queued(&self) -> u64 {
        self.batches_queued.load(Ordering::Relaxed)
    }

    /// Batches refused because the queue was full or closed.
    #[must_use]
    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    /// Batches the worker finished relaying.
    #[must_use]
    pub fn batches_relayed(&self) -> u64 {
        self.batches_relayed.load(Ordering::Relaxed)
    }

    /// Successful batch deliveries, counted per target.
    #[must_use]
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    /// Relays that ended `Exhausted`, counted per target.
    #[must_use]
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

fn enter(transitions: &mut Vec<RelayState>, target: &ForwardingTarget, state: RelayState) {
    debug!(url = %target.url, %state, "Relay state changed");
    transitions.push(state);
}

/// Relays batches of statements to the configured targets.
#[derive(Clone)]
pub struct Forwarder {
    source: Arc<dyn TargetSource>,
    client: Arc<dyn DeliveryClient>,
    config: ForwarderConfig,
    stats: Arc<ForwarderStats>,
}

impl Forwarder {
    /// Creates a forwarder.
    #[must_use]
    pub fn new(
        source: Arc<dyn TargetSource>,
        client: Arc<dyn DeliveryClient>,
        config: ForwarderConfig,
    ) -> Self {
        Self { source, client, config, stats: Arc::new(ForwarderStats::default()) }
    }

    /// Counters shared with every handle of this forwarder.
    #[must_use]
    pub fn stats(&self) -> &Arc<ForwarderStats> {
        &self.stats
    }

    /// Returns the active targets for one relay.
    ///
    /// A source error disables forwarding for this batch only.
    fn active_targets(&self) -> Vec<ForwardingTarget> {
        let targets = match self.source.targets() {
            Ok(targets) => targets,
            Err(err) => {
                error!(error = %err, "Cannot resolve forwarding targets; batch not forwarded");
                return Vec::new();
            },
        };
        if targets.is_empty() {
            debug!("No forwarding target configured; forwarding is disabled");
        }
        targets
            .into_iter()
            .filter(|target| {
                if !target.is_active {
                    info!(url = %target.url, "Forwarding target is not active; ignoring it");
                }
                target.is_active
            })
            .collect()
    }

    /// Relays one batch to every active target and waits for all of them.
    ///
    /// Targets are resolved once, at the start of the relay.
    #[tracing::instrument(skip_all, fields(count = statements.len()))]
    pub async fn relay(&self, statements: &[Statement]) -> Vec<RelayOutcome> {
        let targets = self.active_targets();
        let outcomes =
            join_all(targets.iter().map(|target| self.relay_to(target, statements))).await;
        self.stats.batches_relayed.fetch_add(1, Ordering::Relaxed);
        outcomes
    }

    async fn relay_to(&self, target: &ForwardingTarget, statements: &[Statement]) -> RelayOutcome {
        let mut transitions = Vec::with_capacity(3);
        enter(&mut transitions, target, RelayState::Pending);

        enter(&mut transitions, target, RelayState::Sending);
        let retry = self.config.retry_for(target.max_retries);
        let client = self.client.as_ref();
        let (result, attempts) = with_retry_attempts(&retry, "forward", move || async move {
            fail_point!("forwarder-before-deliver", |_| {
                Err(StoreError::backend_unavailable("injected delivery failure"))
            });
            match tokio::time::timeout(target.timeout, client.deliver(target, statements)).await {
                Ok(result) => result.map_err(StoreError::from),
                Err(_) => Err(StoreError::timeout("forward", target.timeout)),
            }
        })
        .await;

        let (state, error) = match result {
            Ok(()) => {
                self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                (RelayState::Delivered, None)
            },
            Err(err) => {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                error!(url = %target.url, attempts, error = %err, "Failed to forward statements");
                (RelayState::Exhausted, Some(err.to_string()))
            },
        };
        enter(&mut transitions, target, state);
        RelayOutcome { target: target.url.clone(), state, attempts, transitions, error }
    }

    /// Starts the relay worker and returns its handle.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn(self) -> ForwarderHandle {
        let (tx, mut rx) = mpsc::channel::<Vec<Statement>>(self.config.queue_capacity());
        let stop = CancellationToken::new();
        let stats = Arc::clone(&self.stats);
        let shutdown_timeout = self.config.shutdown_timeout();
        let cancelled = stop.clone();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    batch = rx.recv() => match batch {
                        Some(batch) => {
                            self.relay(&batch).await;
                        },
                        None => break,
                    },
                    () = cancelled.cancelled() => {
                        rx.close();
                        let mut drained = 0usize;
                        while let Some(batch) = rx.recv().await {
                            self.relay(&batch).await;
                            drained += 1;
                        }
                        debug!(drained, "Forwarding queue drained");
                        break;
                    },
                }
            }
            debug!("Forwarding worker stopped");
        });

        ForwarderHandle {
            queue: tx,
            stop,
            worker: Mutex::new(Some(worker)),
            stats,
            shutdown_timeout,
        }
    }
}

/// Handle to a running forwarder worker.
///
/// Dropping every handle closes the queue; the worker relays what is left
/// and exits.
pub struct ForwarderHandle {
    queue: mpsc::Sender<Vec<Statement>>,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ForwarderStats>,
    shutdown_timeout: Duration,
}

impl fmt::Debug for ForwarderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwarderHandle")
            .field("stopped", &self.stop.is_cancelled())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ForwarderHandle {
    /// Queues a batch for relay without waiting.
    ///
    /// Returns `false` if the batch was dropped because the queue is full or
    /// the worker has stopped.
    pub fn enqueue(&self, statements: Vec<Statement>) -> bool {
        let count = statements.len();
        match self.queue.try_send(statements) {
            Ok(()) => {
                self.stats.batches_queued.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(TrySendError::Full(_)) => {
                self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(count, "Forwarding queue full; batch not forwarded");
                false
            },
            Err(TrySendError::Closed(_)) => {
                self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(count, "Forwarder stopped; batch not forwarded");
                false
            },
        }
    }

    /// Forwarding counters.
    #[must_use]
    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    /// Stops accepting batches, relays the queued ones and waits for the
    /// worker, up to the configured shutdown timeout.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        match tokio::time::timeout(self.shutdown_timeout, worker).await {
            Ok(Ok(())) => info!("Forwarder shut down"),
            Ok(Err(err)) => error!(error = %err, "Forwarding worker failed"),
            Err(_) => warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Forwarder shutdown timed out; remaining batches abandoned"
            ),
        }
    }
}

impl AcceptedStatementsSink for ForwarderHandle {
    fn submit(&self, statements: Vec<Statement>) {
        if self.stop.is_cancelled() {
            self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(count = statements.len(), "Forwarder shutting down; batch not forwarded");
            return;
        }
        self.enqueue(statements);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use lrs_store::testutil::make_statements;

    use super::*;
    use crate::{error::HttpError, target::StaticTargetSource};

    #[derive(Default)]
    struct AlwaysOk;

    #[async_trait]
    impl DeliveryClient for AlwaysOk {
        async fn deliver(
            &self,
            _target: &ForwardingTarget,
            _statements: &[Statement],
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct AlwaysRejects;

    #[async_trait]
    impl DeliveryClient for AlwaysRejects {
        async fn deliver(
            &self,
            target: &ForwardingTarget,
            _statements: &[Statement],
        ) -> crate::error::Result<()> {
            Err(HttpError::Status {
                url: target.url.clone(),
                status: reqwest::StatusCode::UNAUTHORIZED,
                body: String::new(),
            })
        }
    }

    /// Times out the first `failures` attempts, then accepts; records every
    /// accepted batch size.
    #[derive(Default)]
    struct Recording {
        failures: u32,
        calls: AtomicU32,
        delivered: parking_lot::Mutex<Vec<(String, usize)>>,
    }

    impl Recording {
        fn failing(failures: u32) -> Self {
            Self { failures, ..Self::default() }
        }
    }

    #[async_trait]
    impl DeliveryClient for Recording {
        async fn deliver(
            &self,
            target: &ForwardingTarget,
            statements: &[Statement],
        ) -> crate::error::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(HttpError::Timeout { url: target.url.clone() });
            }
            self.delivered.lock().push((target.url.clone(), statements.len()));
            Ok(())
        }
    }

    struct Slow;

    #[async_trait]
    impl DeliveryClient for Slow {
        async fn deliver(
            &self,
            _target: &ForwardingTarget,
            _statements: &[Statement],
        ) -> crate::error::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn target(url: &str) -> ForwardingTarget {
        ForwardingTarget::builder().url(url).max_retries(3).build().unwrap()
    }

    fn forwarder(targets: Vec<ForwardingTarget>, client: Arc<dyn DeliveryClient>) -> Forwarder {
        let config = ForwarderConfig::builder()
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(5))
            .build()
            .unwrap();
        Forwarder::new(Arc::new(StaticTargetSource::new(targets)), client, config)
    }

    #[test]
    fn test_relay_state_terminal() {
        assert!(!RelayState::Pending.is_terminal());
        assert!(!RelayState::Sending.is_terminal());
        assert!(RelayState::Delivered.is_terminal());
        assert!(RelayState::Exhausted.is_terminal());
        assert_eq!(RelayState::Exhausted.to_string(), "exhausted");
    }

    #[tokio::test]
    async fn test_relay_delivers_to_each_active_target() {
        let mut inactive = target("http://c");
        inactive.is_active = false;
        let forwarder =
            forwarder(vec![target("http://a"), target("http://b"), inactive], Arc::new(AlwaysOk));

        let outcomes = forwarder.relay(&make_statements(2)).await;

        let urls: Vec<_> = outcomes.iter().map(|o| o.target.as_str()).collect();
        assert_eq!(urls, ["http://a", "http://b"]);
        assert!(outcomes.iter().all(|o| o.state == RelayState::Delivered && o.attempts == 1));
        assert!(outcomes.iter().all(|o| {
            o.transitions == [RelayState::Pending, RelayState::Sending, RelayState::Delivered]
        }));
        assert_eq!(forwarder.stats().deliveries(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let forwarder = forwarder(vec![target("http://a")], Arc::new(AlwaysRejects));

        let outcomes = forwarder.relay(&make_statements(1)).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].state, RelayState::Exhausted);
        assert_eq!(outcomes[0].attempts, 1);
        assert!(outcomes[0].error.as_deref().unwrap().contains("401"));
        assert_eq!(forwarder.stats().exhausted(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_until_delivered() {
        let client = Arc::new(Recording::failing(2));
        let forwarder = forwarder(vec![target("http://a")], client.clone());

        let outcomes = forwarder.relay(&make_statements(4)).await;

        assert_eq!(outcomes[0].state, RelayState::Delivered);
        assert_eq!(outcomes[0].attempts, 3);
        assert!(outcomes[0].error.is_none());
        assert_eq!(*client.delivered.lock(), [("http://a".to_string(), 4)]);
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_max_retries() {
        let client = Arc::new(Recording::failing(u32::MAX));
        let forwarder = forwarder(vec![target("http://a")], client.clone());

        let outcomes = forwarder.relay(&make_statements(1)).await;

        assert_eq!(outcomes[0].state, RelayState::Exhausted);
        assert_eq!(outcomes[0].attempts, 4);
        assert_eq!(
            outcomes[0].transitions,
            [RelayState::Pending, RelayState::Sending, RelayState::Exhausted]
        );
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
        assert_eq!(forwarder.stats().exhausted(), 1);
        assert_eq!(forwarder.stats().deliveries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_bounds_a_slow_target() {
        let slow = ForwardingTarget::builder()
            .url("http://slow")
            .max_retries(0)
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let forwarder = forwarder(vec![slow], Arc::new(Slow));

        let outcomes = forwarder.relay(&make_statements(1)).await;

        assert_eq!(outcomes[0].state, RelayState::Exhausted);
        assert_eq!(outcomes[0].attempts, 1);
        assert!(outcomes[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_are_relayed_concurrently() {
        let slow = |url: &str| {
            ForwardingTarget::builder()
                .url(url)
                .max_retries(0)
                .timeout(Duration::from_secs(1))
                .build()
                .unwrap()
        };
        let forwarder = forwarder(vec![slow("http://a"), slow("http://b"), slow("http://c")], Arc::new(Slow));

        let start = tokio::time::Instant::now();
        let outcomes = forwarder.relay(&make_statements(1)).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.state == RelayState::Exhausted));
        assert!(start.elapsed() < Duration::from_secs(2), "relayed in {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_target_changes_apply_to_next_batch() {
        let source = Arc::new(StaticTargetSource::new(vec![target("http://a")]));
        let client = Arc::new(Recording::default());
        let forwarder = Forwarder::new(source.clone(), client.clone(), ForwarderConfig::default());

        forwarder.relay(&make_statements(1)).await;
        source.replace(vec![target("http://b")]);
        forwarder.relay(&make_statements(2)).await;

        assert_eq!(
            *client.delivered.lock(),
            [("http://a".to_string(), 1), ("http://b".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_shutdown_relays_queued_batches() {
        let client = Arc::new(Recording::default());
        let handle = forwarder(vec![target("http://a")], client.clone()).spawn();

        handle.submit(make_statements(1));
        handle.submit(make_statements(2));
        handle.submit(make_statements(3));
        handle.shutdown().await;

        let sizes: Vec<_> = client.delivered.lock().iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, [1, 2, 3]);
        assert_eq!(handle.stats().batches_queued(), 3);
        assert_eq!(handle.stats().batches_relayed(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_drops_batch() {
        let config = ForwarderConfig::builder().queue_capacity(1).build().unwrap();
        let source = Arc::new(StaticTargetSource::new(vec![target("http://a")]));
        // Not spawned: nothing drains the queue.
        let (tx, _rx) = mpsc::channel(config.queue_capacity());
        let handle = ForwarderHandle {
            queue: tx,
            stop: CancellationToken::new(),
            worker: Mutex::new(None),
            stats: Arc::clone(Forwarder::new(source, Arc::new(AlwaysOk), config).stats()),
            shutdown_timeout: Duration::from_secs(1),
        };

        assert!(handle.enqueue(make_statements(1)));
        assert!(!handle.enqueue(make_statements(1)));
        assert_eq!(handle.stats().batches_queued(), 1);
        assert_eq!(handle.stats().batches_dropped(), 1);
    }

    #[tokio::test]
    async fn test_no_targets_relays_nothing() {
        let forwarder = forwarder(Vec::new(), Arc::new(AlwaysOk));
        assert!(forwarder.relay(&make_statements(3)).await.is_empty());
        assert_eq!(forwarder.stats().batches_relayed(), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let handle = forwarder(vec![target("http://a")], Arc::new(AlwaysOk)).spawn();
        handle.shutdown().await;
        handle.submit(make_statements(1));
        assert_eq!(handle.stats().batches_dropped(), 1);
        assert_eq!(handle.stats().batches_queued(), 0);
        // Second shutdown is a no-op.
        handle.shutdown().await;
    }
}
