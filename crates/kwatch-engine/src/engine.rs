//! Pipeline assembly and lifecycle.
//!
//! Messages flow through four stages, each a single task so events for the
//! same (owner, subscription) are never reordered:
//!
//! ```text
//! on_message -> match -> dedup/aggregate -> delay -> dispatch
//! ```
//!
//! Stages are connected by bounded channels. The ingest edge drops and
//! counts when full so a slow pipeline can never block the platform
//! client; internal edges apply backpressure instead. Shutdown flushes
//! open aggregation buckets and the delay heap before the dispatcher
//! stops, so accepted matches are not lost.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::commands::CommandService;
use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::delay::{DelayScheduler, Scheduled};
use crate::dispatcher::{Dispatcher, OperatorAlert};
use crate::error::Result;
use crate::formatter::Formatter;
use crate::matcher::Matcher;
use crate::message::{IncomingMessage, MatchEvent, NotificationPayload};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::quota::QuotaLedger;
use crate::sender::Notifier;
use crate::sources::{SenderBlacklist, SourceRegistry};
use crate::storage::SubscriptionStore;
use crate::subscription::SubscriptionRegistry;

/// How often the dedup map is swept for expired fingerprints.
const DEDUP_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// A running notification engine.
///
/// Cheap to clone the pieces out of; owns the stage tasks until
/// [`EngineHandle::shutdown`].
pub struct EngineHandle {
    ingest_tx: mpsc::Sender<IncomingMessage>,
    commands: Arc<CommandService>,
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<EngineMetrics>,
    alerts: broadcast::Sender<OperatorAlert>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Wire up the registries, load persisted subscriptions, and spawn the
    /// stage tasks.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn SubscriptionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let metrics = Arc::new(EngineMetrics::new());
        let quotas = Arc::new(QuotaLedger::new());
        let sources = Arc::new(SourceRegistry::new());
        let blacklist = Arc::new(SenderBlacklist::new());

        let registry = Arc::new(SubscriptionRegistry::new(
            quotas.clone(),
            store,
            sources.clone(),
            blacklist.clone(),
            config.monitor.max_keywords_per_user,
        ));
        let loaded = registry.load_from_store().await?;
        info!(loaded, "subscription registry ready");

        let matcher = Matcher::new(
            registry.clone(),
            metrics.clone(),
            config.pipeline.match_budget(),
            config.pipeline.max_scan_len,
        );
        let dedup = Arc::new(Deduplicator::new(
            config.dedup.window(),
            config.dedup.enabled,
        ));
        let aggregator = Arc::new(Aggregator::new(&config.aggregation));
        let scheduler = Arc::new(DelayScheduler::new(&config.delay));
        let formatter = Formatter::new(
            config.notification.template.clone(),
            config.format,
            config.context.clone(),
            config.pipeline.max_render_len,
            config.pipeline.aggregate_separator.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            notifier,
            formatter,
            quotas.clone(),
            metrics.clone(),
            config.notification.notifications_per_window,
            config.notification.rate_window(),
            config.notification.max_send_attempts,
            std::time::Duration::from_millis(config.notification.retry_base_ms),
        ));
        let alerts = dispatcher.alert_sender();

        let commands = Arc::new(CommandService::new(
            registry.clone(),
            sources,
            blacklist,
            quotas,
            metrics.clone(),
            config.clone(),
        ));

        let (ingest_tx, ingest_rx) = mpsc::channel(config.pipeline.ingest_buffer);
        let (event_tx, event_rx) = mpsc::channel::<MatchEvent>(config.pipeline.stage_buffer);
        let (delay_tx, delay_rx) =
            mpsc::channel::<NotificationPayload>(config.pipeline.stage_buffer);
        let (send_tx, send_rx) =
            mpsc::channel::<NotificationPayload>(config.pipeline.stage_buffer);

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(match_stage(
                matcher,
                ingest_rx,
                event_tx,
                cancel.child_token(),
            )),
            tokio::spawn(batch_stage(
                dedup,
                aggregator,
                metrics.clone(),
                config.monitor.check_interval(),
                event_rx,
                delay_tx,
            )),
            tokio::spawn(delay_stage(scheduler, metrics.clone(), delay_rx, send_tx)),
            tokio::spawn(dispatch_stage(dispatcher, send_rx)),
        ];

        Ok(Self {
            ingest_tx,
            commands,
            registry,
            metrics,
            alerts,
            cancel,
            tasks,
        })
    }

    /// Offer one message to the pipeline.
    ///
    /// Never blocks: when the ingest buffer is full the message is dropped
    /// and counted, and `false` is returned.
    pub fn on_message(&self, message: IncomingMessage) -> bool {
        match self.ingest_tx.try_send(message) {
            Ok(()) => {
                self.metrics.ingested.increment();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.dropped_backpressure.increment();
                warn!("ingest buffer full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("pipeline is shut down, dropping message");
                false
            }
        }
    }

    /// Command surface backed by this engine's registries.
    pub fn commands(&self) -> Arc<CommandService> {
        self.commands.clone()
    }

    /// The subscription registry, for embedding setups that bypass the
    /// command surface.
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    /// Point-in-time counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Subscribe to operator alerts from the dispatcher.
    pub fn alerts(&self) -> broadcast::Receiver<OperatorAlert> {
        self.alerts.subscribe()
    }

    /// Stop the pipeline, flushing buffered matches and queued delays
    /// through the dispatcher first.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        self.cancel.cancel();
        drop(self.ingest_tx);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("engine stopped");
    }
}

/// Stage 1: evaluate messages against the registry.
async fn match_stage(
    matcher: Matcher,
    mut rx: mpsc::Receiver<IncomingMessage>,
    tx: mpsc::Sender<MatchEvent>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(message) => message,
                None => break,
            },
        };
        let message = Arc::new(message);
        for event in matcher.evaluate(&message) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
    debug!("match stage stopped");
}

/// Stage 2: dedup, then batch into aggregation buckets. The ticker flushes
/// expired buckets so latency stays bounded when traffic goes quiet.
///
/// Exits when the match stage closes its channel; open buckets are flushed
/// downstream first so shutdown loses nothing.
async fn batch_stage(
    dedup: Arc<Deduplicator>,
    aggregator: Arc<Aggregator>,
    metrics: Arc<EngineMetrics>,
    check_interval: std::time::Duration,
    mut rx: mpsc::Receiver<MatchEvent>,
    tx: mpsc::Sender<NotificationPayload>,
) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sweep = tokio::time::interval(DEDUP_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(event) = maybe else { break };
                if !dedup.should_accept(&event) {
                    metrics.deduplicated.increment();
                    continue;
                }
                if let Some(payload) = aggregator.push(event) {
                    if payload.events.len() > 1 {
                        metrics.aggregated_flushes.increment();
                    }
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                for payload in aggregator.flush_expired() {
                    metrics.aggregated_flushes.increment();
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
            }
            _ = sweep.tick() => dedup.sweep(),
        }
    }

    for payload in aggregator.flush_all() {
        let _ = tx.send(payload).await;
    }
    debug!("batch stage stopped");
}

/// Stage 3: hold payloads until their ready time.
///
/// On shutdown (upstream channel closed) queued delays are released
/// early, best-effort.
async fn delay_stage(
    scheduler: Arc<DelayScheduler>,
    metrics: Arc<EngineMetrics>,
    mut rx: mpsc::Receiver<NotificationPayload>,
    tx: mpsc::Sender<NotificationPayload>,
) {
    loop {
        let deadline = scheduler.next_deadline();
        tokio::select! {
            maybe = rx.recv() => {
                let Some(payload) = maybe else { break };
                match scheduler.schedule(payload) {
                    Scheduled::Immediate(payload) => {
                        if tx.send(payload).await.is_err() {
                            return;
                        }
                    }
                    Scheduled::Queued => metrics.delayed.increment(),
                }
            }
            _ = sleep_until_or_forever(deadline) => {
                for payload in scheduler.pop_due() {
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    for payload in scheduler.drain() {
        let _ = tx.send(payload).await;
    }
    debug!("delay stage stopped");
}

/// Stage 4: render and deliver. Runs until every upstream stage has
/// finished flushing, so it takes no cancel token of its own.
async fn dispatch_stage(dispatcher: Arc<Dispatcher>, mut rx: mpsc::Receiver<NotificationPayload>) {
    while let Some(payload) = rx.recv().await {
        // Already counted and logged by the dispatcher; the stage only
        // needs to keep draining.
        if let Err(e) = dispatcher.dispatch(payload).await {
            debug!(error = %e, "notification not delivered");
        }
    }
    debug!("dispatch stage stopped");
}

async fn sleep_until_or_forever(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::filter::SubscriptionFilters;
    use crate::sender::testing::RecordingNotifier;
    use crate::storage::MemoryStore;
    use crate::subscription::SubscriptionKind;
    use std::time::Duration;

    async fn engine_with(
        config: EngineConfig,
    ) -> (EngineHandle, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let handle = EngineHandle::start(config, Arc::new(MemoryStore::new()), notifier.clone())
            .await
            .unwrap();
        (handle, notifier)
    }

    async fn subscribe(handle: &EngineHandle, owner_id: i64, pattern: &str) {
        handle
            .commands()
            .execute(Command::Subscribe {
                owner_id,
                pattern: pattern.to_string(),
                kind: SubscriptionKind::Literal,
                filters: SubscriptionFilters::default(),
            })
            .await
            .unwrap();
    }

    async fn settle() {
        // Paused clock: sleeping lets every stage task run and advance.
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_match_and_send() {
        let (handle, notifier) = engine_with(EngineConfig::default()).await;
        subscribe(&handle, 1, "foo").await;

        assert!(handle.on_message(IncomingMessage::text(10, 1, "some FOO here")));
        settle().await;

        assert_eq!(notifier.sent_count(), 1);
        let (owner, text) = notifier.sent.lock()[0].clone();
        assert_eq!(owner, 1);
        assert!(text.contains("foo"));

        let snapshot = handle.metrics();
        assert_eq!(snapshot.ingested, 1);
        assert_eq!(snapshot.matched, 1);
        assert_eq!(snapshot.sent, 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_text_sends_once_within_window() {
        let (handle, notifier) = engine_with(EngineConfig::default()).await;
        subscribe(&handle, 1, "foo").await;

        handle.on_message(IncomingMessage::text(10, 1, "foo bar"));
        settle().await;
        handle.on_message(IncomingMessage::text(10, 2, "  FOO   bar "));
        settle().await;

        assert_eq!(notifier.sent_count(), 1);
        assert_eq!(handle.metrics().deduplicated, 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_open_aggregation_bucket() {
        let (handle, notifier) = engine_with(EngineConfig::default()).await;
        subscribe(&handle, 1, "foo").await;
        handle
            .registry()
            .set_aggregation(1, "foo", true, None)
            .await
            .unwrap();

        handle.on_message(IncomingMessage::text(10, 1, "foo one"));
        handle.on_message(IncomingMessage::text(10, 2, "foo two"));
        settle().await;
        // Bucket is still open: threshold is 5 and the deadline is 300s out.
        assert_eq!(notifier.sent_count(), 0);

        handle.shutdown().await;
        assert_eq!(notifier.sent_count(), 1);
        let (_, text) = notifier.sent.lock()[0].clone();
        assert!(text.contains("2 aggregated matches"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_notification_released_on_time() {
        let (handle, notifier) = engine_with(EngineConfig::default()).await;
        subscribe(&handle, 1, "foo").await;
        handle.registry().set_delay_all(1, 30).await.unwrap();

        handle.on_message(IncomingMessage::text(10, 1, "foo"));
        settle().await;
        assert_eq!(notifier.sent_count(), 0);
        assert_eq!(handle.metrics().delayed, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(notifier.sent_count(), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_message_sends_nothing() {
        let (handle, notifier) = engine_with(EngineConfig::default()).await;
        subscribe(&handle, 1, "foo").await;

        handle.on_message(IncomingMessage::text(10, 1, "nothing relevant"));
        settle().await;

        assert_eq!(notifier.sent_count(), 0);
        assert_eq!(handle.metrics().matched, 0);
        handle.shutdown().await;
    }
}
