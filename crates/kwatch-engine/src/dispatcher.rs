//! Final pipeline stage: quota check, render, send with retries.
//!
//! Transient send failures are retried with exponential backoff and
//! jitter; permanent failures and exhausted retries are surfaced on an
//! operator alert channel instead of silently dropped.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::formatter::Formatter;
use crate::message::NotificationPayload;
use crate::metrics::EngineMetrics;
use crate::quota::QuotaLedger;
use crate::sender::{Notifier, SendError, SendOptions};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A delivery problem the operator should know about.
#[derive(Debug, Clone)]
pub struct OperatorAlert {
    pub owner_id: i64,
    pub subscription_id: u64,
    pub reason: String,
}

/// Delivers rendered notifications through the external [`Notifier`].
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    formatter: Formatter,
    quotas: Arc<QuotaLedger>,
    metrics: Arc<EngineMetrics>,
    ceiling: u32,
    window: Duration,
    max_attempts: u32,
    retry_base: Duration,
    alerts: broadcast::Sender<OperatorAlert>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        notifier: Arc<dyn Notifier>,
        formatter: Formatter,
        quotas: Arc<QuotaLedger>,
        metrics: Arc<EngineMetrics>,
        ceiling: u32,
        window: Duration,
        max_attempts: u32,
        retry_base: Duration,
    ) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            notifier,
            formatter,
            quotas,
            metrics,
            ceiling,
            window,
            max_attempts: max_attempts.max(1),
            retry_base,
            alerts,
        }
    }

    /// Subscribe to operator alerts (permanent failures, exhausted retries).
    pub fn alerts(&self) -> broadcast::Receiver<OperatorAlert> {
        self.alerts.subscribe()
    }

    /// Handle for subscribing to alerts after the dispatcher moves into
    /// its stage task.
    pub fn alert_sender(&self) -> broadcast::Sender<OperatorAlert> {
        self.alerts.clone()
    }

    /// Render and deliver one notification.
    ///
    /// A notification over the owner's rate ceiling is dropped and counted,
    /// never queued for later (`Error::RateLimited`). A delivery that fails
    /// permanently or exhausts its retries returns the window slot it had
    /// reserved, so the rate counter only ever reflects delivered
    /// notifications. The caller logs and moves on; the pipeline keeps
    /// flowing either way.
    pub async fn dispatch(&self, payload: NotificationPayload) -> Result<()> {
        if !self
            .quotas
            .try_acquire_send(payload.owner_id, self.ceiling, self.window)
        {
            self.metrics.rate_limited.increment();
            warn!(
                owner_id = payload.owner_id,
                pattern = %payload.pattern,
                "notification dropped at rate ceiling"
            );
            return Err(Error::RateLimited(payload.owner_id));
        }

        let text = self.formatter.render(&payload);
        let opts = SendOptions {
            format: self.formatter.effective_flags(&payload.policy),
        };
        if let Err(err) = self.deliver_with_retries(&payload, &text, &opts).await {
            self.quotas.release_send(payload.owner_id);
            self.metrics.send_failures.increment();
            error!(
                owner_id = payload.owner_id,
                subscription_id = payload.subscription_id,
                %err,
                "notification delivery failed"
            );
            let _ = self.alerts.send(OperatorAlert {
                owner_id: payload.owner_id,
                subscription_id: payload.subscription_id,
                reason: err.to_string(),
            });
            return Err(err.into());
        }
        self.metrics.sent.increment();
        debug!(
            owner_id = payload.owner_id,
            events = payload.events.len(),
            "notification sent"
        );

        // Forward copies are best-effort: one attempt each, charged to no
        // one's rate window, and a failed copy never fails the dispatch.
        for target in &payload.policy.forward_to {
            match self.notifier.send(*target, &text, &opts).await {
                Ok(()) => self.metrics.sent.increment(),
                Err(err) => {
                    self.metrics.send_failures.increment();
                    warn!(
                        owner_id = payload.owner_id,
                        target,
                        %err,
                        "forward copy failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn deliver_with_retries(
        &self,
        payload: &NotificationPayload,
        text: &str,
        opts: &SendOptions,
    ) -> std::result::Result<(), SendError> {
        let mut attempt = 1u32;
        loop {
            match self.notifier.send(payload.owner_id, text, opts).await {
                Ok(()) => return Ok(()),
                Err(err @ SendError::Transient(_)) if attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        owner_id = payload.owner_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Exponential backoff with jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .retry_base
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(MAX_BACKOFF);
        let jitter = rand::rng().random_range(0.8..1.2);
        exp.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, FormatFlags};
    use crate::message::{IncomingMessage, MatchEvent};
    use crate::sender::testing::RecordingNotifier;
    use crate::subscription::DeliveryPolicy;
    use chrono::Utc;

    fn payload(owner: i64) -> NotificationPayload {
        NotificationPayload::from_events(vec![MatchEvent {
            owner_id: owner,
            subscription_id: 7,
            pattern: "foo".to_string(),
            policy: DeliveryPolicy::default(),
            message: Arc::new(IncomingMessage::text(1, 1, "foo happened")),
            matched_at: Utc::now(),
        }])
        .unwrap()
    }

    fn dispatcher(
        notifier: Arc<RecordingNotifier>,
        metrics: Arc<EngineMetrics>,
        quotas: Arc<QuotaLedger>,
        ceiling: u32,
    ) -> Dispatcher {
        let formatter = Formatter::new(
            "{keyword} in {group_name}",
            FormatFlags::default(),
            ContextConfig::default(),
            4_000,
            "\n",
        );
        Dispatcher::new(
            notifier,
            formatter,
            quotas,
            metrics,
            ceiling,
            Duration::from_secs(60),
            3,
            Duration::from_millis(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_send_counts() {
        let notifier = Arc::new(RecordingNotifier::new());
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher =
            dispatcher(notifier.clone(), metrics.clone(), Arc::new(QuotaLedger::new()), 30);

        dispatcher.dispatch(payload(1)).await.unwrap();

        assert_eq!(notifier.sent_count(), 1);
        assert_eq!(metrics.snapshot().sent, 1);
        let (owner, text) = notifier.sent.lock()[0].clone();
        assert_eq!(owner, 1);
        assert!(text.starts_with("foo in "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.fail_next_transient(2);
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher =
            dispatcher(notifier.clone(), metrics.clone(), Arc::new(QuotaLedger::new()), 30);

        dispatcher.dispatch(payload(1)).await.unwrap();

        assert_eq!(notifier.sent_count(), 1);
        assert_eq!(metrics.snapshot().sent, 1);
        assert_eq!(metrics.snapshot().send_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_alert_the_operator() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.fail_next_transient(3);
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher =
            dispatcher(notifier.clone(), metrics.clone(), Arc::new(QuotaLedger::new()), 30);
        let mut alerts = dispatcher.alerts();

        let err = dispatcher.dispatch(payload(1)).await.unwrap_err();

        assert!(matches!(err, Error::TransientSend(_)));
        assert_eq!(notifier.sent_count(), 0);
        assert_eq!(metrics.snapshot().send_failures, 1);
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.owner_id, 1);
        assert_eq!(alert.subscription_id, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.fail_next_permanent(1);
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher =
            dispatcher(notifier.clone(), metrics.clone(), Arc::new(QuotaLedger::new()), 30);
        let mut alerts = dispatcher.alerts();

        // One permanent rejection, no retry, no delivery.
        let err = dispatcher.dispatch(payload(1)).await.unwrap_err();

        assert!(matches!(err, Error::PermanentSend(_)));
        assert_eq!(notifier.sent_count(), 0);
        assert_eq!(metrics.snapshot().send_failures, 1);
        assert!(alerts.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_ceiling_drops_without_sending() {
        let notifier = Arc::new(RecordingNotifier::new());
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher =
            dispatcher(notifier.clone(), metrics.clone(), Arc::new(QuotaLedger::new()), 1);

        dispatcher.dispatch(payload(1)).await.unwrap();
        let err = dispatcher.dispatch(payload(1)).await.unwrap_err();

        assert!(matches!(err, Error::RateLimited(1)));
        assert_eq!(notifier.sent_count(), 1);
        assert_eq!(metrics.snapshot().sent, 1);
        assert_eq!(metrics.snapshot().rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_returns_the_window_slot() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.fail_next_permanent(1);
        let metrics = Arc::new(EngineMetrics::new());
        let quotas = Arc::new(QuotaLedger::new());
        let dispatcher = dispatcher(notifier.clone(), metrics.clone(), quotas.clone(), 1);

        assert!(dispatcher.dispatch(payload(1)).await.is_err());
        assert_eq!(quotas.sent_in_window(1), 0);

        // The released slot admits the next notification despite ceiling 1.
        dispatcher.dispatch(payload(1)).await.unwrap();
        assert_eq!(notifier.sent_count(), 1);
        assert_eq!(quotas.sent_in_window(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_targets_receive_copies() {
        let notifier = Arc::new(RecordingNotifier::new());
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher =
            dispatcher(notifier.clone(), metrics.clone(), Arc::new(QuotaLedger::new()), 30);

        let mut payload = payload(1);
        payload.policy.forward_to = vec![50, 51];
        dispatcher.dispatch(payload).await.unwrap();

        let sent = notifier.sent.lock().clone();
        let owners: Vec<i64> = sent.iter().map(|(owner, _)| *owner).collect();
        assert_eq!(owners, vec![1, 50, 51]);
        // All three got the same rendered text.
        assert!(sent.iter().all(|(_, text)| text == &sent[0].1));
        assert_eq!(metrics.snapshot().sent, 3);
    }
}
