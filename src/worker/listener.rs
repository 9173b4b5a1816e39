//! The listener: claim → handle → ack / requeue / leave, with two explicit
//! entry points for batch ([`Listener::run_once`]) and service
//! ([`Listener::run`]) use.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, warn};

use super::renewal::keep_alive;
use super::{Handler, ListenerConfig, ListenerState, Processed, Step};
use crate::error::Result;
use crate::model::{Message, Payload, now};
use crate::queue::{GetOutcome, Queue};
use crate::telemetry::message::{record_state_transition, start_message_span};
use crate::telemetry::metrics;

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Generic polling consumer over one queue.
pub struct Listener<P, H> {
    queue: Arc<Queue<P>>,
    handler: Arc<H>,
    config: ListenerConfig,
    stop: CancellationToken,
    state: AtomicU8,
}

impl<P: Payload, H: Handler<P>> Listener<P, H> {
    pub fn new(queue: Arc<Queue<P>>, handler: Arc<H>, config: ListenerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
            stop: CancellationToken::new(),
            state: AtomicU8::new(ListenerState::Stopped.as_u8()),
        }
    }

    /// Use an externally owned stop token, e.g. one shared by a worker pool.
    pub fn with_stop_token(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// A clone of the stop token; cancelling it stops this listener.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Ask the loop to stop. A blocked `get` returns promptly; an in-flight
    /// handler is allowed to finish.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ListenerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn renew_interval(&self) -> Duration {
        self.config
            .renew_interval
            .unwrap_or_else(|| self.queue.reset_duration() / 2)
            .max(MIN_RENEW_INTERVAL)
    }

    async fn claim(&self) -> Result<GetOutcome<P>> {
        self.queue
            .get_cancellable(self.config.poll_interval, self.config.wait, &self.stop)
            .await
    }

    /// Run to completion: one claim attempt, at most one message processed.
    pub async fn run_once(&self) -> Result<Step> {
        self.set_state(ListenerState::Running);
        let step = match self.claim().await {
            Ok(GetOutcome::Message(message)) => self.process(message).await.map(Step::Processed),
            Ok(GetOutcome::Empty) => Ok(Step::Idle),
            Ok(GetOutcome::Cancelled) => Ok(Step::Stopped),
            Err(e) => Err(e),
        };
        self.set_state(ListenerState::Stopped);
        step
    }

    /// Run as a service until the stop signal fires.
    ///
    /// Errors never end the loop; they are logged and polling continues.
    pub async fn run(&self) {
        info!(queue = self.queue.name(), "listener started");
        loop {
            self.set_state(ListenerState::Running);
            match self.claim().await {
                Ok(GetOutcome::Message(message)) => {
                    let id = message.id;
                    if let Err(e) = self.process(message).await {
                        error!(queue = self.queue.name(), %id, "failed to settle message: {e}");
                    }
                }
                Ok(GetOutcome::Empty) => {
                    // A zero budget returns at once; pace the loop ourselves.
                    let single_check =
                        self.config.wait.is_zero() || self.config.poll_interval.is_zero();
                    if single_check && self.idle().await {
                        break;
                    }
                }
                Ok(GetOutcome::Cancelled) => break,
                Err(e) => {
                    error!(queue = self.queue.name(), "get failed: {e}");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }
        self.set_state(ListenerState::Stopped);
        info!(queue = self.queue.name(), "listener stopped");
    }

    /// Sleep one poll interval. Returns `true` if stopped meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => true,
            _ = tokio::time::sleep(self.config.poll_interval.max(MIN_RENEW_INTERVAL)) => false,
        }
    }

    async fn process(&self, message: Message<P>) -> Result<Processed> {
        let span = start_message_span(self.queue.name(), &message.id);
        self.set_state(ListenerState::Processing);
        let processed = self.settle(message, &span).instrument(span.clone()).await;
        self.set_state(ListenerState::Running);
        processed
    }

    async fn settle(&self, mut message: Message<P>, span: &Span) -> Result<Processed> {
        record_state_transition(span, "claimed", "processing");

        let started = Instant::now();
        let result = self.handle_with_renewal(&mut message).await;
        metrics::handler_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("queue", self.queue.name().to_string())],
        );

        let processed = match result {
            Ok(()) => {
                self.queue.ack(&message).await?;
                Processed::Acked
            }
            Err(err) => {
                warn!(id = %message.id, retries = message.retries, "handler failed: {err:#}");
                self.handler.on_failure(&message, &err).await;
                self.retry_or_leave(message, &err).await?
            }
        };

        record_state_transition(span, "processing", processed.as_str());
        metrics::listener_outcomes().add(
            1,
            &[
                KeyValue::new("queue", self.queue.name().to_string()),
                KeyValue::new("outcome", processed.as_str()),
            ],
        );
        Ok(processed)
    }

    async fn retry_or_leave(&self, mut message: Message<P>, err: &anyhow::Error) -> Result<Processed> {
        if message.retries == 0 {
            error!(
                queue = self.queue.name(),
                id = %message.id,
                "retries exhausted, message left claimed: {err:#}"
            );
            return Ok(Processed::Exhausted);
        }

        message.retries -= 1;
        let delay = chrono::Duration::from_std(self.config.retry_delay)
            .unwrap_or(chrono::Duration::zero());
        let earliest_get = now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let id = message.id;
        match self.queue.requeue_at(message, earliest_get).await? {
            Some(_) => Ok(Processed::Requeued),
            None => {
                warn!(
                    queue = self.queue.name(),
                    %id,
                    "lease lost before requeue, message left to its holder"
                );
                Ok(Processed::LeaseLost)
            }
        }
    }

    /// Run the handler while a ticker in the same task keeps the lease alive.
    /// The ticker is dropped the moment the handler returns, and `message`
    /// then carries the last lease expiry the store confirmed.
    async fn handle_with_renewal(&self, message: &mut Message<P>) -> anyhow::Result<()> {
        let Some(mut lease) = message.lease() else {
            return self.handler.handle(message).await;
        };

        let every = self.renew_interval();
        let result = tokio::select! {
            result = self.handler.handle(message) => result,
            never = keep_alive(&self.queue, &mut lease, every) => match never {},
        };
        message.reset_timestamp = Some(lease.reset_timestamp);
        result
    }
}
