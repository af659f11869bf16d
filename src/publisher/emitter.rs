//! Publisher facade
//!
//! `Publisher` wraps one shared `Broker` and adds:
//! - the canonical envelope around every payload
//! - convenience variants (high priority, point-to-point, field emit)
//! - ordered batch publishing with a per-event report
//! - `trigger`, which turns a plain function into one that publishes an
//!   event describing each call after it returns
//!
//! It holds no transport state of its own and is cheap to clone.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};

use crate::broker::{Broker, Priority, PublishOptions};
use crate::publisher::batch::{BatchError, BatchEvent, BatchReport};
use crate::publisher::envelope::Envelope;

#[derive(Clone)]
pub struct Publisher {
    broker: Arc<Broker>,
}

impl Publisher {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Wrap `payload` in an envelope and hand it to the broker.
    /// `options.metadata` ends up in the envelope, not in the message.
    pub async fn publish(&self, event_type: &str, payload: Value, mut options: PublishOptions) -> bool {
        let envelope = Envelope::new(payload, options.metadata.take());
        self.broker
            .publish(event_type, envelope.into_value(), options)
            .await
    }

    pub async fn publish_high_priority(
        &self,
        event_type: &str,
        payload: Value,
        options: PublishOptions,
    ) -> bool {
        self.publish(event_type, payload, options.priority(Priority::High))
            .await
    }

    pub async fn publish_point_to_point(
        &self,
        event_type: &str,
        payload: Value,
        options: PublishOptions,
    ) -> bool {
        self.publish(event_type, payload, options.point_to_point())
            .await
    }

    /// Publish any serializable value (usually a struct or a `json!` map of
    /// fields) as the payload with default options.
    pub async fn emit<T: Serialize + ?Sized>(&self, event_type: &str, fields: &T) -> bool {
        match serde_json::to_value(fields) {
            Ok(payload) => {
                self.publish(event_type, payload, PublishOptions::default())
                    .await
            }
            Err(err) => {
                tracing::error!(%event_type, error = %err, "failed to serialize event fields");
                false
            }
        }
    }

    /// Publish `events` in order.
    ///
    /// A failed event is recorded in the report; with `continue_on_error`
    /// the rest are still attempted, otherwise the batch stops there.
    pub async fn batch_publish(&self, events: Vec<BatchEvent>, continue_on_error: bool) -> BatchReport {
        let mut report = BatchReport {
            total: events.len(),
            ..BatchReport::default()
        };

        for (index, event) in events.into_iter().enumerate() {
            let options = PublishOptions::default()
                .priority(event.priority.unwrap_or_default())
                .delivery_mode(event.delivery_mode.unwrap_or_default());

            if self.publish(&event.event_type, event.payload, options).await {
                report.success += 1;
                continue;
            }

            report.failed += 1;
            report.errors.push(BatchError {
                index,
                event_type: event.event_type,
                error: "publish failed".to_string(),
            });
            if !continue_on_error {
                tracing::warn!(index, total = report.total, "batch aborted on failed event");
                break;
            }
        }

        tracing::info!(
            total = report.total,
            success = report.success,
            failed = report.failed,
            "batch published"
        );
        report
    }

    /// Wrap `f` so that every call publishes `event_type` after `f` returns.
    ///
    /// The event payload is `{ "function": name, "args": ..., "result": ... }`.
    /// The wrapped function returns `f`'s result unchanged, even if the
    /// publish fails.
    pub fn trigger<A, R, F>(
        &self,
        event_type: &str,
        name: &str,
        f: F,
    ) -> impl Fn(A) -> BoxFuture<'static, R> + Send + Sync + 'static
    where
        A: Serialize + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let publisher = self.clone();
        let event_type = event_type.to_string();
        let name = name.to_string();
        let f = Arc::new(f);

        move |args: A| {
            let publisher = publisher.clone();
            let event_type = event_type.clone();
            let name = name.clone();
            let f = Arc::clone(&f);

            Box::pin(async move {
                let recorded_args = to_value_or_null(&args);
                let result = f(args);
                let payload = json!({
                    "function": name,
                    "args": recorded_args,
                    "result": to_value_or_null(&result),
                });
                if !publisher
                    .publish(&event_type, payload, PublishOptions::default())
                    .await
                {
                    tracing::warn!(%event_type, function = %name, "trigger event was not published");
                }
                result
            })
        }
    }
}

fn to_value_or_null<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "value not serializable, recorded as null");
        Value::Null
    })
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("broker", &self.broker)
            .finish()
    }
}
