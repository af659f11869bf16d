//! Subscriber / consumer manager
//!
//! Owns every `Subscription` and drives delivery for both modes:
//! - pub/sub subscriptions are handed to the broker's dispatch table and
//!   served by its single listening loop
//! - each point-to-point subscription gets its own consumption loop, which
//!   polls `Broker::consume` and runs the handler on the shared worker pool
//!
//! Stopping is cooperative: `stop_consuming` cancels a shared token that
//! every loop checks between polls, then waits for the loops to return.
//! A handler that is mid-execution is allowed to finish; a pending retry
//! backoff is cut short and its message requeued at once.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{Broker, DeliveryMode, Handler, Message, SharedHandler};
use crate::config::ConsumerSettings;
use crate::subscriber::pool::WorkerPool;
use crate::subscriber::subscription::{SubscribeOptions, Subscription};
use crate::utils::HandlerResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    pub total: usize,
    pub active: usize,
    pub pub_sub_count: usize,
    pub point_to_point_count: usize,
    pub consumer_task_count: usize,
    pub running: bool,
}

struct ConsumerRuntime {
    cancel: CancellationToken,
    pool: Arc<WorkerPool>,
    loops: Vec<JoinHandle<()>>,
}

impl ConsumerRuntime {
    fn spawn_loop(
        &mut self,
        broker: &Arc<Broker>,
        subscription: Arc<Subscription>,
        settings: &ConsumerSettings,
    ) {
        let handle = tokio::spawn(consume_loop(
            Arc::clone(broker),
            subscription,
            Arc::clone(&self.pool),
            self.cancel.clone(),
            LoopTimings::from(settings),
        ));
        self.loops.push(handle);
    }
}

pub struct Subscriber {
    broker: Arc<Broker>,
    settings: ConsumerSettings,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    runtime: Mutex<Option<ConsumerRuntime>>,
}

impl Subscriber {
    pub fn new(broker: Arc<Broker>, settings: ConsumerSettings) -> Self {
        Self {
            broker,
            settings,
            subscriptions: RwLock::new(Vec::new()),
            runtime: Mutex::new(None),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Register `handler` for `event_type`.
    ///
    /// Pub/sub handlers are registered with the broker straight away. A
    /// point-to-point subscription made while consuming is running gets its
    /// loop immediately; otherwise it starts with `start_consuming`.
    pub async fn subscribe<H: Handler>(
        &self,
        event_type: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Arc<Subscription> {
        let handler: SharedHandler = Arc::new(handler);

        let id = match options.delivery_mode {
            DeliveryMode::PubSub => self.broker.subscribe(event_type, Arc::clone(&handler)).await,
            DeliveryMode::PointToPoint => Uuid::new_v4().to_string(),
        };
        let subscription = Arc::new(Subscription::new(id, event_type, handler, options));
        self.subscriptions.write().await.push(Arc::clone(&subscription));

        if subscription.is_point_to_point() {
            if let Some(runtime) = self.runtime.lock().await.as_mut() {
                runtime.spawn_loop(&self.broker, Arc::clone(&subscription), &self.settings);
            }
        }

        tracing::info!(
            subscription_id = %subscription.id,
            %event_type,
            delivery_mode = ?subscription.delivery_mode,
            priority = ?subscription.priority,
            "subscribed"
        );
        subscription
    }

    /// Registration-as-annotation: subscribe `handler` and hand it back
    /// unchanged so it can still be called directly.
    pub async fn on<H: Handler + Clone>(
        &self,
        event_type: &str,
        options: SubscribeOptions,
        handler: H,
    ) -> H {
        self.subscribe(event_type, handler.clone(), options).await;
        handler
    }

    /// Deactivate and forget a subscription. A point-to-point loop notices on
    /// its next poll and exits. Unknown ids return `false`.
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = {
            let mut subscriptions = self.subscriptions.write().await;
            let index = subscriptions.iter().position(|s| s.id == subscription_id);
            index.map(|index| subscriptions.remove(index))
        };
        let Some(subscription) = removed else {
            return false;
        };

        subscription.deactivate();
        if subscription.delivery_mode == DeliveryMode::PubSub {
            self.broker.unsubscribe(&subscription.id).await;
        }
        tracing::info!(
            %subscription_id,
            event_type = %subscription.event_type,
            "unsubscribed"
        );
        true
    }

    pub async fn get_subscriptions(&self, event_type: Option<&str>) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .await
            .iter()
            .filter(|s| event_type.is_none_or(|event_type| s.event_type == event_type))
            .cloned()
            .collect()
    }

    /// Start the broker's listening loop and one consumption loop per active
    /// point-to-point subscription. Does nothing if already running.
    pub async fn start_consuming(&self) {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            tracing::warn!("consuming already started");
            return;
        }

        self.broker.start_listening().await;

        let mut started = ConsumerRuntime {
            cancel: CancellationToken::new(),
            pool: Arc::new(WorkerPool::new(self.settings.workers)),
            loops: Vec::new(),
        };
        for subscription in self.subscriptions.read().await.iter() {
            if subscription.is_active() && subscription.is_point_to_point() {
                started.spawn_loop(&self.broker, Arc::clone(subscription), &self.settings);
            }
        }

        tracing::info!(
            consumers = started.loops.len(),
            workers = started.pool.size(),
            "consuming started"
        );
        *runtime = Some(started);
    }

    /// Start consuming and wait until `stop_consuming` is called elsewhere.
    pub async fn consume_until_stopped(&self) {
        self.start_consuming().await;
        let cancel = match self.runtime.lock().await.as_ref() {
            Some(runtime) => runtime.cancel.clone(),
            None => return,
        };
        cancel.cancelled().await;
    }

    /// Signal every loop to stop at its next poll boundary, wait for them,
    /// stop the listening loop and drain the worker pool.
    pub async fn stop_consuming(&self) {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return;
        };

        runtime.cancel.cancel();
        for handle in runtime.loops {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "consumer loop ended abnormally");
            }
        }
        self.broker.stop_listening().await;
        runtime.pool.shutdown().await;
        tracing::info!("consuming stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    pub async fn get_stats(&self) -> SubscriberStats {
        let (total, active, pub_sub_count, point_to_point_count) = {
            let subscriptions = self.subscriptions.read().await;
            let point_to_point = subscriptions.iter().filter(|s| s.is_point_to_point()).count();
            (
                subscriptions.len(),
                subscriptions.iter().filter(|s| s.is_active()).count(),
                subscriptions.len() - point_to_point,
                point_to_point,
            )
        };

        let runtime = self.runtime.lock().await;
        SubscriberStats {
            total,
            active,
            pub_sub_count,
            point_to_point_count,
            consumer_task_count: runtime
                .as_ref()
                .map_or(0, |r| r.loops.iter().filter(|h| !h.is_finished()).count()),
            running: runtime.is_some(),
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopTimings {
    consume_timeout: Duration,
    handler_timeout: Duration,
    idle_wait: Duration,
}

impl From<&ConsumerSettings> for LoopTimings {
    fn from(settings: &ConsumerSettings) -> Self {
        Self {
            consume_timeout: Duration::from_millis(settings.consume_timeout_ms),
            handler_timeout: Duration::from_millis(settings.handler_timeout_ms),
            idle_wait: Duration::from_millis(settings.idle_wait_ms),
        }
    }
}

async fn consume_loop(
    broker: Arc<Broker>,
    subscription: Arc<Subscription>,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    timings: LoopTimings,
) {
    tracing::debug!(
        subscription_id = %subscription.id,
        event_type = %subscription.event_type,
        "consumer loop started"
    );

    while !cancel.is_cancelled() && subscription.is_active() {
        let handler = Arc::clone(&subscription.handler);
        let pool = &pool;
        let processed = broker
            .consume_with_cancel(
                &subscription.event_type,
                |message| async move {
                    let acked = run_handler(pool, handler, message, timings.handler_timeout).await;
                    HandlerResult::Ok(acked)
                },
                timings.consume_timeout,
                subscription.priority,
                &cancel,
            )
            .await;

        if processed.is_none() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(timings.idle_wait) => {}
            }
        }
    }

    tracing::debug!(
        subscription_id = %subscription.id,
        event_type = %subscription.event_type,
        "consumer loop stopped"
    );
}

/// Run a handler on the pool. Anything but `Ok(true)` within the wait is a
/// failed delivery.
async fn run_handler(
    pool: &WorkerPool,
    handler: SharedHandler,
    message: Message,
    wait: Duration,
) -> bool {
    let message_id = message.id.clone();
    match pool.execute(move || handler.handle(&message), wait).await {
        Ok(Ok(acked)) => acked,
        Ok(Err(err)) => {
            tracing::warn!(%message_id, error = %err, "handler returned an error");
            false
        }
        Err(err) => {
            tracing::error!(%message_id, error = %err, "handler did not complete");
            false
        }
    }
}
