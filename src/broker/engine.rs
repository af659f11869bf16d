//! Broker engine
//!
//! This module contains the broker responsible for:
//! - publishing messages as broadcasts (pub/sub) or onto priority-tiered
//!   lists (point-to-point)
//! - keeping the in-process table of pub/sub handlers and running the single
//!   listening loop that dispatches broadcasts to them
//! - popping point-to-point messages highest tier first, and applying the
//!   retry/backoff/dead-letter policy when a handler fails
//! - queue and health introspection
//!
//! Concurrency and usage notes:
//! - The broker is shared as `Arc<Broker>`; every method takes `&self`.
//! - Store access goes through `Connection`, which pings and reconnects.
//!   Transport failures never escape the public API: they are logged and
//!   surface as `false`, `None` or `0`.
//! - Handlers are never invoked while the topic table lock is held.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::connection::{Connection, with_connection};
use crate::broker::message::{
    DEFAULT_SOURCE, DeliveryMode, Message, Priority, channel_name,
    dead_letter_name, now_secs, queue_name,
};
use crate::broker::retry::RetryPolicy;
use crate::broker::topic::{SharedHandler, SubscriptionId, Topic};
use crate::config::BrokerSettings;
use crate::persistence::{Published, Store};
use crate::utils::{BrokerError, HandlerResult, StoreError};

/// How long `subscribe`/`start_listening` wait for the listening loop to
/// pick up a registration change.
const LISTENER_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause before the listening loop retries a failed channel subscription.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Per-publish knobs. `Default` gives NORMAL priority, pub/sub delivery, a
/// fresh correlation id and the broker's default retry budget.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    pub delivery_mode: DeliveryMode,
    pub correlation_id: Option<String>,
    pub source: Option<String>,
    pub max_retries: Option<u32>,
    /// Only read by `Publisher`, which copies it into the envelope.
    pub metadata: Option<Value>,
}

impl PublishOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn point_to_point(self) -> Self {
        self.delivery_mode(DeliveryMode::PointToPoint)
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub connected: bool,
    pub listening: bool,
    pub subscribers: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.connected
    }
}

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Broker {
    connection: Connection,
    topics: RwLock<HashMap<String, Topic>>,
    subscription_index: RwLock<HashMap<SubscriptionId, String>>,
    retry: RetryPolicy,
    poll_interval: Duration,
    default_max_retries: u32,
    listener: Mutex<Option<Listener>>,
    listening: AtomicBool,
    /// Bumped whenever the set of pub/sub registrations changes.
    topology: watch::Sender<u64>,
    /// Last topology generation the running loop subscribed for; `None`
    /// until the loop has subscribed once since it was started.
    applied: watch::Sender<Option<u64>>,
}

impl Broker {
    pub fn new(store: Arc<dyn Store>, settings: &BrokerSettings) -> Self {
        Self {
            connection: Connection::new(store),
            topics: RwLock::new(HashMap::new()),
            subscription_index: RwLock::new(HashMap::new()),
            retry: RetryPolicy::new(
                Duration::from_millis(settings.retry_base_delay_ms),
                Duration::from_millis(settings.retry_max_delay_ms),
            ),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            default_max_retries: settings.default_max_retries,
            listener: Mutex::new(None),
            listening: AtomicBool::new(false),
            topology: watch::channel(0).0,
            applied: watch::channel(None).0,
        }
    }

    /// Broker with default settings over `store`.
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self::new(store, &BrokerSettings::default())
    }

    /// Build a message from `options` and send it. Never fails loudly:
    /// transport and serialization errors are logged and return `false`.
    pub async fn publish(&self, event_type: &str, payload: Value, options: PublishOptions) -> bool {
        let message = self.build_message(event_type, payload, &options);
        self.publish_message(&message).await
    }

    /// Send an already built message according to its delivery mode.
    pub async fn publish_message(&self, message: &Message) -> bool {
        match self.send(message).await {
            Ok(()) => {
                tracing::debug!(
                    message_id = %message.id,
                    event_type = %message.event_type,
                    priority = ?message.priority,
                    delivery_mode = ?message.delivery_mode,
                    "message published"
                );
                true
            }
            Err(err) => {
                tracing::error!(
                    message_id = %message.id,
                    event_type = %message.event_type,
                    error = %err,
                    "failed to publish message"
                );
                false
            }
        }
    }

    fn build_message(&self, event_type: &str, payload: Value, options: &PublishOptions) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            payload,
            timestamp: now_secs(),
            priority: options.priority,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.default_max_retries),
            delivery_mode: options.delivery_mode,
            correlation_id: options
                .correlation_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            source: options
                .source
                .clone()
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
        }
    }

    async fn send(&self, message: &Message) -> Result<(), BrokerError> {
        match message.delivery_mode {
            DeliveryMode::PubSub => {
                let data = message.to_json()?;
                let channel = channel_name(&message.event_type);
                let receivers =
                    with_connection!(self.connection, |store| store.publish(&channel, &data))?;
                tracing::trace!(%channel, receivers, "broadcast sent");
            }
            DeliveryMode::PointToPoint => self.enqueue(message).await?,
        }
        Ok(())
    }

    /// Push onto the list for the message's own priority tier.
    async fn enqueue(&self, message: &Message) -> Result<(), BrokerError> {
        let data = message.to_json()?;
        let key = queue_name(&message.event_type, message.priority);
        let len = with_connection!(self.connection, |store| store.push(&key, &data))?;
        tracing::trace!(queue = %key, len, "message queued");
        Ok(())
    }

    /// Register a pub/sub handler for `event_type`.
    ///
    /// The transport subscription is made by the listening loop; if it is
    /// already running this waits briefly until the loop has picked up the
    /// new channel.
    pub async fn subscribe(&self, event_type: &str, handler: SharedHandler) -> SubscriptionId {
        let id = Uuid::new_v4().to_string();
        self.topics
            .write()
            .await
            .entry(event_type.to_string())
            .or_insert_with(|| Topic::new(event_type))
            .subscribe(id.clone(), handler);
        self.subscription_index
            .write()
            .await
            .insert(id.clone(), event_type.to_string());

        tracing::info!(subscription_id = %id, %event_type, "pub/sub handler registered");
        self.topology_changed().await;
        id
    }

    /// Remove a pub/sub handler. Unknown ids are a no-op returning `false`.
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let Some(event_type) = self.subscription_index.write().await.remove(subscription_id) else {
            return false;
        };

        let removed = {
            let mut topics = self.topics.write().await;
            let removed = topics
                .get_mut(&event_type)
                .is_some_and(|topic| topic.unsubscribe(subscription_id));
            if topics.get(&event_type).is_some_and(Topic::is_empty) {
                topics.remove(&event_type);
            }
            removed
        };

        if removed {
            tracing::info!(%subscription_id, %event_type, "pub/sub handler removed");
            self.topology_changed().await;
        }
        removed
    }

    pub async fn subscriber_count(&self, event_type: &str) -> usize {
        self.topics.read().await.get(event_type).map_or(0, Topic::len)
    }

    pub async fn subscriber_counts(&self) -> BTreeMap<String, usize> {
        self.topics
            .read()
            .await
            .iter()
            .map(|(name, topic)| (name.clone(), topic.len()))
            .collect()
    }

    async fn topology_changed(&self) {
        let mut generation = 0;
        self.topology.send_modify(|g| {
            *g += 1;
            generation = *g;
        });
        if self.is_listening() {
            self.wait_for_listener(generation).await;
        }
    }

    async fn wait_for_listener(&self, generation: u64) {
        let mut applied = self.applied.subscribe();
        let synced =
            tokio::time::timeout(LISTENER_SYNC_TIMEOUT, applied.wait_for(|g| {
                g.is_some_and(|g| g >= generation)
            }))
            .await;
        if !matches!(synced, Ok(Ok(_))) {
            tracing::warn!(generation, "listening loop has not caught up with subscriptions");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Start the single pub/sub listening loop. Calling it again while the
    /// loop is running does nothing.
    pub async fn start_listening(self: &Arc<Self>) {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        self.applied.send_replace(None);
        self.listening.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(Arc::clone(self).listen(cancel.clone()));
        *listener = Some(Listener { cancel, handle });
        drop(listener);

        tracing::info!("listening loop started");
        let generation = *self.topology.borrow();
        self.wait_for_listener(generation).await;
    }

    /// Stop the listening loop and wait for it to exit.
    pub async fn stop_listening(&self) {
        let Some(Listener { cancel, handle }) = self.listener.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "listening loop ended abnormally");
        }
        self.listening.store(false, Ordering::SeqCst);
        tracing::info!("listening loop stopped");
    }

    async fn listen(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.topology.subscribe();

        'subscribe: loop {
            let generation = *changes.borrow_and_update();
            let channels = self.channel_names().await;

            let mut subscription =
                match with_connection!(self.connection, |store| store.subscribe(&channels)) {
                    Ok(subscription) => subscription,
                    Err(err) => {
                        tracing::error!(error = %err, "channel subscription failed");
                        if pause(&cancel, RESUBSCRIBE_BACKOFF).await {
                            continue 'subscribe;
                        }
                        break 'subscribe;
                    }
                };
            self.applied.send_replace(Some(generation));
            tracing::debug!(channels = channels.len(), generation, "listening on channels");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'subscribe,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break 'subscribe;
                        }
                        // retarget the live receiver; anything it already
                        // buffered stays queued for dispatch
                        let generation = *changes.borrow_and_update();
                        let channels = self.channel_names().await;
                        subscription.set_channels(&channels);
                        self.applied.send_replace(Some(generation));
                        tracing::debug!(channels = channels.len(), generation, "channel set updated");
                    }
                    received = subscription.recv() => match received {
                        Ok(published) => self.dispatch(&published).await,
                        Err(err) => {
                            tracing::warn!(error = %err, "channel subscription ended, resubscribing");
                            if pause(&cancel, RESUBSCRIBE_BACKOFF).await {
                                continue 'subscribe;
                            }
                            break 'subscribe;
                        }
                    },
                }
            }
        }

        self.listening.store(false, Ordering::SeqCst);
    }

    async fn channel_names(&self) -> Vec<String> {
        self.topics
            .read()
            .await
            .keys()
            .map(|event_type| channel_name(event_type))
            .collect()
    }

    /// Invoke every handler registered for the message's event type, in
    /// registration order. Each handler runs on the blocking pool so a slow
    /// one does not stall the runtime. A failing or panicking handler is
    /// logged and does not stop the rest.
    async fn dispatch(&self, published: &Published) {
        let message = match Message::from_json(&published.data) {
            Ok(message) => Arc::new(message),
            Err(err) => {
                tracing::error!(channel = %published.channel, error = %err, "dropping malformed broadcast");
                return;
            }
        };

        let handlers = match self.topics.read().await.get(&message.event_type) {
            Some(topic) => topic.handlers(),
            None => return,
        };

        for (subscription_id, handler) in handlers {
            let delivered = Arc::clone(&message);
            match tokio::task::spawn_blocking(move || handler.handle(&delivered)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => tracing::warn!(
                    %subscription_id,
                    message_id = %message.id,
                    "pub/sub handler reported failure"
                ),
                Ok(Err(err)) => tracing::error!(
                    %subscription_id,
                    message_id = %message.id,
                    error = %err,
                    "pub/sub handler failed"
                ),
                Err(err) => tracing::error!(
                    %subscription_id,
                    message_id = %message.id,
                    error = %err,
                    "pub/sub handler did not complete"
                ),
            }
        }
    }

    /// Pop one point-to-point message and run `handler` on it.
    ///
    /// Tiers are checked CRITICAL down to LOW on every poll; `priority_hint`
    /// only names the base queue used in logs. Waits up to `timeout` for a
    /// message. A handler returning `Ok(false)` or `Err` sends the message
    /// through the retry policy. Returns the message that was processed, or
    /// `None` if nothing arrived or the store is unreachable.
    pub async fn consume<F, Fut>(
        &self,
        event_type: &str,
        handler: F,
        timeout: Duration,
        priority_hint: Priority,
    ) -> Option<Message>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = HandlerResult>,
    {
        let never = CancellationToken::new();
        self.consume_with_cancel(event_type, handler, timeout, priority_hint, &never)
            .await
    }

    /// `consume` that gives up early once `cancel` fires.
    ///
    /// Cancellation ends the wait for a message and cuts a pending retry
    /// backoff short: the failed message is requeued right away instead of
    /// after the delay. A handler that is already running is not interrupted.
    pub async fn consume_with_cancel<F, Fut>(
        &self,
        event_type: &str,
        handler: F,
        timeout: Duration,
        priority_hint: Priority,
        cancel: &CancellationToken,
    ) -> Option<Message>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = HandlerResult>,
    {
        let base_queue = queue_name(event_type, priority_hint);
        let deadline = Instant::now() + timeout;

        let message = loop {
            match self.pop_highest(event_type).await {
                Ok(Some(message)) => break message,
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(queue = %base_queue, error = %err, "consume failed");
                    return None;
                }
            }
            let now = Instant::now();
            if now >= deadline || !pause(cancel, self.poll_interval.min(deadline - now)).await {
                return None;
            }
        };

        tracing::debug!(
            queue = %base_queue,
            message_id = %message.id,
            priority = ?message.priority,
            retry_count = message.retry_count,
            "message dequeued"
        );

        match handler(message.clone()).await {
            Ok(true) => {
                tracing::debug!(message_id = %message.id, "message acknowledged");
            }
            Ok(false) => {
                tracing::warn!(message_id = %message.id, "handler reported failure");
                self.retry(&message, cancel).await;
            }
            Err(err) => {
                tracing::error!(message_id = %message.id, error = %err, "handler failed");
                self.retry(&message, cancel).await;
            }
        }

        Some(message)
    }

    /// Pop from the highest non-empty tier. Malformed entries are dropped.
    async fn pop_highest(&self, event_type: &str) -> Result<Option<Message>, StoreError> {
        for priority in Priority::DESCENDING {
            let key = queue_name(event_type, priority);
            while let Some(data) = with_connection!(self.connection, |store| store.pop(&key))? {
                match Message::from_json(&data) {
                    Ok(message) => return Ok(Some(message)),
                    Err(err) => {
                        tracing::error!(queue = %key, error = %err, "dropping malformed message");
                    }
                }
            }
        }
        Ok(None)
    }

    /// Count a failed attempt: dead-letter once the budget is spent,
    /// otherwise back off and requeue at the original tier.
    async fn retry(&self, message: &Message, cancel: &CancellationToken) {
        let next = message.next_attempt();
        if next.retries_exhausted() {
            self.dead_letter(next).await;
            return;
        }

        let delay = self.retry.delay_for(next.retry_count);
        tracing::info!(
            message_id = %next.id,
            retry_count = next.retry_count,
            max_retries = next.max_retries,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        if !pause(cancel, delay).await {
            tracing::info!(message_id = %next.id, "backoff interrupted, requeueing now");
        }

        if let Err(err) = self.enqueue(&next).await {
            tracing::error!(message_id = %next.id, error = %err, "failed to requeue message");
        }
    }

    async fn dead_letter(&self, mut message: Message) {
        let mut payload = match std::mem::take(&mut message.payload) {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        payload.insert("_dead_reason".into(), Value::from("max_retries_exceeded"));
        payload.insert("_dead_time".into(), Value::from(now_secs()));
        message.payload = Value::Object(payload);

        let key = dead_letter_name(&message.event_type);
        let pushed = match message.to_json() {
            Ok(data) => with_connection!(self.connection, |store| store.push(&key, &data))
                .map_err(BrokerError::from),
            Err(err) => Err(err.into()),
        };

        match pushed {
            Ok(_) => tracing::error!(
                message_id = %message.id,
                event_type = %message.event_type,
                retry_count = message.retry_count,
                "message moved to dead-letter queue"
            ),
            Err(err) => tracing::error!(
                message_id = %message.id,
                error = %err,
                "failed to dead-letter message"
            ),
        }
    }

    /// Length of one tier, or of all live tiers when `priority` is `None`.
    pub async fn get_queue_length(&self, event_type: &str, priority: Option<Priority>) -> usize {
        let tiers = match priority {
            Some(priority) => vec![priority],
            None => Priority::DESCENDING.to_vec(),
        };

        let mut total = 0;
        for tier in tiers {
            total += self.list_len(&queue_name(event_type, tier)).await;
        }
        total
    }

    pub async fn dead_letter_length(&self, event_type: &str) -> usize {
        self.list_len(&dead_letter_name(event_type)).await
    }

    async fn list_len(&self, key: &str) -> usize {
        match with_connection!(self.connection, |store| store.len(key)) {
            Ok(len) => len,
            Err(err) => {
                tracing::warn!(queue = %key, error = %err, "failed to read queue length");
                0
            }
        }
    }

    /// Drop every live tier for `event_type`. The dead-letter queue is kept.
    pub async fn clear_queue(&self, event_type: &str) -> bool {
        let mut ok = true;
        for priority in Priority::DESCENDING {
            let key = queue_name(event_type, priority);
            if let Err(err) = with_connection!(self.connection, |store| store.delete(&key)) {
                tracing::error!(queue = %key, error = %err, "failed to clear queue");
                ok = false;
            }
        }
        ok
    }

    /// Peek at the dead-letter queue without removing anything.
    pub async fn dead_letters(&self, event_type: &str) -> Vec<Message> {
        let key = dead_letter_name(event_type);
        match with_connection!(self.connection, |store| store.range(&key)) {
            Ok(entries) => entries
                .iter()
                .filter_map(|data| Message::from_json(data).ok())
                .collect(),
            Err(err) => {
                tracing::warn!(queue = %key, error = %err, "failed to read dead letters");
                Vec::new()
            }
        }
    }

    /// Move every dead-lettered message back onto its live tier with a fresh
    /// retry budget. Returns how many were replayed.
    pub async fn replay_dead_letters(&self, event_type: &str) -> usize {
        let key = dead_letter_name(event_type);
        let mut replayed = 0;

        loop {
            let data = match with_connection!(self.connection, |store| store.pop(&key)) {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(queue = %key, error = %err, "dead-letter replay interrupted");
                    break;
                }
            };

            let mut message = match Message::from_json(&data) {
                Ok(message) => message,
                Err(err) => {
                    tracing::error!(queue = %key, error = %err, "dropping malformed dead letter");
                    continue;
                }
            };
            message.retry_count = 0;
            if let Value::Object(payload) = &mut message.payload {
                payload.remove("_dead_reason");
                payload.remove("_dead_time");
            }

            match self.enqueue(&message).await {
                Ok(()) => replayed += 1,
                Err(err) => {
                    tracing::error!(message_id = %message.id, error = %err, "failed to replay dead letter");
                }
            }
        }

        if replayed > 0 {
            tracing::info!(%event_type, replayed, "dead letters replayed");
        }
        replayed
    }

    pub async fn clear_dead_letters(&self, event_type: &str) -> bool {
        let key = dead_letter_name(event_type);
        match with_connection!(self.connection, |store| store.delete(&key)) {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(queue = %key, error = %err, "failed to clear dead letters");
                false
            }
        }
    }

    pub async fn health_check(&self) -> HealthStatus {
        let ping = self.connection.ping().await;
        let connected = ping.is_ok();
        HealthStatus {
            status: if connected { "healthy" } else { "unhealthy" }.to_string(),
            connected,
            listening: self.is_listening(),
            subscribers: self.subscriber_counts().await,
            error: ping.err().map(|err| err.to_string()),
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("retry", &self.retry)
            .field("poll_interval", &self.poll_interval)
            .field("default_max_retries", &self.default_max_retries)
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}
