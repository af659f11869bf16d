use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{SubscribeOptions, Subscriber, WorkerPool};
use crate::broker::{Broker, DeliveryMode, Handler, Message, Priority, PublishOptions};
use crate::config::{BrokerSettings, ConsumerSettings};
use crate::persistence::MemoryStore;
use crate::utils::{HandlerResult, PoolError};

fn consumer_settings() -> ConsumerSettings {
    ConsumerSettings {
        workers: 4,
        consume_timeout_ms: 20,
        handler_timeout_ms: 1000,
        idle_wait_ms: 5,
    }
}

fn broker_settings() -> BrokerSettings {
    BrokerSettings {
        default_max_retries: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 4,
        poll_interval_ms: 5,
    }
}

fn subscriber_over(broker: &BrokerSettings, consumer: ConsumerSettings) -> Arc<Subscriber> {
    let store = Arc::new(MemoryStore::default());
    let broker = Arc::new(Broker::new(store, broker));
    Arc::new(Subscriber::new(broker, consumer))
}

fn subscriber_with(settings: ConsumerSettings) -> Arc<Subscriber> {
    subscriber_over(&broker_settings(), settings)
}

fn subscriber() -> Arc<Subscriber> {
    subscriber_with(consumer_settings())
}

fn collector() -> (impl Handler + Clone, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: &Message| -> HandlerResult {
        tx.send(message.payload.clone()).ok();
        Ok(true)
    };
    (handler, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn p2p() -> PublishOptions {
    PublishOptions::default().point_to_point()
}

#[tokio::test]
async fn pool_returns_job_result() {
    let pool = WorkerPool::new(2);
    let value = pool.execute(|| 21 * 2, Duration::from_secs(1)).await;
    assert_eq!(value.unwrap(), 42);
    assert_eq!(pool.size(), 2);
}

#[tokio::test]
async fn pool_zero_size_is_clamped_to_one() {
    assert_eq!(WorkerPool::new(0).size(), 1);
}

#[tokio::test]
async fn pool_times_out_slow_job() {
    let pool = WorkerPool::new(1);
    let result = pool
        .execute(
            || std::thread::sleep(Duration::from_millis(200)),
            Duration::from_millis(20),
        )
        .await;
    assert!(matches!(result, Err(PoolError::TimedOut(_))));
}

#[tokio::test]
async fn pool_reports_panicking_job() {
    let pool = WorkerPool::new(1);
    let result: Result<(), _> = pool
        .execute(|| panic!("handler blew up"), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(PoolError::Panicked(_))));
    // the worker is released after a panic
    assert_eq!(pool.in_flight(), 0);
}

#[tokio::test]
async fn pool_caps_concurrent_jobs() {
    let pool = Arc::new(WorkerPool::new(2));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut jobs = Vec::new();
    for _ in 0..6 {
        let pool = Arc::clone(&pool);
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        jobs.push(tokio::spawn(async move {
            pool.execute(
                move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                },
                Duration::from_secs(2),
            )
            .await
        }));
    }
    for job in jobs {
        job.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.in_flight(), 0);
}

#[tokio::test]
async fn pool_refuses_jobs_after_shutdown() {
    let pool = WorkerPool::new(2);
    pool.shutdown().await;
    let result = pool.execute(|| (), Duration::from_secs(1)).await;
    assert!(matches!(result, Err(PoolError::ShutDown)));
}

#[tokio::test]
async fn pub_sub_subscription_registers_with_broker() {
    let subscriber = subscriber();
    let (handler, _rx) = collector();

    let subscription = subscriber
        .subscribe("user.created", handler, SubscribeOptions::pub_sub())
        .await;

    assert_eq!(subscription.event_type, "user.created");
    assert_eq!(subscription.delivery_mode, DeliveryMode::PubSub);
    assert!(subscription.is_active());
    assert_eq!(subscriber.broker().subscriber_count("user.created").await, 1);

    assert!(subscriber.unsubscribe(&subscription.id).await);
    assert!(!subscription.is_active());
    assert_eq!(subscriber.broker().subscriber_count("user.created").await, 0);
    assert!(!subscriber.unsubscribe(&subscription.id).await);
}

#[tokio::test]
async fn point_to_point_subscription_stays_out_of_broker_table() {
    let subscriber = subscriber();
    let (handler, _rx) = collector();

    let subscription = subscriber
        .subscribe(
            "report.generate",
            handler,
            SubscribeOptions::point_to_point().priority(Priority::High),
        )
        .await;

    assert!(subscription.is_point_to_point());
    assert_eq!(subscription.priority, Priority::High);
    assert_eq!(subscriber.broker().subscriber_count("report.generate").await, 0);
}

#[tokio::test]
async fn on_registers_and_returns_the_handler() {
    let subscriber = subscriber();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);

    let handler = subscriber
        .on(
            "audit.logged",
            SubscribeOptions::pub_sub(),
            move |_: &Message| -> HandlerResult {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            },
        )
        .await;

    assert!(handler.handle(&Message::new("audit.logged", json!({}))).unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(subscriber.get_subscriptions(Some("audit.logged")).await.len(), 1);
}

#[tokio::test]
async fn get_subscriptions_filters_by_event_type() {
    let subscriber = subscriber();
    let (handler, _rx) = collector();
    subscriber
        .subscribe("a", handler.clone(), SubscribeOptions::pub_sub())
        .await;
    subscriber
        .subscribe("a", handler.clone(), SubscribeOptions::point_to_point())
        .await;
    subscriber
        .subscribe("b", handler, SubscribeOptions::pub_sub())
        .await;

    assert_eq!(subscriber.get_subscriptions(None).await.len(), 3);
    assert_eq!(subscriber.get_subscriptions(Some("a")).await.len(), 2);
    assert!(subscriber.get_subscriptions(Some("zzz")).await.is_empty());
}

#[tokio::test]
async fn point_to_point_messages_are_consumed_highest_tier_first() {
    let subscriber = subscriber();
    let broker = Arc::clone(subscriber.broker());
    let (handler, mut rx) = collector();
    subscriber
        .subscribe("job", handler, SubscribeOptions::point_to_point())
        .await;

    broker.publish("job", json!({"n": "low"}), p2p().priority(Priority::Low)).await;
    broker.publish("job", json!({"n": "critical"}), p2p().priority(Priority::Critical)).await;

    subscriber.start_consuming().await;
    assert_eq!(recv(&mut rx).await, json!({"n": "critical"}));
    assert_eq!(recv(&mut rx).await, json!({"n": "low"}));
    subscriber.stop_consuming().await;

    assert_eq!(broker.get_queue_length("job", None).await, 0);
}

#[tokio::test]
async fn pub_sub_is_delivered_while_consuming() {
    let subscriber = subscriber();
    let broker = Arc::clone(subscriber.broker());
    let (handler, mut rx) = collector();
    subscriber
        .subscribe("user.created", handler, SubscribeOptions::pub_sub())
        .await;

    subscriber.start_consuming().await;
    assert!(broker.is_listening());
    assert!(
        broker
            .publish("user.created", json!({"user_id": 1}), PublishOptions::default())
            .await
    );
    assert_eq!(recv(&mut rx).await, json!({"user_id": 1}));

    subscriber.stop_consuming().await;
    assert!(!broker.is_listening());
}

#[tokio::test]
async fn point_to_point_subscription_added_while_consuming_starts_its_loop() {
    let subscriber = subscriber();
    let broker = Arc::clone(subscriber.broker());
    subscriber.start_consuming().await;

    let (handler, mut rx) = collector();
    subscriber
        .subscribe("late.job", handler, SubscribeOptions::point_to_point())
        .await;
    assert_eq!(subscriber.get_stats().await.consumer_task_count, 1);

    broker.publish("late.job", json!({"k": 1}), p2p()).await;
    assert_eq!(recv(&mut rx).await, json!({"k": 1}));

    subscriber.stop_consuming().await;
}

#[tokio::test]
async fn failing_handler_ends_in_dead_letter_queue() {
    let subscriber = subscriber();
    let broker = Arc::clone(subscriber.broker());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&attempts);
    subscriber
        .subscribe(
            "flaky",
            move |_: &Message| -> HandlerResult {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            },
            SubscribeOptions::point_to_point(),
        )
        .await;

    broker.publish("flaky", json!({"x": 1}), p2p().max_retries(1)).await;
    subscriber.start_consuming().await;

    let b = &broker;
    wait_until(|| async move { b.dead_letter_length("flaky").await == 1 }).await;
    subscriber.stop_consuming().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(broker.get_queue_length("flaky", None).await, 0);
}

#[tokio::test]
async fn handler_timeout_counts_as_failure() {
    let subscriber = subscriber_with(ConsumerSettings {
        handler_timeout_ms: 20,
        ..consumer_settings()
    });
    let broker = Arc::clone(subscriber.broker());
    subscriber
        .subscribe(
            "slow",
            |_: &Message| -> HandlerResult {
                std::thread::sleep(Duration::from_millis(150));
                Ok(true)
            },
            SubscribeOptions::point_to_point(),
        )
        .await;

    broker.publish("slow", json!({}), p2p().max_retries(0)).await;
    subscriber.start_consuming().await;

    let b = &broker;
    wait_until(|| async move { b.dead_letter_length("slow").await == 1 }).await;
    subscriber.stop_consuming().await;
}

#[tokio::test]
async fn unsubscribed_point_to_point_loop_exits() {
    let subscriber = subscriber();
    let broker = Arc::clone(subscriber.broker());
    let (handler, mut rx) = collector();
    let subscription = subscriber
        .subscribe("job", handler, SubscribeOptions::point_to_point())
        .await;

    subscriber.start_consuming().await;
    assert!(subscriber.unsubscribe(&subscription.id).await);

    let s = &subscriber;
    wait_until(|| async move { s.get_stats().await.consumer_task_count == 0 }).await;

    broker.publish("job", json!({"k": 1}), p2p()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(broker.get_queue_length("job", None).await, 1);

    subscriber.stop_consuming().await;
}

#[tokio::test]
async fn stats_track_subscriptions_and_running_state() {
    let subscriber = subscriber();
    let (handler, _rx) = collector();
    subscriber
        .subscribe("a", handler.clone(), SubscribeOptions::pub_sub())
        .await;
    subscriber
        .subscribe("b", handler.clone(), SubscribeOptions::pub_sub())
        .await;
    let p2p_sub = subscriber
        .subscribe("c", handler, SubscribeOptions::point_to_point())
        .await;

    let stats = subscriber.get_stats().await;
    assert_eq!(stats.total, 3);
    assert_eq!(stats.active, 3);
    assert_eq!(stats.pub_sub_count, 2);
    assert_eq!(stats.point_to_point_count, 1);
    assert_eq!(stats.consumer_task_count, 0);
    assert!(!stats.running);

    subscriber.start_consuming().await;
    let stats = subscriber.get_stats().await;
    assert!(stats.running);
    assert_eq!(stats.consumer_task_count, 1);

    subscriber.unsubscribe(&p2p_sub.id).await;
    subscriber.stop_consuming().await;
    let stats = subscriber.get_stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.consumer_task_count, 0);
    assert!(!stats.running);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let subscriber = subscriber();
    subscriber.stop_consuming().await;

    subscriber.start_consuming().await;
    subscriber.start_consuming().await;
    assert!(subscriber.is_running().await);

    subscriber.stop_consuming().await;
    subscriber.stop_consuming().await;
    assert!(!subscriber.is_running().await);
}

#[tokio::test]
async fn consume_until_stopped_returns_after_stop() {
    let subscriber = subscriber();
    let running = tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        async move { subscriber.consume_until_stopped().await }
    });

    let s = &subscriber;
    wait_until(|| async move { s.is_running().await }).await;
    subscriber.stop_consuming().await;

    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("consume_until_stopped did not return")
        .unwrap();
}

#[tokio::test]
async fn stop_cuts_pending_backoff_short_and_requeues() {
    let subscriber = subscriber_over(
        &BrokerSettings {
            retry_base_delay_ms: 5000,
            retry_max_delay_ms: 60_000,
            ..broker_settings()
        },
        consumer_settings(),
    );
    let broker = Arc::clone(subscriber.broker());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&attempts);
    subscriber
        .subscribe(
            "backoff",
            move |_: &Message| -> HandlerResult {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            },
            SubscribeOptions::point_to_point(),
        )
        .await;

    broker.publish("backoff", json!({"n": 1}), p2p()).await;
    subscriber.start_consuming().await;

    let a = &attempts;
    wait_until(|| async move { a.load(Ordering::SeqCst) == 1 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(1), subscriber.stop_consuming())
        .await
        .expect("stop_consuming waited out the backoff");

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let requeued = broker
        .consume(
            "backoff",
            |message| async move { HandlerResult::Ok(message.retry_count == 1) },
            Duration::from_millis(50),
            Priority::Normal,
        )
        .await
        .expect("failed message was lost");
    assert_eq!(requeued.retry_count, 1);
}
