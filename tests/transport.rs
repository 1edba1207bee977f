//! End-to-end transport tests: producer, broker, worker loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use taskbus::broker::MemoryBroker;
use taskbus::config::BrokerConfig;
use taskbus::error::Result;
use taskbus::transport::{Consumer, Producer, Responder, TaskHandler, check_broker};
use taskbus::wire;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn config() -> BrokerConfig {
    BrokerConfig {
        connect_timeout: Duration::from_secs(2),
        retry_interval: Duration::from_millis(10),
        reply_poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

/// Reports two progress values, then finishes with a run summary.
struct ProgressWorker;

#[async_trait]
impl TaskHandler for ProgressWorker {
    async fn handle(&self, _task: Value, responder: Responder) -> Result<()> {
        responder.send(&json!({"progress": 1})).await?;
        responder.send(&json!({"progress": 2})).await?;
        responder.finish(&json!({"duration_ms": 42})).await
    }
}

/// Tags each task with which worker handled it, holding the task briefly so
/// distribution across workers is observable.
struct TaggingWorker {
    tag: &'static str,
    handled: mpsc::UnboundedSender<(&'static str, Value)>,
}

#[async_trait]
impl TaskHandler for TaggingWorker {
    async fn handle(&self, task: Value, responder: Responder) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.handled
            .send((self.tag, task.clone()))
            .expect("collector open");
        responder.finish(&json!({"worker": self.tag})).await
    }
}

#[tokio::test]
async fn streaming_request_response_round_trip() {
    init_tracing();
    let broker = MemoryBroker::new();
    let queue = wire::task_queue_name("acme", "geocode");

    let mut producer = Producer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    let mut consumer = Consumer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = consumer.consume_forever(Arc::new(ProgressWorker)).await;
    });

    producer.send(&json!({"op": "run"})).await.unwrap();
    let values = producer.receive().collect().await.unwrap();

    assert_eq!(values, vec![json!({"progress": 1}), json!({"progress": 2})]);
    assert_eq!(producer.metadata(), Some(&json!({"duration_ms": 42})));

    // Exhausted streams stay exhausted.
    assert!(producer.receive().collect().await.unwrap().is_empty());
}

#[tokio::test]
async fn consecutive_requests_get_fresh_reply_channels() {
    init_tracing();
    let broker = MemoryBroker::new();
    let queue = wire::task_queue_name("acme", "geocode");

    let mut consumer = Consumer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = consumer.consume_forever(Arc::new(ProgressWorker)).await;
    });

    let mut producer = Producer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    for _ in 0..2 {
        producer.send(&json!({"op": "run"})).await.unwrap();
        let values = producer.receive().collect().await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(producer.metadata(), Some(&json!({"duration_ms": 42})));
    }
}

#[tokio::test]
async fn tasks_are_distributed_across_competing_consumers() {
    init_tracing();
    let broker = MemoryBroker::new();
    let queue = wire::task_queue_name("acme", "geocode");
    let (handled_tx, mut handled_rx) = mpsc::unbounded_channel();

    for tag in ["a", "b"] {
        let mut consumer = Consumer::connect(Arc::new(broker.clone()), config(), queue.as_str())
            .await
            .unwrap();
        let handler = Arc::new(TaggingWorker {
            tag,
            handled: handled_tx.clone(),
        });
        tokio::spawn(async move {
            let _ = consumer.consume_forever(handler).await;
        });
    }

    let mut producer = Producer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    for n in 0..3 {
        producer.send(&json!({"task": n})).await.unwrap();
    }

    let mut handled = Vec::new();
    for _ in 0..3 {
        handled.push(handled_rx.recv().await.unwrap());
    }

    // Every task delivered exactly once.
    let mut tasks: Vec<i64> = handled
        .iter()
        .map(|(_, task)| task["task"].as_i64().unwrap())
        .collect();
    tasks.sort_unstable();
    assert_eq!(tasks, vec![0, 1, 2]);

    // With prefetch = 1 and handlers that hold each task, one worker cannot
    // hoard all three.
    let a_count = handled.iter().filter(|(tag, _)| *tag == "a").count();
    assert!(a_count >= 1 && a_count <= 2, "lopsided distribution: {handled:?}");
}

#[tokio::test]
async fn worker_survives_broker_restart() {
    init_tracing();
    let broker = MemoryBroker::new();
    let queue = wire::task_queue_name("acme", "geocode");
    let (handled_tx, mut handled_rx) = mpsc::unbounded_channel();

    let mut consumer = Consumer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    let handler = Arc::new(TaggingWorker {
        tag: "w",
        handled: handled_tx,
    });
    tokio::spawn(async move {
        let _ = consumer.consume_forever(handler).await;
    });

    let mut producer = Producer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    producer.send(&json!({"task": "before"})).await.unwrap();
    assert_eq!(handled_rx.recv().await.unwrap().1, json!({"task": "before"}));

    // Sever every link; the durable queue and the worker loop both survive.
    broker.kill_links().await;

    let mut producer = Producer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    producer.send(&json!({"task": "after"})).await.unwrap();
    assert_eq!(handled_rx.recv().await.unwrap().1, json!({"task": "after"}));
}

#[tokio::test]
async fn typed_payloads_round_trip_through_the_queue() {
    init_tracing();

    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct RunRequest {
        op: String,
        attempts: u32,
    }

    let broker = MemoryBroker::new();
    let queue = wire::task_queue_name("acme", "geocode");

    struct Echo;
    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, task: Value, responder: Responder) -> Result<()> {
            responder.send(&task).await?;
            responder.finish(&json!({})).await
        }
    }

    let mut consumer = Consumer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = consumer.consume_forever(Arc::new(Echo)).await;
    });

    let sent = RunRequest {
        op: "run".to_string(),
        attempts: 3,
    };
    let mut producer = Producer::connect(Arc::new(broker.clone()), config(), queue.as_str())
        .await
        .unwrap();
    producer.send(&sent).await.unwrap();

    let values = producer.receive().collect().await.unwrap();
    assert_eq!(values.len(), 1);
    let back: RunRequest = serde_json::from_value(values[0].clone()).unwrap();
    assert_eq!(back, sent);
}

#[tokio::test]
async fn health_check_round_trip() {
    init_tracing();
    let broker = MemoryBroker::new();

    let report = check_broker(Arc::new(broker.clone()), &config()).await;
    assert!(report.ok, "diagnostic: {:?}", report.diagnostic);

    broker.set_available(false);
    let report = check_broker(
        Arc::new(broker.clone()),
        &BrokerConfig {
            connect_timeout: Duration::from_millis(100),
            retry_interval: Duration::from_millis(10),
            ..config()
        },
    )
    .await;
    assert!(!report.ok);
    assert!(report.diagnostic.is_some());
}
