//! Fleet behavior across two instances sharing one stream store: every
//! published message is handled exactly once, whichever member owns its
//! partition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use qtask::config::{Config, EnvMsDuration};
use qtask::consumer::{ConsumerOptions, Message, MessageHandler};
use qtask::manager::{FleetAssignment, Subscription};
use qtask::redis::MockStreamClient;
use qtask::QTask;

struct CountingHandler {
    label: &'static str,
    handled: Arc<Mutex<Vec<(String, &'static str)>>>,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let to = message
            .fields
            .iter()
            .find(|(field, _)| field == "to")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        self.handled.lock().unwrap().push((to, self.label));
        Ok(())
    }
}

fn config(total_partitions: u32) -> Config {
    Config {
        redis_host: "localhost".to_string(),
        redis_port: 6379,
        redis_username: None,
        redis_password: None,
        total_partitions,
        instance_id: 0,
        instance_count: 1,
        block_timeout: EnvMsDuration(Duration::from_millis(50)),
        claim_interval: EnvMsDuration(Duration::from_secs(3600)),
        min_idle_time: EnvMsDuration(Duration::from_secs(60)),
    }
}

fn subscription(
    handler: Arc<dyn MessageHandler>,
    instance_id: u32,
    instance_count: u32,
) -> Subscription {
    let mut subscription = Subscription::new("T", "workers", handler);
    subscription.partitioning = Some(FleetAssignment::new(instance_id, instance_count).unwrap());
    subscription.options = Some(ConsumerOptions {
        block_timeout: Duration::from_millis(50),
        claim_interval: Duration::from_secs(3600),
        min_idle_time: Duration::from_secs(60),
    });
    subscription
}

async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !check() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(check(), "condition not reached within {timeout:?}");
}

#[tokio::test]
async fn two_instances_handle_every_message_exactly_once() {
    let store = MockStreamClient::new();
    let handled = Arc::new(Mutex::new(Vec::new()));

    let mut first = QTask::with_client(config(4), Arc::new(store.clone())).unwrap();
    let mut second = QTask::with_client(config(4), Arc::new(store.clone())).unwrap();

    first
        .register(subscription(
            Arc::new(CountingHandler {
                label: "first",
                handled: handled.clone(),
            }),
            0,
            2,
        ))
        .await
        .unwrap();
    second
        .register(subscription(
            Arc::new(CountingHandler {
                label: "second",
                handled: handled.clone(),
            }),
            1,
            2,
        ))
        .await
        .unwrap();

    // Together the two members own all four partition streams.
    for index in 0..4 {
        assert!(store.group_exists(&format!("T:{index}"), "workers"));
    }

    for n in 0..100 {
        first
            .publish("T", Some(&format!("key-{n}")), &json!({"to": format!("task-{n}")}), None)
            .await
            .unwrap();
    }

    wait_until(|| handled.lock().unwrap().len() >= 100, Duration::from_secs(10)).await;
    // Let any stray duplicate deliveries surface before counting.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let handled = handled.lock().unwrap().clone();
    assert_eq!(handled.len(), 100, "messages handled more than once");

    let mut per_task: HashMap<String, usize> = HashMap::new();
    for (task, _) in &handled {
        *per_task.entry(task.clone()).or_default() += 1;
    }
    assert_eq!(per_task.len(), 100);
    assert!(per_task.values().all(|count| *count == 1));

    // With 100 distinct keys over four partitions, both members did work.
    assert!(handled.iter().any(|(_, label)| *label == "first"));
    assert!(handled.iter().any(|(_, label)| *label == "second"));

    // Nothing is left pending once every handler returned successfully.
    for index in 0..4 {
        assert!(store.pending(&format!("T:{index}"), "workers").is_empty());
    }

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn a_keyed_message_lands_on_the_deterministic_stream() {
    let store = MockStreamClient::new();
    let qtask = QTask::with_client(config(4), Arc::new(store.clone())).unwrap();

    // "abc" hashes to 96354 and 96354 % 4 == 2.
    qtask
        .publish("T", Some("abc"), &json!({"to": "x"}), None)
        .await
        .unwrap();

    let entries = store.entries("T:2");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].fields, vec!["to".to_string(), "x".to_string()]);
}
