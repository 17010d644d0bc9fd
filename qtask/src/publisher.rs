use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::error::PublishError;
use crate::partition::Partitioner;
use crate::redis::StreamClient;

/// Field name carrying payloads that cannot be flattened into field/value
/// pairs (strings, arrays, scalars, objects with null values).
pub const PAYLOAD_FIELD: &str = "message";
/// Sentinel pair written for empty-object payloads so the entry is still
/// addressable downstream.
pub const PLACEHOLDER_FIELD: &str = "_placeholder";
pub const PLACEHOLDER_VALUE: &str = "empty_object";

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Explicit entry id; defaults to `"*"` (server-assigned).
    pub id: Option<String>,
}

/// Encodes payloads into field/value records and appends them to the
/// partition stream their key maps to.
pub struct Publisher {
    client: Arc<dyn StreamClient>,
    partitioner: Partitioner,
}

impl Publisher {
    pub fn new(client: Arc<dyn StreamClient>, partitioner: Partitioner) -> Self {
        Self {
            client,
            partitioner,
        }
    }

    /// Append `payload` to the partition of `base_topic` selected by `key`.
    /// Returns the entry id assigned by the store.
    ///
    /// A `None` key spreads the message over a random partition. There is no
    /// retry here: connection failures surface to the caller, which may
    /// retry once the store is reachable again.
    pub async fn publish(
        &self,
        base_topic: &str,
        key: Option<&str>,
        payload: &Value,
        options: Option<PublishOptions>,
    ) -> Result<String, PublishError> {
        if base_topic.is_empty() {
            return Err(PublishError::InvalidArgument("base_topic must not be empty"));
        }
        if payload.is_null() {
            return Err(PublishError::InvalidArgument("payload must not be null"));
        }

        let (partition, stream) = self.partitioner.stream_for(base_topic, key);
        let fields = encode_payload(payload);
        let id = options.and_then(|o| o.id).unwrap_or_else(|| "*".to_string());

        match self.client.xadd(&stream, &id, &fields).await {
            Ok(entry_id) => {
                let labels = [("topic", base_topic.to_string())];
                metrics::counter!("qtask_messages_published_total", &labels).increment(1);
                debug!(stream = %stream, partition, entry_id = %entry_id, "published entry");
                Ok(entry_id)
            }
            Err(err) => {
                error!(stream = %stream, partition, "failed to append entry: {err}");
                Err(err.into())
            }
        }
    }
}

/// Flatten a payload into the field/value list appended to the stream.
///
/// Objects whose values are all non-null scalars flatten pairwise in
/// insertion order; anything else collapses to a single `message` field
/// holding the JSON rendering, and `{}` becomes the placeholder sentinel.
fn encode_payload(payload: &Value) -> Vec<(String, String)> {
    match payload {
        Value::Object(map) if map.is_empty() => vec![(
            PLACEHOLDER_FIELD.to_string(),
            PLACEHOLDER_VALUE.to_string(),
        )],
        Value::Object(map) => {
            let mut fields = Vec::with_capacity(map.len());
            for (field, value) in map {
                let flat = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    Value::Null | Value::Array(_) | Value::Object(_) => {
                        return vec![(PAYLOAD_FIELD.to_string(), payload.to_string())];
                    }
                };
                fields.push((field.clone(), flat));
            }
            fields
        }
        Value::String(s) => vec![(PAYLOAD_FIELD.to_string(), s.clone())],
        other => vec![(PAYLOAD_FIELD.to_string(), other.to_string())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::MockStreamClient;
    use serde_json::json;

    fn publisher(total_partitions: u32) -> (Publisher, MockStreamClient) {
        let client = MockStreamClient::new();
        let partitioner = Partitioner::new(total_partitions).unwrap();
        (Publisher::new(Arc::new(client.clone()), partitioner), client)
    }

    #[tokio::test]
    async fn keyed_publish_targets_the_hashed_partition() {
        // "abc" hashes to 96354; 96354 % 4 == 2.
        let (publisher, client) = publisher(4);
        publisher
            .publish("T", Some("abc"), &json!({"to": "x"}), None)
            .await
            .unwrap();

        let entries = client.entries("T:2");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields, vec!["to".to_string(), "x".to_string()]);
    }

    #[tokio::test]
    async fn string_payload_becomes_message_field() {
        let (publisher, client) = publisher(1);
        publisher
            .publish("topic", Some("k"), &json!("hello"), None)
            .await
            .unwrap();
        assert_eq!(
            client.entries("topic:0")[0].fields,
            vec!["message".to_string(), "hello".to_string()]
        );
    }

    #[tokio::test]
    async fn scalar_object_flattens_in_insertion_order() {
        let (publisher, client) = publisher(1);
        publisher
            .publish("topic", Some("k"), &json!({"a": 1, "b": 2}), None)
            .await
            .unwrap();
        assert_eq!(
            client.entries("topic:0")[0].fields,
            vec!["a", "1", "b", "2"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn insertion_order_survives_unsorted_keys() {
        let (publisher, client) = publisher(1);
        publisher
            .publish(
                "topic",
                Some("k"),
                &json!({"z": "last", "a": "first", "m": true}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            client.entries("topic:0")[0].fields,
            vec!["z", "last", "a", "first", "m", "true"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn object_with_null_value_collapses_to_json() {
        let (publisher, client) = publisher(1);
        let payload = json!({"a": "1", "b": null});
        publisher
            .publish("topic", Some("k"), &payload, None)
            .await
            .unwrap();
        assert_eq!(
            client.entries("topic:0")[0].fields,
            vec!["message".to_string(), payload.to_string()]
        );
    }

    #[tokio::test]
    async fn empty_object_writes_the_placeholder_sentinel() {
        let (publisher, client) = publisher(1);
        publisher
            .publish("topic", Some("k"), &json!({}), None)
            .await
            .unwrap();
        let entries = client.entries("topic:0");
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].fields,
            vec!["_placeholder".to_string(), "empty_object".to_string()]
        );
    }

    #[tokio::test]
    async fn array_payload_collapses_to_json() {
        let (publisher, client) = publisher(1);
        publisher
            .publish("topic", Some("k"), &json!([1, 2, 3]), None)
            .await
            .unwrap();
        assert_eq!(
            client.entries("topic:0")[0].fields,
            vec!["message".to_string(), "[1,2,3]".to_string()]
        );
    }

    #[tokio::test]
    async fn explicit_entry_id_is_passed_through() {
        let (publisher, client) = publisher(1);
        let id = publisher
            .publish(
                "topic",
                Some("k"),
                &json!("x"),
                Some(PublishOptions {
                    id: Some("7-7".to_string()),
                }),
            )
            .await
            .unwrap();
        assert_eq!(id, "7-7");
        assert_eq!(client.entries("topic:0")[0].id, "7-7");
    }

    #[tokio::test]
    async fn invalid_arguments_do_not_append() {
        let (publisher, client) = publisher(1);
        assert!(matches!(
            publisher.publish("", Some("k"), &json!("x"), None).await,
            Err(PublishError::InvalidArgument(_))
        ));
        assert!(matches!(
            publisher
                .publish("topic", Some("k"), &Value::Null, None)
                .await,
            Err(PublishError::InvalidArgument(_))
        ));
        assert!(client.entries("topic:0").is_empty());
    }

    #[tokio::test]
    async fn disconnected_store_is_surfaced_and_retryable() {
        let (publisher, client) = publisher(1);
        client.set_connected(false);
        assert!(matches!(
            publisher.publish("topic", Some("k"), &json!("x"), None).await,
            Err(PublishError::Stream(_))
        ));

        client.set_connected(true);
        assert!(publisher
            .publish("topic", Some("k"), &json!("x"), None)
            .await
            .is_ok());
    }
}
