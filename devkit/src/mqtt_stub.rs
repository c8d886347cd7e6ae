/*!
Mock MQTT client for tests without a broker

Records every publish so tests can assert on topics, QoS, retain flags and
payloads. Individual topics can be made to fail to exercise error paths.
*/

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rumqttc::QoS;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock with the publishing surface of `rumqttc::AsyncClient`
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    failing_topics: Arc<Mutex<HashSet<String>>>,
    disconnected: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        if self.disconnected.load(Ordering::Acquire) {
            bail!("mock client is disconnected");
        }
        if self.failing_topics.lock().contains(&topic) {
            bail!("simulated publish failure on {topic}");
        }

        let message = MockMessage {
            topic,
            payload: payload.into(),
            qos,
            retain,
        };
        tracing::debug!(topic = %message.topic, bytes = message.payload.len(), "[mock] published");
        self.published_messages.lock().push(message);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Make every publish on `topic` fail until `clear_failures`.
    pub fn fail_topic(&self, topic: impl Into<String>) {
        self.failing_topics.lock().insert(topic.into());
    }

    pub fn clear_failures(&self) {
        self.failing_topics.lock().clear();
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse the last message on a topic as JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        match messages.last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_records_publishes() {
        let client = MockMqttClient::new();
        client
            .publish("test/topic", QoS::AtLeastOnce, true, b"test message".to_vec())
            .await
            .unwrap();

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "test/topic");
        assert_eq!(messages[0].payload, b"test message");
        assert!(messages[0].retain);
    }

    #[tokio::test]
    async fn test_json_message_parsing() {
        let client = MockMqttClient::new();
        let payload = serde_json::to_vec(&serde_json::json!({"name": "Uptime", "n": 42})).unwrap();
        client.publish("json/topic", QoS::AtLeastOnce, false, payload).await.unwrap();

        let parsed: Option<serde_json::Value> = client.get_last_json_message("json/topic").unwrap();
        assert_eq!(parsed.unwrap()["name"], "Uptime");
        let missing: Option<serde_json::Value> = client.get_last_json_message("other").unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_failing_topic_and_disconnect() {
        let client = MockMqttClient::new();
        client.fail_topic("bad/topic");
        assert!(client.publish("bad/topic", QoS::AtMostOnce, false, "x").await.is_err());
        assert!(client.publish("good/topic", QoS::AtMostOnce, false, "x").await.is_ok());

        client.disconnect().await.unwrap();
        assert!(client.is_disconnected());
        assert!(client.publish("good/topic", QoS::AtMostOnce, false, "x").await.is_err());
        assert_eq!(client.get_published_messages().len(), 1);
    }
}
