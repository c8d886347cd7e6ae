/*!
# Host Monitor DevKit - test doubles

- `MockMqttClient`: records MQTT publishes without a broker
- `MockHub`: minimal Home Assistant REST API on localhost
*/

pub mod mock_hub;
pub mod mqtt_stub;

pub use mock_hub::{MockHub, RecordedPost};
pub use mqtt_stub::{MockMessage, MockMqttClient};

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
