//! Home Assistant REST API backend

use super::{ReportBackend, ReportResult, ReportResults, SensorUpdate};
use crate::config::HomeAssistantConfig;
use crate::error::{MonitorError, MonitorResult};
use async_trait::async_trait;
use chrono::Local;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct RestReporter {
    base_url: String,
    entity_prefix: String,
    client: Option<Client>,
}

impl RestReporter {
    pub fn new(config: &HomeAssistantConfig, entity_prefix: &str) -> MonitorResult<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token.trim()))
            .map_err(|_| MonitorError::ConfigInvalid("home_assistant.token contains invalid characters".to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| MonitorError::ConnectivityFailure(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.url.trim().trim_end_matches('/').to_string(),
            entity_prefix: entity_prefix.to_string(),
            client: Some(client),
        })
    }

    pub fn entity_id(&self, key: &str) -> String {
        format!("sensor.{}_{}", self.entity_prefix, key)
    }

    fn client(&self) -> MonitorResult<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| MonitorError::ConnectivityFailure("REST session is closed".to_string()))
    }

    fn state_payload(update: &SensorUpdate) -> Value {
        let mut attributes = update.attributes.clone();
        if let Some(unit) = &update.unit {
            attributes.insert("unit_of_measurement".to_string(), unit.clone().into());
        }
        if let Some(device_class) = &update.device_class {
            attributes.insert("device_class".to_string(), device_class.clone().into());
        }
        if let Some(state_class) = &update.state_class {
            attributes.insert("state_class".to_string(), state_class.clone().into());
        }
        attributes
            .entry("friendly_name")
            .or_insert_with(|| update.friendly_name().into());
        attributes.insert("last_updated".to_string(), Local::now().to_rfc3339().into());

        json!({
            "state": update.state,
            "attributes": attributes,
        })
    }

    async fn update_sensor(client: &Client, url: String, entity_id: &str, update: &SensorUpdate) -> ReportResult {
        let payload = Self::state_payload(update);

        match client.post(&url).json(&payload).send().await {
            Ok(response) if matches!(response.status(), StatusCode::OK | StatusCode::CREATED) => {
                debug!(entity_id, state = %update.state, "sensor updated");
                ReportResult::ok()
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = format!("HTTP {}: {}", status.as_u16(), body);
                error!(entity_id, error = %error, "failed to update sensor");
                ReportResult::failed(error)
            }
            Err(e) => {
                error!(entity_id, error = %e, "error updating sensor");
                ReportResult::failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl ReportBackend for RestReporter {
    fn name(&self) -> &'static str {
        "rest_api"
    }

    async fn publish(&mut self, updates: &[SensorUpdate]) -> MonitorResult<ReportResults> {
        let client = self.client()?;
        let mut results = ReportResults::new();

        for update in updates {
            let entity_id = self.entity_id(&update.key);
            let url = format!("{}/api/states/{}", self.base_url, entity_id);
            let result = Self::update_sensor(client, url, &entity_id, update).await;
            results.insert(entity_id, result);
        }

        Ok(results)
    }

    async fn test_connection(&mut self) -> (bool, Option<String>) {
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => return (false, Some(e.to_string())),
        };

        match client.get(format!("{}/api/", self.base_url)).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                info!(url = %self.base_url, "connected to Home Assistant");
                (true, None)
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                (false, Some(format!("HTTP {}: {}", status.as_u16(), body)))
            }
            Err(e) => (false, Some(e.to_string())),
        }
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("REST session closed");
        }
    }
}
