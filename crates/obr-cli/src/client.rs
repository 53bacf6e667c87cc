//! HTTP client for opsd. Health probes use a 1 s timeout so command startup
//! stays snappy when no daemon is running; data calls get 3 s.

use std::time::Duration;

use serde_json::Value;

use obr_error::{OpsError, Result};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);
const DATA_TIMEOUT: Duration = Duration::from_secs(3);

pub struct OpsdClient {
    base: String,
    client: reqwest::Client,
}

impl OpsdClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            base: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn health(&self) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/health", self.base))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| OpsError::Other(format!("opsd is not reachable: {e}")))?;
        Self::decode(response).await
    }

    pub async fn is_online(&self) -> bool {
        self.health().await.is_ok()
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| OpsError::Other(format!("Invalid JSON response from opsd: {e}")))?;
        if status.is_success() {
            Ok(body)
        } else {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("opsd request failed")
                .to_string();
            Err(OpsError::Other(message))
        }
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}{path}", self.base))
            .query(query)
            .timeout(DATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| OpsError::Other(format!("opsd request failed: {e}")))?;
        Self::decode(response).await
    }

    pub async fn post(&self, path: &str, payload: &Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .json(payload)
            .timeout(DATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| OpsError::Other(format!("opsd request failed: {e}")))?;
        Self::decode(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .delete(format!("{}{path}", self.base))
            .timeout(DATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| OpsError::Other(format!("opsd request failed: {e}")))?;
        Self::decode(response).await
    }
}
