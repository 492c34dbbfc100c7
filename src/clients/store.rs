//! Application-store adapter over the gatekeeping API's internal endpoint.
//!
//! The API service owns the document database; this adapter translates a
//! [`RequestPatch`] into the `$set` change set its internal update endpoint
//! applies to one application document.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::services::{ApplicationStore, RequestPatch, StoreError};

/// Document store speaking to `PATCH {base_url}/internal/requests/{id}`.
#[derive(Debug, Clone)]
pub struct HttpApplicationStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpApplicationStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// Turn a patch into the store's `$set` change document.
fn build_change(patch: &RequestPatch) -> Value {
    let mut set = serde_json::Map::new();
    if let Some(assignees) = &patch.assignees {
        set.insert("assignees".to_string(), json!(assignees));
    }
    if let Some(status) = patch.onserver_status {
        set.insert("onserverStatus".to_string(), json!(status.as_str()));
    }
    json!({ "$set": Value::Object(set) })
}

#[async_trait]
impl ApplicationStore for HttpApplicationStore {
    async fn update_request(&self, id: &str, patch: RequestPatch) -> Result<(), StoreError> {
        let change = build_change(&patch);
        let url = format!("{}/internal/requests/{}", self.base_url, id);

        let mut request = self.client.patch(&url).json(&change);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(id, "Application document updated");
            Ok(())
        } else {
            Err(StoreError::Rejected(format!(
                "update of {id} returned status {status}"
            )))
        }
    }
}
