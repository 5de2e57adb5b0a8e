//! HTTP mirror store.
//!
//! Talks to a simple JSON key-value mirror service. Layout under the base
//! url, always scoped by environment so sandbox and production data can
//! never mix on the wire:
//!
//! - `GET  {base}/{environment}/manifest`  -> manifest, 404 when empty
//! - `GET  {base}/{environment}/records`   -> full record set
//! - `PUT  {base}/{environment}`           -> replace records + manifest

use crate::domain::entities::trade::TradeRecord;
use crate::domain::errors::SyncError;
use crate::domain::repositories::mirror_store::{MirrorManifest, MirrorStore};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize)]
struct MirrorPayload {
    manifest: MirrorManifest,
    records: Vec<TradeRecord>,
}

pub struct HttpMirrorStore {
    client: reqwest::Client,
    base_url: String,
    environment: String,
}

impl HttpMirrorStore {
    pub fn new(base_url: impl Into<String>, environment: impl Into<String>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            environment: environment.into(),
        }
    }

    fn url(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("{}/{}", self.base_url, self.environment)
        } else {
            format!("{}/{}/{}", self.base_url, self.environment, suffix)
        }
    }
}

#[async_trait]
impl MirrorStore for HttpMirrorStore {
    async fn fetch_manifest(&self) -> Result<Option<MirrorManifest>, SyncError> {
        let response = self
            .client
            .get(self.url("manifest"))
            .send()
            .await
            .map_err(|e| SyncError::Manifest(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let manifest = response
                    .json::<MirrorManifest>()
                    .await
                    .map_err(|e| SyncError::Manifest(e.to_string()))?;
                Ok(Some(manifest))
            }
            status => Err(SyncError::Manifest(format!("HTTP {}", status))),
        }
    }

    async fn pull_records(&self) -> Result<Vec<TradeRecord>, SyncError> {
        let response = self
            .client
            .get(self.url("records"))
            .send()
            .await
            .map_err(|e| SyncError::Pull(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => response
                .json::<Vec<TradeRecord>>()
                .await
                .map_err(|e| SyncError::Pull(e.to_string())),
            status => Err(SyncError::Pull(format!("HTTP {}", status))),
        }
    }

    async fn push_records(
        &self,
        records: &[TradeRecord],
        manifest: &MirrorManifest,
    ) -> Result<(), SyncError> {
        let payload = MirrorPayload {
            manifest: manifest.clone(),
            records: records.to_vec(),
        };

        let response = self
            .client
            .put(self.url(""))
            .json(&payload)
            .send()
            .await
            .map_err(|e| SyncError::Push(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::Push(format!("HTTP {}", response.status())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_environment_scoped() {
        let store = HttpMirrorStore::new("https://mirror.example.com/", "sandbox", 10_000);
        assert_eq!(
            store.url("manifest"),
            "https://mirror.example.com/sandbox/manifest"
        );
        assert_eq!(store.url(""), "https://mirror.example.com/sandbox");
    }
}
