//! HTTP implementation of [`DiagramApi`].
//!
//! All endpoints live under `{base_url}/api/v1/projects/{project}`. Requests
//! carry a bearer token read from the environment variable named in
//! `[api].token_env`.
//!
//! # Retry Strategy
//!
//! Reads, listings, status updates and deletes are retried with exponential
//! backoff on transient failures:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, ... (capped at 2^5)
//!
//! Requests that create things (detection jobs, convert jobs, annotations)
//! are sent exactly once. A timeout or 5xx there does not tell us whether the
//! service committed, so the error is returned to the caller instead.
//!
//! Poll loops add their own backoff on top of this; see [`crate::poller`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::annotations::{
    event_keys, AnnotationCreate, ApiAnnotation, EventAnnotation, RawEvent,
};
use crate::api::{ApiStatusUpdate, DiagramApi, EventStatusUpdate};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::labels::{LabelDefinition, LabelPatch};
use crate::models::{
    ConvertItemStatus, ConvertJobCreated, ConvertRequest, DetectJobCreated, DetectRequest,
    DetectStatusResponse, FileId, ResourceType,
};

/// Maximum ids per delete / by-ids request accepted by the service.
const MAX_BATCH: usize = 1000;

#[derive(Deserialize)]
struct Items<T> {
    items: Vec<T>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct NamedResource {
    id: u64,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct ConvertStatusResponse {
    #[serde(default)]
    items: Vec<ConvertStatusItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConvertStatusItem {
    file_id: FileId,
    status: String,
    #[serde(default)]
    svg_id: Option<u64>,
    #[serde(default)]
    error_message: Option<String>,
}

pub struct HttpApi {
    client: reqwest::Client,
    root: String,
    token: Option<String>,
    max_retries: u32,
}

impl HttpApi {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            root: format!(
                "{}/api/v1/projects/{}",
                config.base_url.trim_end_matches('/'),
                config.project
            ),
            token: config.token(),
            max_retries: config.max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.root, path)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        retry: bool,
    ) -> Result<Value, ApiError> {
        let url = self.url(path);
        let mut last_err = None;
        let max_retries = if retry { self.max_retries } else { 0 };

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.request(method.clone(), &url);
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            if let Some(b) = body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let text = response.text().await?;
                        if text.trim().is_empty() {
                            return Ok(Value::Null);
                        }
                        return serde_json::from_str(&text)
                            .map_err(|e| ApiError::Decode(format!("{}: {}", path, e)));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = if status.as_u16() == 404 {
                        ApiError::NotFound(format!("{}: {}", path, body_text))
                    } else {
                        ApiError::Status {
                            status: status.as_u16(),
                            body: body_text,
                        }
                    };
                    if !err.is_transient() {
                        return Err(err);
                    }
                    tracing::debug!(path, attempt, error = %err, "transient service error");
                    last_err = Some(err);
                }
                Err(e) => {
                    tracing::debug!(path, attempt, error = %e, "request failed");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ApiError::Transport(format!("{}: retries exhausted", path))))
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ApiError> {
        let value = self.send(reqwest::Method::POST, path, Some(body), true).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(format!("{}: {}", path, e)))
    }

    /// POST that creates something; never retried.
    async fn post_once<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ApiError> {
        let value = self.send(reqwest::Method::POST, path, Some(body), false).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(format!("{}: {}", path, e)))
    }

    async fn post_unit(&self, path: &str, body: &Value) -> Result<(), ApiError> {
        self.send(reqwest::Method::POST, path, Some(body), true).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let value = self.send(reqwest::Method::GET, path, None, true).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Decode(format!("{}: {}", path, e)))
    }

    /// Follow `nextCursor` until the listing is exhausted.
    async fn list_all<T: DeserializeOwned>(&self, path: &str, filter: Value) -> Result<Vec<T>, ApiError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut body = json!({ "filter": filter, "limit": MAX_BATCH });
            if let Some(c) = &cursor {
                body["cursor"] = json!(c);
            }
            let page: Items<T> = self.post(path, &body).await?;
            out.extend(page.items);
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn delete_in_batches(&self, path: &str, ids: &[u64]) -> Result<(), ApiError> {
        for batch in ids.chunks(MAX_BATCH) {
            let items: Vec<Value> = batch.iter().map(|id| json!({ "id": id })).collect();
            self.post_unit(path, &json!({ "items": items })).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DiagramApi for HttpApi {
    async fn submit_detection(&self, request: &DetectRequest) -> Result<DetectJobCreated, ApiError> {
        let body = serde_json::to_value(request).map_err(|e| ApiError::Decode(e.to_string()))?;
        self.post_once("/context/diagram/detect", &body).await
    }

    async fn detection_status(&self, job_id: u64) -> Result<DetectStatusResponse, ApiError> {
        self.get(&format!("/context/diagram/detect/{}", job_id)).await
    }

    async fn list_event_annotations(&self, file_id: FileId) -> Result<Vec<EventAnnotation>, ApiError> {
        let mut metadata = serde_json::Map::new();
        metadata.insert(event_keys::FILE_ID.to_string(), json!(file_id.to_string()));
        let filter = json!({ "type": event_keys::EVENT_TYPE, "metadata": metadata });
        let events: Vec<RawEvent> = self.list_all("/events/list", filter).await?;
        let mut out = Vec::with_capacity(events.len());
        for event in &events {
            match EventAnnotation::from_event(event) {
                Ok(a) => out.push(a),
                Err(e) => tracing::warn!(event_id = event.id, error = %e, "skipping malformed annotation event"),
            }
        }
        Ok(out)
    }

    async fn list_api_annotations(&self, file_id: FileId) -> Result<Vec<ApiAnnotation>, ApiError> {
        let filter = json!({
            "annotatedResourceType": "file",
            "annotatedResourceIds": [{ "id": file_id }],
        });
        self.list_all("/annotations/list", filter).await
    }

    async fn create_annotations(
        &self,
        annotations: &[AnnotationCreate],
    ) -> Result<Vec<ApiAnnotation>, ApiError> {
        let mut created = Vec::with_capacity(annotations.len());
        for batch in annotations.chunks(MAX_BATCH) {
            let page: Items<ApiAnnotation> =
                self.post_once("/annotations", &json!({ "items": batch })).await?;
            created.extend(page.items);
        }
        Ok(created)
    }

    async fn update_event_status(&self, updates: &[EventStatusUpdate]) -> Result<(), ApiError> {
        let items: Vec<Value> = updates
            .iter()
            .map(|u| {
                let mut add = serde_json::Map::new();
                add.insert(event_keys::STATUS.to_string(), json!(u.status.as_str()));
                if let Some(who) = &u.checked_by {
                    add.insert(event_keys::CHECKED_BY.to_string(), json!(who));
                }
                json!({ "id": u.annotation.id, "update": { "metadata": { "add": add } } })
            })
            .collect();
        for batch in items.chunks(MAX_BATCH) {
            self.post_unit("/events/update", &json!({ "items": batch })).await?;
        }
        Ok(())
    }

    async fn update_api_status(&self, updates: &[ApiStatusUpdate]) -> Result<(), ApiError> {
        let items: Vec<Value> = updates
            .iter()
            .map(|u| json!({ "id": u.id, "update": { "status": { "set": u.status } } }))
            .collect();
        for batch in items.chunks(MAX_BATCH) {
            self.post_unit("/annotations/update", &json!({ "items": batch }))
                .await?;
        }
        Ok(())
    }

    async fn delete_event_annotations(&self, ids: &[u64]) -> Result<(), ApiError> {
        self.delete_in_batches("/events/delete", ids).await
    }

    async fn delete_api_annotations(&self, ids: &[u64]) -> Result<(), ApiError> {
        self.delete_in_batches("/annotations/delete", ids).await
    }

    async fn ensure_label(&self, label: &LabelDefinition) -> Result<(), ApiError> {
        let existing: Items<Value> = self
            .post(
                "/labels/list",
                &json!({ "filter": { "externalIdPrefix": label.external_id } }),
            )
            .await?;
        let found = existing
            .items
            .iter()
            .any(|l| l.get("externalId").and_then(Value::as_str) == Some(label.external_id));
        if found {
            return Ok(());
        }
        tracing::info!(label = label.external_id, "creating label definition");
        let created: Result<Value, ApiError> = self
            .post_once("/labels", &json!({ "items": [label] }))
            .await;
        match created {
            Ok(_) => Ok(()),
            // Another writer created it between our listing and the create.
            Err(ApiError::Status { status: 409, .. }) => {
                tracing::debug!(label = label.external_id, "label definition already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn update_file_labels(&self, patches: &[LabelPatch]) -> Result<(), ApiError> {
        let items: Vec<Value> = patches
            .iter()
            .map(|p| {
                let ext = |ids: &[String]| -> Vec<Value> {
                    ids.iter().map(|id| json!({ "externalId": id })).collect()
                };
                let mut labels = serde_json::Map::new();
                if !p.add.is_empty() {
                    labels.insert("add".to_string(), json!(ext(&p.add)));
                }
                if !p.remove.is_empty() {
                    labels.insert("remove".to_string(), json!(ext(&p.remove)));
                }
                json!({ "id": p.file_id, "update": { "labels": labels } })
            })
            .collect();
        for batch in items.chunks(MAX_BATCH) {
            self.post_unit("/files/update", &json!({ "items": batch })).await?;
        }
        Ok(())
    }

    async fn link_assets(&self, file_id: FileId, asset_ids: &[u64]) -> Result<(), ApiError> {
        if asset_ids.is_empty() {
            return Ok(());
        }
        let body = json!({
            "items": [{ "id": file_id, "update": { "assetIds": { "add": asset_ids } } }]
        });
        self.post_unit("/files/update", &body).await
    }

    async fn resource_names(
        &self,
        resource_type: ResourceType,
        ids: &[u64],
    ) -> Result<HashMap<u64, String>, ApiError> {
        let path = match resource_type {
            ResourceType::Asset => "/assets/byids",
            ResourceType::File => "/files/byids",
        };
        let mut names = HashMap::new();
        for batch in ids.chunks(MAX_BATCH) {
            let items: Vec<Value> = batch.iter().map(|id| json!({ "id": id })).collect();
            let page: Items<NamedResource> = self
                .post(path, &json!({ "items": items, "ignoreUnknownIds": true }))
                .await?;
            names.extend(page.items.into_iter().map(|r| (r.id, r.name)));
        }
        Ok(names)
    }

    async fn submit_convert(&self, request: &ConvertRequest) -> Result<ConvertJobCreated, ApiError> {
        let body = serde_json::to_value(request).map_err(|e| ApiError::Decode(e.to_string()))?;
        self.post_once("/context/diagram/convert", &body).await
    }

    async fn convert_status(&self, job_id: u64, file_id: FileId) -> Result<ConvertItemStatus, ApiError> {
        let resp: ConvertStatusResponse = self
            .get(&format!("/context/diagram/convert/{}", job_id))
            .await?;
        resp.items
            .into_iter()
            .find(|i| i.file_id == file_id)
            .map(|i| ConvertItemStatus {
                status: i.status,
                svg_id: i.svg_id,
                error_message: i.error_message,
            })
            .ok_or_else(|| ApiError::NotFound(format!("file {} in convert job {}", file_id, job_id)))
    }
}
