//! `HttpApi` against a local axum server standing in for the service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use diagram_contextualizer::annotations::{
    event_keys, AnnotationCreate, ApiAnnotationData, ApiAnnotationType, ApiStatus, EventStatus,
    ResourceRef,
};
use diagram_contextualizer::api::DiagramApi;
use diagram_contextualizer::config::ApiConfig;
use diagram_contextualizer::error::ApiError;
use diagram_contextualizer::http::HttpApi;
use diagram_contextualizer::labels::{FileLabel, LabelPatch, PENDING_LABEL};
use diagram_contextualizer::models::{
    bounding_box_to_vertices, BoundingBox, DetectRequest, DetectedAnnotation, DetectedEntity,
    JobItem, JobStatus, Region, ResourceType,
};
use diagram_contextualizer::reconcile::ReconciliationEngine;

const ROOT: &str = "/api/v1/projects/test";

#[derive(Clone, Default)]
struct Mock {
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    hits: Arc<AtomicUsize>,
}

impl Mock {
    fn record(&self, path: &str, body: Value) {
        self.requests.lock().unwrap().push((path.to_string(), body));
    }

    fn bodies(&self, path: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

async fn serve(router: Router) -> HttpApi {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    let config = ApiConfig {
        base_url: format!("http://{}", addr),
        project: "test".to_string(),
        token_env: "DGX_HTTP_TEST_TOKEN_UNSET".to_string(),
        timeout_secs: 5,
        max_retries: 1,
    };
    HttpApi::new(&config).unwrap()
}

fn api_annotation(id: u64, file_id: u64, status: &str) -> Value {
    json!({
        "id": id,
        "annotatedResourceId": file_id,
        "annotationType": "diagrams.AssetLink",
        "status": status,
        "creatingApp": "interactive-diagrams",
        "data": {
            "text": "21-PT-1019",
            "textRegion": { "xMin": 0.1, "yMin": 0.1, "xMax": 0.2, "yMax": 0.2 },
            "pageNumber": 1,
            "assetRef": { "id": 900 }
        }
    })
}

fn metadata(pairs: &[(&str, &str)]) -> Value {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect::<serde_json::Map<String, Value>>()
        .into()
}

#[tokio::test]
async fn annotation_listing_follows_cursor() {
    async fn list(State(mock): State<Mock>, Json(body): Json<Value>) -> Json<Value> {
        mock.record("list", body.clone());
        if body.get("cursor").is_none() {
            Json(json!({ "items": [api_annotation(1, 5, "suggested")], "nextCursor": "page-2" }))
        } else {
            Json(json!({ "items": [api_annotation(2, 5, "approved")] }))
        }
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/annotations/list", ROOT), post(list))
        .with_state(mock.clone());
    let api = serve(router).await;

    let annotations = api.list_api_annotations(5).await.unwrap();
    assert_eq!(annotations.len(), 2);
    assert_eq!(annotations[1].id, 2);

    let bodies = mock.bodies("list");
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["filter"]["annotatedResourceIds"][0]["id"], 5);
    assert_eq!(bodies[1]["cursor"], "page-2");
}

#[tokio::test]
async fn event_listing_skips_malformed_events() {
    async fn list(State(mock): State<Mock>, Json(body): Json<Value>) -> Json<Value> {
        mock.record("events", body);
        let annotation = metadata(&[
            (event_keys::FILE_ID, "5"),
            (event_keys::STATUS, "verified"),
            (event_keys::RESOURCE_TYPE, "asset"),
            (event_keys::RESOURCE_ID, "900"),
        ]);
        let unknown_status = metadata(&[(event_keys::FILE_ID, "5"), (event_keys::STATUS, "bogus")]);
        Json(json!({
            "items": [
                { "id": 11, "type": event_keys::EVENT_TYPE, "metadata": annotation },
                { "id": 12, "type": "maintenance", "metadata": {} },
                { "id": 13, "type": event_keys::EVENT_TYPE, "metadata": unknown_status }
            ]
        }))
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/events/list", ROOT), post(list))
        .with_state(mock.clone());
    let api = serve(router).await;

    let events = api.list_event_annotations(5).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, 11);
    assert_eq!(events[0].status, EventStatus::Verified);
    assert_eq!(events[0].resource_id, Some(900));

    let body = &mock.bodies("events")[0];
    assert_eq!(body["filter"]["type"], event_keys::EVENT_TYPE);
    assert_eq!(body["filter"]["metadata"][event_keys::FILE_ID], "5");
}

#[tokio::test]
async fn detection_submit_and_status() {
    async fn submit(State(mock): State<Mock>, Json(body): Json<Value>) -> Json<Value> {
        mock.record("detect", body);
        Json(json!({ "jobId": 77, "status": "Queued" }))
    }
    async fn status(Path(job_id): Path<u64>) -> Json<Value> {
        Json(json!({
            "jobId": job_id,
            "status": "Completed",
            "statusCount": { "completed": 1, "failed": 1 },
            "items": [
                { "fileId": 1, "annotations": [] },
                { "fileId": 2, "errorMessage": "File type not supported" }
            ]
        }))
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/context/diagram/detect", ROOT), post(submit))
        .route(&format!("{}/context/diagram/detect/{{job_id}}", ROOT), get(status))
        .with_state(mock.clone());
    let api = serve(router).await;

    let request = DetectRequest {
        items: vec![JobItem { file_id: 1 }, JobItem { file_id: 2 }],
        entities: vec![json!({ "resourceType": "asset", "id": 900, "name": "21-PT-1019" })],
        search_field: "name".to_string(),
        min_tokens: 2,
        partial_match: false,
    };
    let created = api.submit_detection(&request).await.unwrap();
    assert_eq!(created.job_id, 77);
    assert_eq!(created.status, JobStatus::Queued);

    let body = &mock.bodies("detect")[0];
    assert_eq!(body["items"][1]["fileId"], 2);
    assert_eq!(body["searchField"], "name");
    assert_eq!(body["minTokens"], 2);

    let status = api.detection_status(77).await.unwrap();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.status_count.unwrap().failed, 1);
    assert!(status.items[1].annotations.is_none());
}

#[tokio::test]
async fn transient_errors_are_retried() {
    async fn names(State(mock): State<Mock>, Json(body): Json<Value>) -> Response {
        mock.record("byids", body);
        if mock.hits.fetch_add(1, Ordering::SeqCst) == 0 {
            return (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response();
        }
        Json(json!({ "items": [{ "id": 900, "name": "Pump 1019" }] })).into_response()
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/assets/byids", ROOT), post(names))
        .with_state(mock.clone());
    let api = serve(router).await;

    let names = api.resource_names(ResourceType::Asset, &[900]).await.unwrap();
    assert_eq!(names.get(&900).map(String::as_str), Some("Pump 1019"));
    assert_eq!(mock.hits.load(Ordering::SeqCst), 2);
    assert_eq!(mock.bodies("byids")[0]["ignoreUnknownIds"], true);
}

#[tokio::test]
async fn client_errors_fail_immediately() {
    async fn reject(State(mock): State<Mock>) -> Response {
        mock.hits.fetch_add(1, Ordering::SeqCst);
        (StatusCode::BAD_REQUEST, "invalid job").into_response()
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/context/diagram/detect", ROOT), post(reject))
        .with_state(mock.clone());
    let api = serve(router).await;

    let request = DetectRequest {
        items: vec![JobItem { file_id: 1 }],
        entities: Vec::new(),
        search_field: "name".to_string(),
        min_tokens: 2,
        partial_match: false,
    };
    let err = api.submit_detection(&request).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 400, .. }));
    assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn detection_submission_is_sent_once() {
    async fn submit(State(mock): State<Mock>, Json(body): Json<Value>) -> Response {
        mock.record("detect", body);
        if mock.hits.fetch_add(1, Ordering::SeqCst) == 0 {
            return (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response();
        }
        Json(json!({ "jobId": 78, "status": "Queued" })).into_response()
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/context/diagram/detect", ROOT), post(submit))
        .with_state(mock.clone());
    let api = serve(router).await;

    let request = DetectRequest {
        items: vec![JobItem { file_id: 1 }],
        entities: Vec::new(),
        search_field: "name".to_string(),
        min_tokens: 2,
        partial_match: false,
    };
    let err = api.submit_detection(&request).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 503, .. }));
    assert_eq!(mock.bodies("detect").len(), 1);
}

#[tokio::test]
async fn annotation_creation_is_sent_once() {
    async fn create(State(mock): State<Mock>, Json(body): Json<Value>) -> Response {
        mock.record("annotations", body);
        (StatusCode::BAD_GATEWAY, "upstream").into_response()
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/annotations", ROOT), post(create))
        .with_state(mock.clone());
    let api = serve(router).await;

    let create = AnnotationCreate {
        annotation_type: ApiAnnotationType::AssetLink,
        annotated_resource_type: "file",
        annotated_resource_id: 5,
        status: ApiStatus::Suggested,
        creating_app: "test-app".to_string(),
        creating_app_version: "1".to_string(),
        creating_user: None,
        data: ApiAnnotationData {
            text: "21-PT-1019".to_string(),
            text_region: BoundingBox::default(),
            page_number: Some(1),
            asset_ref: Some(ResourceRef {
                id: Some(900),
                external_id: None,
            }),
            file_ref: None,
        },
    };
    let err = api.create_annotations(&[create]).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 502, .. }));
    assert_eq!(mock.bodies("annotations").len(), 1);
}

#[tokio::test]
async fn label_definition_conflict_counts_as_existing() {
    async fn list(Json(_body): Json<Value>) -> Json<Value> {
        Json(json!({ "items": [] }))
    }
    async fn create(State(mock): State<Mock>, Json(body): Json<Value>) -> Response {
        mock.record("labels", body);
        (StatusCode::CONFLICT, "duplicated externalId").into_response()
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/labels/list", ROOT), post(list))
        .route(&format!("{}/labels", ROOT), post(create))
        .with_state(mock.clone());
    let api = serve(router).await;

    api.ensure_label(&PENDING_LABEL).await.unwrap();
    assert_eq!(mock.bodies("labels").len(), 1);
}

#[tokio::test]
async fn sibling_files_reconcile_without_label_race() {
    async fn empty(Json(_body): Json<Value>) -> Json<Value> {
        Json(json!({ "items": [] }))
    }
    async fn create_annotations(Json(body): Json<Value>) -> Json<Value> {
        let items: Vec<Value> = body["items"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, mut item)| {
                item["id"] = json!(100 + i);
                item
            })
            .collect();
        Json(json!({ "items": items }))
    }
    async fn list_labels(State(mock): State<Mock>, Json(_body): Json<Value>) -> Json<Value> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let items: Vec<Value> = mock
            .bodies("labels")
            .iter()
            .map(|b| b["items"][0].clone())
            .collect();
        Json(json!({ "items": items }))
    }
    async fn create_label(State(mock): State<Mock>, Json(body): Json<Value>) -> Response {
        if !mock.bodies("labels").is_empty() {
            return (StatusCode::CONFLICT, "duplicated externalId").into_response();
        }
        mock.record("labels", body);
        Json(json!({})).into_response()
    }
    async fn update(State(mock): State<Mock>, Json(body): Json<Value>) -> Json<Value> {
        mock.record("files/update", body);
        Json(json!({}))
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/events/list", ROOT), post(empty))
        .route(&format!("{}/annotations/list", ROOT), post(empty))
        .route(&format!("{}/annotations", ROOT), post(create_annotations))
        .route(&format!("{}/labels/list", ROOT), post(list_labels))
        .route(&format!("{}/labels", ROOT), post(create_label))
        .route(&format!("{}/files/update", ROOT), post(update))
        .with_state(mock.clone());
    let api = serve(router).await;
    let engine = ReconciliationEngine::new(Arc::new(api), "test-app");

    let detections = vec![detected(0.1, 900)];
    let (a, b) = tokio::join!(
        engine.reconcile_file(1, &detections),
        engine.reconcile_file(2, &detections),
    );
    assert_eq!(a.unwrap().label, FileLabel::Pending);
    assert_eq!(b.unwrap().label, FileLabel::Pending);
    assert_eq!(mock.bodies("labels").len(), 1);
    assert_eq!(mock.bodies("files/update").len(), 2);
}

#[tokio::test]
async fn label_definition_created_only_when_missing() {
    async fn list(State(mock): State<Mock>, Json(body): Json<Value>) -> Json<Value> {
        mock.record("labels/list", body);
        Json(json!({ "items": [] }))
    }
    async fn create(State(mock): State<Mock>, Json(body): Json<Value>) -> Json<Value> {
        mock.record("labels", body);
        Json(json!({}))
    }
    async fn update(State(mock): State<Mock>, Json(body): Json<Value>) -> Json<Value> {
        mock.record("files/update", body);
        Json(json!({}))
    }

    let mock = Mock::default();
    let router = Router::new()
        .route(&format!("{}/labels/list", ROOT), post(list))
        .route(&format!("{}/labels", ROOT), post(create))
        .route(&format!("{}/files/update", ROOT), post(update))
        .with_state(mock.clone());
    let api = serve(router).await;

    api.ensure_label(&PENDING_LABEL).await.unwrap();
    let created = mock.bodies("labels");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["items"][0]["externalId"], PENDING_LABEL.external_id);

    let patch = LabelPatch::towards(9, FileLabel::Pending);
    api.update_file_labels(std::slice::from_ref(&patch)).await.unwrap();
    let update = &mock.bodies("files/update")[0];
    assert_eq!(update["items"][0]["id"], 9);
    let labels = &update["items"][0]["update"]["labels"];
    assert_eq!(labels["add"][0]["externalId"], PENDING_LABEL.external_id);
    assert_eq!(labels["remove"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn convert_status_picks_the_requested_file() {
    async fn status(Path(_job_id): Path<u64>) -> Json<Value> {
        Json(json!({
            "items": [
                { "fileId": 1, "status": "Running" },
                { "fileId": 2, "status": "Completed", "svgId": 4242 }
            ]
        }))
    }

    let router = Router::new().route(
        &format!("{}/context/diagram/convert/{{job_id}}", ROOT),
        get(status),
    );
    let api = serve(router).await;

    let item = api.convert_status(5, 2).await.unwrap();
    assert_eq!(item.status, "Completed");
    assert_eq!(item.svg_id, Some(4242));

    let missing = api.convert_status(5, 3).await.unwrap_err();
    assert!(matches!(missing, ApiError::NotFound(_)));
}

fn detected(x: f64, asset_id: u64) -> DetectedAnnotation {
    let region = BoundingBox {
        x_min: x,
        y_min: 0.1,
        x_max: x + 0.05,
        y_max: 0.15,
    };
    DetectedAnnotation {
        text: "21-PT-1019".to_string(),
        confidence: Some(0.9),
        entities: vec![DetectedEntity {
            resource_type: ResourceType::Asset,
            id: asset_id,
            external_id: None,
        }],
        region: Region {
            shape: "rectangle".to_string(),
            vertices: bounding_box_to_vertices(&region),
            page: 1,
        },
    }
}
