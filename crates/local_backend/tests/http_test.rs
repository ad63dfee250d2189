use std::sync::Arc;

use authentication::{
    Authenticator,
    BearerAuthenticator,
};
use axum::{
    body::Body,
    Router,
};
use common::StorageConfig;
use http::{
    Request,
    StatusCode,
};
use local_backend::{
    router,
    LocalAppState,
};
use pb::remote::{
    label_matcher,
    Label,
    LabelMatcher,
    Query,
    ReadRequest,
    ReadResponse,
    Sample,
    TimeSeries,
    WriteRequest,
};
use prost::Message;
use tower::ServiceExt;

fn test_state(dir: &tempfile::TempDir, authenticator: Option<Arc<dyn Authenticator>>) -> LocalAppState {
    LocalAppState::new(StorageConfig::with_data_dir(dir.path()), authenticator).unwrap()
}

fn cpu_write_request() -> WriteRequest {
    WriteRequest {
        timeseries: vec![TimeSeries {
            labels: vec![
                Label {
                    name: "__name__".to_string(),
                    value: "cpu".to_string(),
                },
                Label {
                    name: "host".to_string(),
                    value: "h1".to_string(),
                },
            ],
            samples: vec![
                Sample {
                    value: 0.5,
                    timestamp: 1000,
                },
                Sample {
                    value: 0.6,
                    timestamp: 2000,
                },
            ],
        }],
    }
}

fn snappy_compress(data: &[u8]) -> Vec<u8> {
    snap::raw::Encoder::new().compress_vec(data).unwrap()
}

fn snappy_decompress(data: &[u8]) -> Vec<u8> {
    snap::raw::Decoder::new().decompress_vec(data).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_remote_write_read_round_trip_with_snappy() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, None);
    let app = router(state.clone());

    // Snappy-compressed WriteRequest with one series and two samples.
    let write_body = snappy_compress(&cpu_write_request().encode_to_vec());
    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/write")
            .header("content-encoding", "snappy")
            .body(Body::from(write_body))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    assert_eq!(body, b"{}");

    // ReadRequest for __name__="cpu" over [0, 3000), Snappy both ways.
    let read_request = ReadRequest {
        queries: vec![Query {
            start_timestamp_ms: 0,
            end_timestamp_ms: 3000,
            matchers: vec![LabelMatcher {
                r#type: label_matcher::Type::Eq as i32,
                name: "__name__".to_string(),
                value: "cpu".to_string(),
            }],
        }],
    };
    let read_body = snappy_compress(&read_request.encode_to_vec());
    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/read")
            .header("content-encoding", "snappy")
            .header("accept-encoding", "snappy")
            .body(Body::from(read_body))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let response = ReadResponse::decode(snappy_decompress(&body).as_slice()).unwrap();
    assert_eq!(response.results.len(), 1);
    let series = &response.results[0].timeseries;
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].samples, cpu_write_request().timeseries[0].samples);

    state.storage.close().await.unwrap();
}

#[tokio::test]
async fn test_write_rejects_bad_bodies() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, None);
    let app = router(state.clone());

    // Corrupt snappy framing.
    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/write")
            .header("content-encoding", "snappy")
            .body(Body::from("definitely not snappy"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["status"], "error");
    assert_eq!(envelope["errorType"], "invalid-argument");

    // Valid snappy, broken protobuf.
    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/write")
            .header("content-encoding", "snappy")
            .body(Body::from(snappy_compress(b"\xff\xff\xff\xff")))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["errorType"], "invalid-argument");

    // Wrong method.
    let (status, _) = send(
        &app,
        Request::builder()
            .method("GET")
            .uri("/api/v1/write")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    state.storage.close().await.unwrap();
}

#[tokio::test]
async fn test_authentication_gates_requests() {
    let dir = tempfile::tempdir().unwrap();
    let mut bearer = BearerAuthenticator::new();
    bearer.add_token("tok-1", Some("tenant-a".to_string()));
    let state = test_state(&dir, Some(Arc::new(bearer)));
    let app = router(state.clone());

    let write_body = cpu_write_request().encode_to_vec();
    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/write")
            .body(Body::from(write_body.clone()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let envelope: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(envelope["status"], "error");
    assert_eq!(envelope["errorType"], "unauthenticated");

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/write")
            .header("authorization", "Bearer tok-1")
            .body(Body::from(write_body))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    state.storage.close().await.unwrap();
}

#[tokio::test]
async fn test_labels_and_query_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, None);
    let app = router(state.clone());

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/write")
            .body(Body::from(cpu_write_request().encode_to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Request::builder().uri("/api/v1/labels").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(response["status"], "success");
    assert_eq!(response["data"], serde_json::json!(["__name__", "host"]));

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/api/v1/label/host/values")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(response["data"], serde_json::json!(["h1"]));

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/api/v1/label/nonexistent/values")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(response["data"], serde_json::json!([]));

    // Delegated instant query over the stored series.
    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/api/v1/query?query=cpu&time=3")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(response["status"], "success");
    assert_eq!(response["data"]["resultType"], "vector");
    let result = response["data"]["result"].as_array().unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0]["metric"]["host"], "h1");

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/api/v1/query_range?query=cpu&start=0&end=3")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(response["data"]["resultType"], "matrix");
    let values = response["data"]["result"][0]["values"].as_array().unwrap();
    assert_eq!(values.len(), 2);

    state.storage.close().await.unwrap();
}

#[tokio::test]
async fn test_health_and_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(&dir, None);
    let app = router(state.clone());

    let (status, body) = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, br#"{"status":"ok"}"#);

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/v1/write")
            .body(Body::from(cpu_write_request().encode_to_vec()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let snapshot: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot["samples_ingested_total"], 2.0);
    assert!(snapshot["stats"].as_str().unwrap().contains("series=1"));

    state.storage.close().await.unwrap();
}
