use std::time::SystemTime;

use axum::{
    body::Bytes,
    extract::{
        Path,
        Query,
        State,
    },
    response::{
        IntoResponse,
        Response,
    },
    Json,
};
use common::{
    http::HttpResponseError,
    TimeSeries,
};
use errors::ErrorMetadata;
use http::{
    header::{
        CONTENT_ENCODING,
        CONTENT_TYPE,
    },
    HeaderMap,
};
use pb::{
    remote::{
        ReadRequest,
        ReadResponse,
        WriteRequest,
    },
    Converter,
};
use prost::Message;
use serde::Deserialize;
use serde_json::json;

use crate::{
    snappy,
    state::LocalAppState,
};

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

fn decode_protobuf<M: Message + Default>(body: &[u8]) -> anyhow::Result<M> {
    M::decode(body).map_err(|e| {
        ErrorMetadata::invalid_argument(
            "InvalidProtobuf",
            format!("failed to decode request body: {e}"),
        )
        .into()
    })
}

/// POST /api/v1/write: auth, decompress, decode, write each series.
pub async fn remote_write(
    State(state): State<LocalAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpResponseError> {
    state.check_auth(&headers).await?;
    let body = snappy::maybe_decompress(&headers, &body)?;
    let request: WriteRequest = decode_protobuf(&body)?;
    let series = Converter::from_write_request(request)?;
    for s in series {
        state.storage.write(s).await?;
    }
    Ok(Json(json!({})))
}

/// POST /api/v1/read: auth, decompress, decode, one QueryResult per
/// query, Snappy on the way out when the client advertises it.
pub async fn remote_read(
    State(state): State<LocalAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpResponseError> {
    state.check_auth(&headers).await?;
    let body = snappy::maybe_decompress(&headers, &body)?;
    let request: ReadRequest = decode_protobuf(&body)?;

    let mut response = ReadResponse::default();
    for query in request.queries {
        let mut matchers = Vec::with_capacity(query.matchers.len());
        for matcher in query.matchers {
            matchers.push(Converter::from_proto_matcher(matcher)?);
        }
        let results = state
            .storage
            .query(&matchers, query.start_timestamp_ms, query.end_timestamp_ms)?;
        response.results.push(Converter::to_query_result(&results));
    }

    let encoded = response.encode_to_vec();
    let (body, compressed) = snappy::maybe_compress(&headers, encoded)?;
    let mut builder = http::Response::builder()
        .status(http::StatusCode::OK)
        .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE);
    if compressed {
        builder = builder.header(CONTENT_ENCODING, snappy::SNAPPY);
    }
    let response = builder
        .body(axum::body::Body::from(body))
        .map_err(anyhow::Error::from)?;
    Ok(response)
}

fn series_to_metric_json(series: &TimeSeries) -> serde_json::Value {
    let metric: serde_json::Map<String, serde_json::Value> = series
        .labels()
        .iter_ordered()
        .map(|(name, value)| (name.to_string(), json!(value)))
        .collect();
    json!(metric)
}

fn sample_to_json(sample: &common::Sample) -> serde_json::Value {
    json!([sample.timestamp_ms as f64 / 1000.0, sample.value.to_string()])
}

#[derive(Deserialize)]
pub struct InstantQueryParams {
    query: String,
    // Evaluation time in Unix seconds; defaults to now.
    time: Option<f64>,
}

/// GET /api/v1/query: delegated instant query.
pub async fn query(
    State(state): State<LocalAppState>,
    headers: HeaderMap,
    Query(params): Query<InstantQueryParams>,
) -> Result<impl IntoResponse, HttpResponseError> {
    state.check_auth(&headers).await?;
    let at_ms = params
        .time
        .map_or_else(now_ms, |time| (time * 1000.0) as i64);
    let results = state.query_engine.eval(&params.query, at_ms).await?;
    let result: Vec<serde_json::Value> = results
        .iter()
        .filter_map(|series| {
            let last = series.samples().last()?;
            Some(json!({
                "metric": series_to_metric_json(series),
                "value": sample_to_json(last),
            }))
        })
        .collect();
    Ok(Json(json!({
        "status": "success",
        "data": { "resultType": "vector", "result": result },
    })))
}

#[derive(Deserialize)]
pub struct RangeQueryParams {
    query: String,
    // Unix seconds.
    start: f64,
    end: f64,
    #[allow(dead_code)]
    step: Option<f64>,
}

/// GET /api/v1/query_range: delegated range query. Samples are returned
/// at their stored resolution.
pub async fn query_range(
    State(state): State<LocalAppState>,
    headers: HeaderMap,
    Query(params): Query<RangeQueryParams>,
) -> Result<impl IntoResponse, HttpResponseError> {
    state.check_auth(&headers).await?;
    if params.end < params.start {
        return Err(anyhow::Error::from(ErrorMetadata::invalid_argument(
            "InvertedRange",
            format!("range end {} precedes range start {}", params.end, params.start),
        ))
        .into());
    }
    let start_ms = (params.start * 1000.0) as i64;
    let end_ms = (params.end * 1000.0) as i64;
    let results = state.query_engine.eval(&params.query, end_ms).await?;
    let result: Vec<serde_json::Value> = results
        .iter()
        .filter_map(|series| {
            let values: Vec<serde_json::Value> = series
                .samples()
                .iter()
                .filter(|s| s.timestamp_ms >= start_ms && s.timestamp_ms <= end_ms)
                .map(sample_to_json)
                .collect();
            if values.is_empty() {
                return None;
            }
            Some(json!({
                "metric": series_to_metric_json(series),
                "values": values,
            }))
        })
        .collect();
    Ok(Json(json!({
        "status": "success",
        "data": { "resultType": "matrix", "result": result },
    })))
}

/// GET /api/v1/labels
pub async fn labels(
    State(state): State<LocalAppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpResponseError> {
    state.check_auth(&headers).await?;
    Ok(Json(json!({
        "status": "success",
        "data": state.storage.label_names(),
    })))
}

/// GET /api/v1/label/{name}/values
pub async fn label_values(
    State(state): State<LocalAppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, HttpResponseError> {
    state.check_auth(&headers).await?;
    Ok(Json(json!({
        "status": "success",
        "data": state.storage.label_values(&name),
    })))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// GET /metrics: engine counters plus the one-line storage summary.
pub async fn metrics(State(state): State<LocalAppState>) -> impl IntoResponse {
    let mut snapshot = state.metrics().to_json();
    snapshot["stats"] = json!(state.storage.stats());
    Json(snapshot)
}
