//! Zero-copy columnar ingestion over Arrow Flight.
//!
//! `DoPut` accepts record batches with columns `timestamp: Int64` (Unix
//! milliseconds), `value: Float64`, and either a `tags: Map<Utf8, Utf8>`
//! column or additional `Utf8` columns treated as label name/value pairs.
//! A missing `__name__` label defaults to the first element of the flight
//! descriptor path. Contiguous rows with identical tags batch into one
//! storage write; rows with a null timestamp or value are skipped.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use arrow::array::{
    Array,
    AsArray,
    Float64Array,
    Int64Array,
    MapArray,
    RecordBatch,
    StringArray,
};
use arrow::datatypes::DataType;
use arrow_flight::{
    decode::FlightRecordBatchStream,
    error::FlightError,
    flight_service_server::FlightService,
    Action,
    ActionType,
    Criteria,
    Empty,
    FlightData,
    FlightDescriptor,
    FlightInfo,
    HandshakeRequest,
    HandshakeResponse,
    PollInfo,
    PutResult,
    SchemaResult,
    Ticket,
};
use common::{
    Labels,
    TimeSeries,
    METRIC_NAME_LABEL,
};
use errors::ErrorMetadataAnyhowExt;
use futures::{
    stream::BoxStream,
    StreamExt,
    TryStreamExt,
};
use storage::FilteringStorage;
use tonic::{
    Request,
    Response,
    Status,
    Streaming,
};

const TIMESTAMP_COLUMN: &str = "timestamp";
const VALUE_COLUMN: &str = "value";
const TAGS_COLUMN: &str = "tags";

pub struct MetricsFlightService {
    storage: Arc<FilteringStorage>,
}

type TagMap = BTreeMap<String, String>;

/// Per-batch view of the label columns: either the `tags` map column or
/// the trailing string columns.
enum TagSource<'a> {
    Map(&'a MapArray),
    Columns(Vec<(&'a str, &'a StringArray)>),
}

impl TagSource<'_> {
    fn tags_for_row(&self, row: usize, default_name: &str) -> TagMap {
        let mut tags = TagMap::new();
        match self {
            TagSource::Map(map) => {
                if !map.is_null(row) {
                    let offsets = map.value_offsets();
                    let keys = map.keys().as_string::<i32>();
                    let values = map.values().as_string::<i32>();
                    for i in offsets[row] as usize..offsets[row + 1] as usize {
                        if keys.is_null(i) || values.is_null(i) {
                            continue;
                        }
                        tags.insert(keys.value(i).to_string(), values.value(i).to_string());
                    }
                }
            },
            TagSource::Columns(columns) => {
                for (name, column) in columns {
                    if !column.is_null(row) {
                        tags.insert(name.to_string(), column.value(row).to_string());
                    }
                }
            },
        }
        tags.entry(METRIC_NAME_LABEL.to_string())
            .or_insert_with(|| default_name.to_string());
        tags
    }
}

impl MetricsFlightService {
    pub fn new(storage: Arc<FilteringStorage>) -> Self {
        Self { storage }
    }

    fn column_as<'a, T: 'static>(
        batch: &'a RecordBatch,
        name: &str,
        fallback_index: usize,
    ) -> Option<&'a T> {
        let column = match batch.schema().index_of(name) {
            Ok(index) => batch.column(index),
            Err(_) => batch.columns().get(fallback_index)?,
        };
        column.as_any().downcast_ref::<T>()
    }

    /// Ingest one record batch, coalescing contiguous equal-tag rows into
    /// single series writes.
    pub async fn ingest_batch(
        &self,
        batch: &RecordBatch,
        default_name: &str,
    ) -> anyhow::Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        if batch.num_columns() < 2 {
            anyhow::bail!(errors::ErrorMetadata::invalid_argument(
                "BadFlightSchema",
                "record batch needs at least timestamp and value columns",
            ));
        }
        let timestamps: &Int64Array = Self::column_as(batch, TIMESTAMP_COLUMN, 0).ok_or_else(
            || {
                errors::ErrorMetadata::invalid_argument(
                    "BadFlightSchema",
                    "timestamp column must be Int64",
                )
            },
        )?;
        let values: &Float64Array = Self::column_as(batch, VALUE_COLUMN, 1).ok_or_else(|| {
            errors::ErrorMetadata::invalid_argument(
                "BadFlightSchema",
                "value column must be Float64",
            )
        })?;

        let schema = batch.schema();
        let tag_source = match schema.index_of(TAGS_COLUMN) {
            Ok(index) => {
                let map = batch.column(index).as_any().downcast_ref::<MapArray>().ok_or_else(
                    || {
                        errors::ErrorMetadata::invalid_argument(
                            "BadFlightSchema",
                            "tags column must be Map<Utf8, Utf8>",
                        )
                    },
                )?;
                TagSource::Map(map)
            },
            Err(_) => {
                let mut columns = Vec::new();
                for (index, field) in schema.fields().iter().enumerate() {
                    if field.name() == TIMESTAMP_COLUMN || field.name() == VALUE_COLUMN {
                        continue;
                    }
                    if index < 2 && !matches!(field.data_type(), DataType::Utf8) {
                        // Positional timestamp/value columns.
                        continue;
                    }
                    if let Some(column) =
                        batch.column(index).as_any().downcast_ref::<StringArray>()
                    {
                        columns.push((field.name().as_str(), column));
                    }
                }
                TagSource::Columns(columns)
            },
        };

        let metrics = self.storage.store().metrics().clone();
        let mut current: Option<(TagMap, TimeSeries)> = None;
        for row in 0..batch.num_rows() {
            if timestamps.is_null(row) || values.is_null(row) {
                metrics.flight_rows_skipped.inc();
                continue;
            }
            let tags = tag_source.tags_for_row(row, default_name);
            let same_series = current.as_ref().is_some_and(|(last, _)| last == &tags);
            if !same_series {
                if let Some((_, series)) = current.take() {
                    self.storage.write(series).await?;
                }
                let labels = Labels::from_pairs(tags.clone())?;
                current = Some((tags, TimeSeries::new(labels)));
            }
            let (_, series) = current.as_mut().expect("series allocated above");
            series.add_sample(timestamps.value(row), values.value(row))?;
        }
        if let Some((_, series)) = current {
            self.storage.write(series).await?;
        }
        metrics.flight_batches.inc();
        Ok(())
    }
}

fn descriptor_name(descriptor: &FlightDescriptor) -> Option<String> {
    descriptor.path.first().cloned()
}

#[tonic::async_trait]
impl FlightService for MetricsFlightService {
    type HandshakeStream = BoxStream<'static, Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, Result<PutResult, Status>>;
    type DoActionStream = BoxStream<'static, Result<arrow_flight::Result, Status>>;
    type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;
    type DoExchangeStream = BoxStream<'static, Result<FlightData, Status>>;

    async fn do_put(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        // The descriptor rides on the first data message; capture it on
        // the way into the decoder.
        let default_name = Arc::new(parking_lot::Mutex::new(None::<String>));
        let captured = default_name.clone();
        let input = request.into_inner().map_err(FlightError::from).map_ok(
            move |data: FlightData| {
                if let Some(descriptor) = &data.flight_descriptor {
                    if let Some(name) = descriptor_name(descriptor) {
                        *captured.lock() = Some(name);
                    }
                }
                data
            },
        );
        let mut batches = FlightRecordBatchStream::new_from_flight_data(input);
        while let Some(batch) = batches
            .try_next()
            .await
            .map_err(|e| Status::invalid_argument(format!("bad flight stream: {e}")))?
        {
            let name = default_name.lock().clone().unwrap_or_else(|| "unknown".to_string());
            self.ingest_batch(&batch, &name).await.map_err(|e| {
                Status::new(e.error_code().grpc_status_code(), e.user_facing_message())
            })?;
        }
        Ok(Response::new(futures::stream::empty().boxed()))
    }

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Ok(Response::new(futures::stream::empty().boxed()))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("list_flights is not supported"))
    }

    async fn get_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("get_flight_info is not supported"))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("poll_flight_info is not supported"))
    }

    async fn get_schema(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        Err(Status::unimplemented("get_schema is not supported"))
    }

    async fn do_get(
        &self,
        _request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        Err(Status::unimplemented("do_get is not supported; reads go through remote read"))
    }

    async fn do_action(
        &self,
        _request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        Err(Status::unimplemented("do_action is not supported"))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        Ok(Response::new(futures::stream::empty().boxed()))
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        Err(Status::unimplemented("do_exchange is not supported"))
    }
}
