use std::sync::Arc;

use errors::ErrorMetadataAnyhowExt;
use opentelemetry_proto::tonic::collector::metrics::v1::{
    metrics_service_server::MetricsService,
    ExportMetricsServiceRequest,
    ExportMetricsServiceResponse,
};
use tonic::{
    Request,
    Response,
    Status,
};

use crate::bridge::OtelBridge;

/// gRPC `opentelemetry.proto.collector.metrics.v1.MetricsService`.
/// Per-metric conversion failures are absorbed by the bridge; only a
/// whole-request processing error fails the RPC.
pub struct OtelMetricsService {
    bridge: Arc<OtelBridge>,
}

impl OtelMetricsService {
    pub fn new(bridge: Arc<OtelBridge>) -> Self {
        Self { bridge }
    }
}

#[tonic::async_trait]
impl MetricsService for OtelMetricsService {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let request = request.into_inner();
        match self.bridge.export(request.resource_metrics).await {
            Ok(dropped) => {
                if dropped > 0 {
                    tracing::warn!("export dropped {dropped} unsupported metrics");
                }
                Ok(Response::new(ExportMetricsServiceResponse::default()))
            },
            Err(e) => Err(Status::new(
                e.error_code().grpc_status_code(),
                e.user_facing_message(),
            )),
        }
    }
}
