//! gRPC Metrics - Prometheus RED metrics for tonic servers and clients
//!
//! Instruments every RPC with per-method counters and optional latency and
//! size histograms, labeled by call shape, service, method and status code:
//! - `grpc_{server,client}_started_total` / `handled_total`
//! - `grpc_{server,client}_msg_received_total` / `msg_sent_total`
//! - `grpc_{server,client}_handling_seconds` (opt-in)
//! - client per-message and payload-size histograms (opt-in)
//!
//! Every started call is reported as handled exactly once, including calls
//! whose future or stream is dropped mid-flight (reported as `Canceled`).
//!
//! Usage:
//! ```ignore
//! use grpc_metrics::{HistogramConfig, MethodDescriptor, ServerMetrics};
//!
//! let metrics = ServerMetrics::new();
//! metrics.enable_handling_time_histogram(HistogramConfig::default())?;
//! metrics.register(prometheus::default_registry())?;
//! metrics.initialize_metrics(&services);
//!
//! // inside a tonic service implementation
//! async fn get_room(&self, request: Request<GetRoomRequest>) -> Result<Response<Room>, Status> {
//!     self.metrics
//!         .unary("/chat.v1.RoomService/GetRoom", request, |req| self.load_room(req))
//!         .await
//! }
//! ```

mod client;
mod config;
mod counters;
mod defaults;
mod error;
mod histogram;
mod labels;
pub mod layer;
mod preregister;
mod reporter;
mod server;
mod status;
pub mod stream;
pub mod streaming;

pub use client::{ClientMetrics, ClientStatsHandler, RpcStats};
pub use config::{HistogramConfig, MetricsConfig, DEFAULT_MSG_SIZE_BUCKETS};
pub use defaults::{
    default_client_metrics, default_server_metrics, init_default_client_metrics,
    init_default_server_metrics,
};
pub use error::{MetricsError, MetricsResult};
pub use labels::{code_label, split_method_name, CallLabels, GrpcType, MethodDescriptor};
pub use layer::{ServerMetricsLayer, ServerMetricsService};
pub use preregister::{MethodInfo, ServiceInfo, ServiceInfoProvider};
pub use reporter::{CallReporter, ClientReporter, RoleMetrics, ServerReporter};
pub use server::ServerMetrics;
pub use status::{code_from_error, status_code};
pub use stream::{ClientChannel, GrpcStream, MonitoredClientStream, MonitoredServerStream, ServerChannel};
pub use streaming::{MonitoredResponseStream, MonitoredStreaming};
