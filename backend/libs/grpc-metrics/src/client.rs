//! Client-side metrics registry, call adapters and stats handler

use crate::config::{HistogramConfig, MetricsConfig, DEFAULT_MSG_SIZE_BUCKETS};
use crate::counters::{CallCounters, Role};
use crate::error::MetricsResult;
use crate::histogram::HistogramSlot;
use crate::labels::{GrpcType, MethodDescriptor};
use crate::preregister::{KnownMethods, ServiceInfoProvider};
use crate::reporter::{ClientReporter, RoleMetrics};
use crate::stream::{GrpcStream, MonitoredClientStream};
use crate::streaming::MonitoredStreaming;
use crate::status_code;
use futures::Stream;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, Registry};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Metrics for a gRPC client
///
/// Cheap to clone; clones share the same series.
#[derive(Clone)]
pub struct ClientMetrics {
    inner: Arc<ClientSeries>,
}

struct ClientSeries {
    counters: CallCounters,
    handling_time: HistogramSlot,
    stream_receive_time: HistogramSlot,
    stream_send_time: HistogramSlot,
    msg_size_received: HistogramSlot,
    msg_size_sent: HistogramSlot,
    known_methods: KnownMethods,
}

impl ClientSeries {
    fn histograms(&self) -> [&HistogramSlot; 5] {
        [
            &self.handling_time,
            &self.stream_receive_time,
            &self.stream_send_time,
            &self.msg_size_received,
            &self.msg_size_sent,
        ]
    }
}

impl ClientMetrics {
    /// Create client metrics with every counter and no histograms
    pub fn new() -> Self {
        Self::build(&HashMap::new()).expect("static client metric definitions are valid")
    }

    /// Create client metrics and enable the histograms named in `config`
    pub fn with_config(config: &MetricsConfig) -> MetricsResult<Self> {
        config.validate()?;
        let metrics = Self::build(&config.const_labels)?;

        if let Some(histogram) = &config.handling_time_histogram {
            metrics.enable_client_handling_time_histogram(histogram.clone())?;
        }
        if let Some(histogram) = &config.stream_receive_time_histogram {
            metrics.enable_client_stream_receive_time_histogram(histogram.clone())?;
        }
        if let Some(histogram) = &config.stream_send_time_histogram {
            metrics.enable_client_stream_send_time_histogram(histogram.clone())?;
        }
        if let Some(histogram) = &config.msg_size_received_histogram {
            metrics.enable_msg_size_received_bytes_histogram(histogram.clone())?;
        }
        if let Some(histogram) = &config.msg_size_sent_histogram {
            metrics.enable_msg_size_sent_bytes_histogram(histogram.clone())?;
        }
        Ok(metrics)
    }

    fn build(const_labels: &HashMap<String, String>) -> MetricsResult<Self> {
        let opts = |name: &str, help: &str| {
            HistogramOpts::new(name, help).const_labels(const_labels.clone())
        };

        Ok(Self {
            inner: Arc::new(ClientSeries {
                counters: CallCounters::new(Role::Client, const_labels)?,
                handling_time: HistogramSlot::new(opts(
                    "grpc_client_handling_seconds",
                    "Histogram of response latency (seconds) of the gRPC until it is finished by the application.",
                )),
                stream_receive_time: HistogramSlot::new(opts(
                    "grpc_client_msg_recv_handling_seconds",
                    "Histogram of response latency (seconds) of the gRPC single message receive.",
                )),
                stream_send_time: HistogramSlot::new(opts(
                    "grpc_client_msg_send_handling_seconds",
                    "Histogram of response latency (seconds) of the gRPC single message send.",
                )),
                msg_size_received: HistogramSlot::new(
                    opts(
                        "grpc_client_msg_size_received_bytes",
                        "Histogram of message sizes received by the client.",
                    )
                    .buckets(DEFAULT_MSG_SIZE_BUCKETS.to_vec()),
                ),
                msg_size_sent: HistogramSlot::new(
                    opts(
                        "grpc_client_msg_size_sent_bytes",
                        "Histogram of message sizes sent by the client.",
                    )
                    .buckets(DEFAULT_MSG_SIZE_BUCKETS.to_vec()),
                ),
                known_methods: KnownMethods::default(),
            }),
        })
    }

    /// Turn on recording of call handling time
    pub fn enable_client_handling_time_histogram(&self, config: HistogramConfig) -> MetricsResult<()> {
        self.inner
            .known_methods
            .enable(&self.inner.handling_time, &config)
    }

    /// Turn on recording of single message receive time of streaming calls
    pub fn enable_client_stream_receive_time_histogram(
        &self,
        config: HistogramConfig,
    ) -> MetricsResult<()> {
        self.inner
            .known_methods
            .enable(&self.inner.stream_receive_time, &config)
    }

    /// Turn on recording of single message send time of streaming calls
    pub fn enable_client_stream_send_time_histogram(
        &self,
        config: HistogramConfig,
    ) -> MetricsResult<()> {
        self.inner
            .known_methods
            .enable(&self.inner.stream_send_time, &config)
    }

    /// Turn on recording of received payload sizes (fed by the stats handler)
    pub fn enable_msg_size_received_bytes_histogram(
        &self,
        config: HistogramConfig,
    ) -> MetricsResult<()> {
        self.inner
            .known_methods
            .enable(&self.inner.msg_size_received, &config)
    }

    /// Turn on recording of sent payload sizes (fed by the stats handler)
    pub fn enable_msg_size_sent_bytes_histogram(&self, config: HistogramConfig) -> MetricsResult<()> {
        self.inner
            .known_methods
            .enable(&self.inner.msg_size_sent, &config)
    }

    pub(crate) fn stream_receive_time(&self) -> &HistogramSlot {
        &self.inner.stream_receive_time
    }

    pub(crate) fn stream_send_time(&self) -> &HistogramSlot {
        &self.inner.stream_send_time
    }

    pub fn register(&self, registry: &Registry) -> MetricsResult<()> {
        registry.register(Box::new(self.clone()))?;
        Ok(())
    }

    /// Create zero-valued series for every method the client will call
    pub fn initialize_metrics<P>(&self, provider: &P)
    where
        P: ServiceInfoProvider + ?Sized,
    {
        self.inner.known_methods.register(
            provider,
            &self.inner.counters,
            &self.inner.histograms(),
        );
    }

    /// Stats handler recording payload sizes
    pub fn stats_handler(&self) -> ClientStatsHandler {
        ClientStatsHandler {
            metrics: self.clone(),
        }
    }

    /// Instrument a unary call
    ///
    /// The request counts as sent before invoking; the response counts as
    /// received only when the call succeeds.
    pub async fn unary<Req, Resp, F, Fut>(
        &self,
        full_method: &str,
        request: Request<Req>,
        invoker: F,
    ) -> Result<Response<Resp>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let reporter = ClientReporter::new(self.clone(), GrpcType::Unary, full_method);
        reporter.sent_message();

        let result = invoker(request).await;
        if result.is_ok() {
            reporter.received_message();
        }
        reporter.handled(status_code(&result));
        result
    }

    /// Instrument a streaming call
    ///
    /// If establishing the stream fails the call is reported as handled right
    /// away and the error is returned. Otherwise the stream is wrapped and the
    /// call is reported when a receive hits end-of-stream or an error.
    pub async fn stream<S, F, Fut>(
        &self,
        desc: &MethodDescriptor,
        streamer: F,
    ) -> Result<MonitoredClientStream<S>, Status>
    where
        S: GrpcStream,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, Status>>,
    {
        let reporter = ClientReporter::new(self.clone(), desc.grpc_type(), &desc.full_method);

        match streamer().await {
            Ok(stream) => Ok(MonitoredClientStream::new(stream, reporter)),
            Err(status) => {
                reporter.handled(status.code());
                Err(status)
            }
        }
    }

    /// Instrument a server-streaming call expressed the tonic way
    ///
    /// The request counts as sent once the call is established; the response
    /// stream is wrapped so each message counts as received and the call is
    /// reported when the stream ends, yields an error, or is dropped.
    pub async fn server_streaming<Req, S, T, F, Fut>(
        &self,
        desc: &MethodDescriptor,
        request: Request<Req>,
        invoker: F,
    ) -> Result<Response<MonitoredStreaming<S>>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<S>, Status>>,
        S: Stream<Item = Result<T, Status>>,
    {
        let reporter = ClientReporter::new(self.clone(), desc.grpc_type(), &desc.full_method);

        match invoker(request).await {
            Ok(response) => {
                reporter.sent_message();
                let (metadata, stream, extensions) = response.into_parts();
                let monitored = MonitoredStreaming::new(stream, reporter);
                Ok(Response::from_parts(metadata, monitored, extensions))
            }
            Err(status) => {
                reporter.handled(status.code());
                Err(status)
            }
        }
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleMetrics for ClientMetrics {
    fn call_counters(&self) -> &CallCounters {
        &self.inner.counters
    }

    fn handling_time(&self) -> &HistogramSlot {
        &self.inner.handling_time
    }
}

impl Collector for ClientMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.inner.counters.desc();
        for histogram in self.inner.histograms() {
            descs.extend(histogram.desc());
        }
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.inner.counters.collect();
        for histogram in self.inner.histograms() {
            families.extend(histogram.collect());
        }
        families
    }
}

/// Transport-level events of one RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcStats {
    Begin,
    OutHeader,
    OutPayload { wire_length: usize },
    InHeader,
    InPayload { wire_length: usize },
    InTrailer,
    End,
}

/// Observes payload sizes of client calls
///
/// Only `InPayload` and `OutPayload` events are recorded, and only when the
/// matching message size histogram is enabled.
#[derive(Clone)]
pub struct ClientStatsHandler {
    metrics: ClientMetrics,
}

impl ClientStatsHandler {
    pub fn handle_rpc(&self, desc: &MethodDescriptor, stats: &RpcStats) {
        let (slot, wire_length) = match stats {
            RpcStats::InPayload { wire_length } => (&self.metrics.inner.msg_size_received, wire_length),
            RpcStats::OutPayload { wire_length } => (&self.metrics.inner.msg_size_sent, wire_length),
            _ => return,
        };
        slot.observe(&desc.labels(), *wire_length as f64);
    }
}
