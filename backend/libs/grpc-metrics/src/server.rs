//! Server-side metrics registry and call adapters

use crate::config::{HistogramConfig, MetricsConfig};
use crate::counters::{CallCounters, Role};
use crate::error::MetricsResult;
use crate::histogram::HistogramSlot;
use crate::labels::{GrpcType, MethodDescriptor};
use crate::layer::ServerMetricsLayer;
use crate::preregister::{KnownMethods, ServiceInfoProvider};
use crate::reporter::{RoleMetrics, ServerReporter};
use crate::stream::{GrpcStream, MonitoredServerStream};
use crate::streaming::MonitoredResponseStream;
use crate::status_code;
use futures::Stream;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, Registry};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Metrics for a gRPC server
///
/// Cheap to clone; clones share the same series. Register it on a
/// `prometheus::Registry` (it implements `Collector`) and use it to wrap
/// handlers.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<ServerSeries>,
}

struct ServerSeries {
    counters: CallCounters,
    handling_time: HistogramSlot,
    known_methods: KnownMethods,
}

impl ServerMetrics {
    /// Create server metrics with every counter and no histograms
    pub fn new() -> Self {
        Self::build(&HashMap::new()).expect("static server metric definitions are valid")
    }

    /// Create server metrics and enable the histograms named in `config`
    pub fn with_config(config: &MetricsConfig) -> MetricsResult<Self> {
        config.validate()?;
        let metrics = Self::build(&config.const_labels)?;
        if let Some(histogram) = &config.handling_time_histogram {
            metrics.enable_handling_time_histogram(histogram.clone())?;
        }
        Ok(metrics)
    }

    fn build(const_labels: &HashMap<String, String>) -> MetricsResult<Self> {
        let handling_time = HistogramOpts::new(
            "grpc_server_handling_seconds",
            "Histogram of response latency (seconds) of gRPC that had been application-level handled by the server.",
        )
        .const_labels(const_labels.clone());

        Ok(Self {
            inner: Arc::new(ServerSeries {
                counters: CallCounters::new(Role::Server, const_labels)?,
                handling_time: HistogramSlot::new(handling_time),
                known_methods: KnownMethods::default(),
            }),
        })
    }

    /// Enable the handling time histogram
    ///
    /// Histograms are expensive for the metrics backend to retain and query,
    /// so they are off by default. Only the first successful call takes
    /// effect; later calls are ignored. Enable before registering so the
    /// histogram shows up in the registry's descriptors.
    pub fn enable_handling_time_histogram(&self, config: HistogramConfig) -> MetricsResult<()> {
        self.inner
            .known_methods
            .enable(&self.inner.handling_time, &config)
    }

    pub fn handling_time_histogram_enabled(&self) -> bool {
        self.inner.handling_time.is_enabled()
    }

    /// Register these metrics on `registry`
    pub fn register(&self, registry: &Registry) -> MetricsResult<()> {
        registry.register(Box::new(self.clone()))?;
        Ok(())
    }

    /// Create zero-valued series for every method of every registered service
    ///
    /// Safe to call more than once; already known methods are left untouched.
    pub fn initialize_metrics<P>(&self, provider: &P)
    where
        P: ServiceInfoProvider + ?Sized,
    {
        self.inner.known_methods.register(
            provider,
            &self.inner.counters,
            &[&self.inner.handling_time],
        );
    }

    /// Tower layer instrumenting a unary handler service for `full_method`
    pub fn layer(&self, full_method: impl Into<String>) -> ServerMetricsLayer {
        ServerMetricsLayer::new(self.clone(), full_method)
    }

    /// Instrument a unary call
    ///
    /// The request counts as received before the handler runs; the response
    /// counts as sent only when the handler succeeds. The handler's result is
    /// returned unchanged.
    pub async fn unary<Req, Resp, F, Fut>(
        &self,
        full_method: &str,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let reporter = ServerReporter::new(self.clone(), GrpcType::Unary, full_method);
        reporter.received_message();

        let result = handler(request).await;
        if result.is_ok() {
            reporter.sent_message();
        }
        reporter.handled(status_code(&result));
        result
    }

    /// Instrument a streaming call
    ///
    /// The handler drives a `MonitoredServerStream` wrapping `stream`; the
    /// call is reported as handled with the handler's result once it returns.
    pub async fn stream<S, T, F, Fut>(
        &self,
        desc: &MethodDescriptor,
        stream: S,
        handler: F,
    ) -> Result<T, Status>
    where
        S: GrpcStream,
        F: FnOnce(MonitoredServerStream<S>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let reporter = ServerReporter::new(self.clone(), desc.grpc_type(), &desc.full_method);
        let monitored = MonitoredServerStream::new(stream, reporter.message_counters());

        let result = handler(monitored).await;
        reporter.handled(status_code(&result));
        result
    }

    /// Instrument a server-streaming call expressed the tonic way
    ///
    /// The single request counts as received. On success the handler's
    /// response stream is wrapped so every yielded message counts as sent and
    /// the call is reported as handled when the stream ends, yields an error,
    /// or is dropped.
    pub async fn server_streaming<Req, S, T, F, Fut>(
        &self,
        desc: &MethodDescriptor,
        request: Request<Req>,
        handler: F,
    ) -> Result<Response<MonitoredResponseStream<S>>, Status>
    where
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<S>, Status>>,
        S: Stream<Item = Result<T, Status>>,
    {
        let reporter = ServerReporter::new(self.clone(), desc.grpc_type(), &desc.full_method);
        reporter.received_message();

        match handler(request).await {
            Ok(response) => {
                let (metadata, stream, extensions) = response.into_parts();
                let monitored = MonitoredResponseStream::new(stream, reporter);
                Ok(Response::from_parts(metadata, monitored, extensions))
            }
            Err(status) => {
                reporter.handled(status.code());
                Err(status)
            }
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleMetrics for ServerMetrics {
    fn call_counters(&self) -> &CallCounters {
        &self.inner.counters
    }

    fn handling_time(&self) -> &HistogramSlot {
        &self.inner.handling_time
    }
}

impl Collector for ServerMetrics {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.inner.counters.desc();
        descs.extend(self.inner.handling_time.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.inner.counters.collect();
        families.extend(self.inner.handling_time.collect());
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preregister::{MethodInfo, ServiceInfo};

    fn family_names(metrics: &ServerMetrics) -> Vec<String> {
        metrics
            .desc()
            .iter()
            .map(|d| d.fq_name.clone())
            .collect()
    }

    #[test]
    fn test_disabled_histogram_not_described() {
        let metrics = ServerMetrics::new();
        assert_eq!(family_names(&metrics).len(), 4);
        assert!(!metrics.handling_time_histogram_enabled());

        metrics
            .enable_handling_time_histogram(HistogramConfig::default())
            .unwrap();
        let names = family_names(&metrics);
        assert_eq!(names.len(), 5);
        assert!(names.contains(&"grpc_server_handling_seconds".to_string()));
        assert_eq!(metrics.collect().len(), 5);
    }

    #[test]
    fn test_register_on_registry() {
        let registry = Registry::new();
        let metrics = ServerMetrics::new();
        metrics.register(&registry).unwrap();
        // Same descriptors twice is rejected by the registry
        assert!(metrics.register(&registry).is_err());
    }

    #[test]
    fn test_with_config_enables_histogram_and_const_labels() {
        let mut config = MetricsConfig::default();
        config.handling_time_histogram = Some(HistogramConfig::with_buckets(vec![0.5, 1.0]));
        config
            .const_labels
            .insert("service".to_string(), "chat".to_string());

        let metrics = ServerMetrics::with_config(&config).unwrap();
        assert!(metrics.handling_time_histogram_enabled());
        assert!(metrics.desc().iter().all(|d| d
            .const_label_pairs
            .iter()
            .any(|l| l.get_name() == "service" && l.get_value() == "chat")));
    }

    #[test]
    fn test_reenable_ignores_new_buckets() {
        let metrics = ServerMetrics::new();
        metrics
            .enable_handling_time_histogram(HistogramConfig::default())
            .unwrap();
        assert!(metrics
            .enable_handling_time_histogram(HistogramConfig::with_buckets(vec![2.0, 1.0]))
            .is_ok());
        assert!(metrics.handling_time_histogram_enabled());
    }

    #[test]
    fn test_with_config_rejects_bad_buckets() {
        let config = MetricsConfig {
            handling_time_histogram: Some(HistogramConfig::with_buckets(vec![1.0, 0.1])),
            ..Default::default()
        };
        assert!(ServerMetrics::with_config(&config).is_err());
    }

    #[test]
    fn test_initialize_metrics_counts_series() {
        let metrics = ServerMetrics::new();
        let services = vec![ServiceInfo {
            name: "chat.Room".to_string(),
            methods: vec![
                MethodInfo::new("Join", true, true),
                MethodInfo::new("Info", false, false),
            ],
        }];
        metrics.initialize_metrics(&services);

        let families = metrics.collect();
        assert_eq!(families[0].get_metric().len(), 2);
        assert_eq!(families[1].get_metric().len(), 2 * 17);
    }
}
