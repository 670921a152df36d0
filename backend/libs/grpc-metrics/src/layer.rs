/// Tower Layer instrumenting unary server handlers
use crate::labels::GrpcType;
use crate::reporter::ServerReporter;
use crate::server::ServerMetrics;
use crate::status::code_from_error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::{Code, Request, Response};
use tower::{BoxError, Layer, Service};

/// Server metrics layer for one unary method
#[derive(Clone)]
pub struct ServerMetricsLayer {
    metrics: ServerMetrics,
    full_method: Arc<str>,
}

impl ServerMetricsLayer {
    pub fn new(metrics: ServerMetrics, full_method: impl Into<String>) -> Self {
        Self {
            metrics,
            full_method: Arc::from(full_method.into()),
        }
    }
}

impl<S> Layer<S> for ServerMetricsLayer {
    type Service = ServerMetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ServerMetricsService {
            inner: service,
            metrics: self.metrics.clone(),
            full_method: self.full_method.clone(),
        }
    }
}

/// Service produced by `ServerMetricsLayer`
///
/// Errors are boxed the way tower middleware usually hands them on; the
/// reported code comes from the first `tonic::Status` in the error's source
/// chain, or `Unknown` if there is none.
#[derive(Clone)]
pub struct ServerMetricsService<S> {
    inner: S,
    metrics: ServerMetrics,
    full_method: Arc<str>,
}

impl<S, Req, Resp> Service<Request<Req>> for ServerMetricsService<S>
where
    S: Service<Request<Req>, Response = Response<Resp>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<Req>) -> Self::Future {
        // The clone is ready only after its own poll_ready; swap so the
        // readied service handles this request
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let reporter = ServerReporter::new(self.metrics.clone(), GrpcType::Unary, &self.full_method);

        Box::pin(async move {
            reporter.received_message();
            let result = inner.call(req).await.map_err(Into::<BoxError>::into);

            let code = match &result {
                Ok(_) => {
                    reporter.sent_message();
                    Code::Ok
                }
                Err(err) => code_from_error(&**err),
            };
            reporter.handled(code);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;
    use tonic::Status;
    use tower::{service_fn, ServiceExt};

    fn handled(metrics: &ServerMetrics, code: &str) -> f64 {
        metrics
            .collect()
            .iter()
            .filter(|f| f.get_name() == "grpc_server_handled_total")
            .flat_map(|f| f.get_metric())
            .filter(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == "grpc_code" && l.get_value() == code)
            })
            .map(|m| m.get_counter().get_value())
            .sum()
    }

    #[tokio::test]
    async fn test_layer_reports_unary_calls() {
        let metrics = ServerMetrics::new();
        let handler = service_fn(|req: Request<u32>| async move {
            if *req.get_ref() == 0 {
                Err(Status::invalid_argument("zero"))
            } else {
                Ok(Response::new(req.into_inner() * 2))
            }
        });
        let mut service = metrics.layer("/calc.Calculator/Double").layer(handler);

        let response = service
            .ready()
            .await
            .unwrap()
            .call(Request::new(21))
            .await
            .unwrap();
        assert_eq!(response.into_inner(), 42);

        let err = service
            .ready()
            .await
            .unwrap()
            .call(Request::new(0))
            .await
            .unwrap_err();
        let status = err.downcast_ref::<Status>().expect("status passed through");
        assert_eq!(status.code(), Code::InvalidArgument);

        assert_eq!(handled(&metrics, "OK"), 1.0);
        assert_eq!(handled(&metrics, "InvalidArgument"), 1.0);
    }

    #[derive(Debug, thiserror::Error)]
    #[error("upstream call failed")]
    struct UpstreamError(#[source] Status);

    #[tokio::test]
    async fn test_layer_maps_boxed_errors() {
        let metrics = ServerMetrics::new();
        let handler = service_fn(|req: Request<u32>| async move {
            let err: BoxError = match req.into_inner() {
                0 => "no status inside".into(),
                _ => Box::new(UpstreamError(Status::unavailable("down"))),
            };
            Err::<Response<u32>, _>(err)
        });
        let mut service = metrics.layer("/calc.Calculator/Double").layer(handler);

        for input in [0, 1] {
            let err = service
                .ready()
                .await
                .unwrap()
                .call(Request::new(input))
                .await
                .unwrap_err();
            assert!(err.downcast_ref::<Status>().is_none());
        }

        assert_eq!(handled(&metrics, "Unknown"), 1.0);
        assert_eq!(handled(&metrics, "Unavailable"), 1.0);
        assert_eq!(handled(&metrics, "OK"), 0.0);
    }
}
