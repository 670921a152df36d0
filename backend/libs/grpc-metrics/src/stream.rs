//! Bidirectional stream capability set and its monitored decorators

use crate::counters::MessageCounters;
use crate::reporter::{ClientReporter, MessageTimers};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tonic::{Code, Status};

/// A live message stream of one call
///
/// `recv_msg` returning `Ok(None)` is a clean end-of-stream; anything the peer
/// or transport reports as a failure is an `Err`.
#[async_trait]
pub trait GrpcStream: Send {
    type Outbound: Send;
    type Inbound: Send;

    async fn send_msg(&mut self, msg: Self::Outbound) -> Result<(), Status>;

    async fn recv_msg(&mut self) -> Result<Option<Self::Inbound>, Status>;

    /// Half-close the outbound direction
    async fn close_send(&mut self) -> Result<(), Status> {
        Ok(())
    }
}

/// Server side of a tonic streaming call
///
/// Reads from the request stream (`tonic::Streaming<Req>`) and writes to the
/// channel backing the response stream.
pub struct ServerChannel<Req, Resp> {
    inbound: BoxStream<'static, Result<Req, Status>>,
    outbound: mpsc::Sender<Result<Resp, Status>>,
}

impl<Req, Resp> ServerChannel<Req, Resp> {
    pub fn new<S>(inbound: S, outbound: mpsc::Sender<Result<Resp, Status>>) -> Self
    where
        S: Stream<Item = Result<Req, Status>> + Send + 'static,
    {
        Self {
            inbound: inbound.boxed(),
            outbound,
        }
    }
}

#[async_trait]
impl<Req, Resp> GrpcStream for ServerChannel<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Outbound = Resp;
    type Inbound = Req;

    async fn send_msg(&mut self, msg: Resp) -> Result<(), Status> {
        self.outbound
            .send(Ok(msg))
            .await
            .map_err(|_| Status::unavailable("response stream closed"))
    }

    async fn recv_msg(&mut self) -> Result<Option<Req>, Status> {
        self.inbound.next().await.transpose()
    }
}

/// Client side of a tonic streaming call
///
/// Writes to the channel feeding the request stream and reads the
/// `tonic::Streaming<Resp>` returned by the call.
pub struct ClientChannel<Req, Resp> {
    outbound: Option<mpsc::Sender<Req>>,
    inbound: BoxStream<'static, Result<Resp, Status>>,
}

impl<Req, Resp> ClientChannel<Req, Resp> {
    pub fn new<S>(outbound: mpsc::Sender<Req>, inbound: S) -> Self
    where
        S: Stream<Item = Result<Resp, Status>> + Send + 'static,
    {
        Self {
            outbound: Some(outbound),
            inbound: inbound.boxed(),
        }
    }
}

#[async_trait]
impl<Req, Resp> GrpcStream for ClientChannel<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Outbound = Req;
    type Inbound = Resp;

    async fn send_msg(&mut self, msg: Req) -> Result<(), Status> {
        match &self.outbound {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| Status::unavailable("request stream closed")),
            None => Err(Status::failed_precondition("send after close_send")),
        }
    }

    async fn recv_msg(&mut self) -> Result<Option<Resp>, Status> {
        self.inbound.next().await.transpose()
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        // Dropping the sender ends the request stream
        self.outbound.take();
        Ok(())
    }
}

/// Server stream decorator counting successfully exchanged messages
pub struct MonitoredServerStream<S> {
    inner: S,
    messages: MessageCounters,
}

impl<S> MonitoredServerStream<S> {
    pub(crate) fn new(inner: S, messages: MessageCounters) -> Self {
        Self { inner, messages }
    }

    /// Unwrap the stream; messages exchanged on it afterwards are not counted
    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: GrpcStream> GrpcStream for MonitoredServerStream<S> {
    type Outbound = S::Outbound;
    type Inbound = S::Inbound;

    async fn send_msg(&mut self, msg: S::Outbound) -> Result<(), Status> {
        let result = self.inner.send_msg(msg).await;
        if result.is_ok() {
            self.messages.sent();
        }
        result
    }

    async fn recv_msg(&mut self) -> Result<Option<S::Inbound>, Status> {
        let result = self.inner.recv_msg().await;
        if let Ok(Some(_)) = result {
            self.messages.received();
        }
        result
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        self.inner.close_send().await
    }
}

/// Client stream decorator
///
/// Counts and optionally times every message, and reports the call as
/// handled the first time a receive ends the stream: `OK` on a clean
/// end-of-stream, the error's code otherwise. Dropping the decorator before
/// that reports the call as canceled.
pub struct MonitoredClientStream<S> {
    inner: S,
    reporter: Option<ClientReporter>,
    messages: MessageCounters,
    timers: MessageTimers,
}

impl<S> MonitoredClientStream<S> {
    pub(crate) fn new(inner: S, reporter: ClientReporter) -> Self {
        Self {
            inner,
            messages: reporter.message_counters(),
            timers: reporter.message_timers(),
            reporter: Some(reporter),
        }
    }

    /// Whether the terminal status has been reported
    pub fn is_finished(&self) -> bool {
        self.reporter.is_none()
    }

    fn finish(&mut self, code: Code) {
        if let Some(reporter) = self.reporter.take() {
            reporter.handled(code);
        }
    }
}

#[async_trait]
impl<S: GrpcStream> GrpcStream for MonitoredClientStream<S> {
    type Outbound = S::Outbound;
    type Inbound = S::Inbound;

    async fn send_msg(&mut self, msg: S::Outbound) -> Result<(), Status> {
        let timer = self.timers.send();
        let result = self.inner.send_msg(msg).await;
        if let Some(timer) = timer {
            timer.observe_duration();
        }

        if result.is_ok() {
            self.messages.sent();
        }
        result
    }

    async fn recv_msg(&mut self) -> Result<Option<S::Inbound>, Status> {
        let timer = self.timers.receive();
        let result = self.inner.recv_msg().await;
        if let Some(timer) = timer {
            timer.observe_duration();
        }

        match &result {
            Ok(Some(_)) => self.messages.received(),
            Ok(None) => self.finish(Code::Ok),
            Err(status) => self.finish(status.code()),
        }
        result
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        self.inner.close_send().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientMetrics;
    use crate::labels::GrpcType;
    use crate::reporter::ServerReporter;
    use crate::server::ServerMetrics;
    use futures::stream;
    use prometheus::core::Collector;

    fn value(metrics: &impl Collector, name: &str) -> f64 {
        metrics
            .collect()
            .iter()
            .filter(|f| f.get_name() == name)
            .flat_map(|f| f.get_metric())
            .map(|m| m.get_counter().get_value())
            .sum()
    }

    #[tokio::test]
    async fn test_server_channel_passthrough() {
        let (tx, mut rx) = mpsc::channel(4);
        let inbound = stream::iter(vec![Ok(1u32), Ok(2u32)]);
        let mut channel = ServerChannel::new(inbound, tx);

        assert_eq!(channel.recv_msg().await.unwrap(), Some(1));
        assert_eq!(channel.recv_msg().await.unwrap(), Some(2));
        assert_eq!(channel.recv_msg().await.unwrap(), None);

        channel.send_msg("pong".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), "pong");

        drop(rx);
        let err = channel.send_msg("late".to_string()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_client_channel_close_send() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut channel = ClientChannel::new(tx, stream::empty::<Result<u32, Status>>());

        channel.send_msg(7u32).await.unwrap();
        channel.close_send().await.unwrap();
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);

        let err = channel.send_msg(8).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_client_stream_handles_error_once() {
        let metrics = ClientMetrics::new();
        let (tx, _rx) = mpsc::channel::<u32>(4);
        let inbound = stream::iter(vec![
            Ok(1u32),
            Err(Status::data_loss("corrupt")),
            Err(Status::data_loss("corrupt")),
        ]);
        let reporter = ClientReporter::new(metrics.clone(), GrpcType::BidiStream, "/svc.S/M");
        let mut monitored = MonitoredClientStream::new(ClientChannel::new(tx, inbound), reporter);

        assert!(monitored.recv_msg().await.unwrap().is_some());
        assert!(monitored.recv_msg().await.is_err());
        assert!(monitored.is_finished());
        assert!(monitored.recv_msg().await.is_err());
        drop(monitored);

        assert_eq!(value(&metrics, "grpc_client_msg_received_total"), 1.0);
        assert_eq!(value(&metrics, "grpc_client_handled_total"), 1.0);
    }

    #[tokio::test]
    async fn test_failed_send_not_counted() {
        let metrics = ClientMetrics::new();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let reporter = ClientReporter::new(metrics.clone(), GrpcType::ClientStream, "/svc.S/M");
        let mut monitored = MonitoredClientStream::new(
            ClientChannel::new(tx, stream::empty::<Result<u32, Status>>()),
            reporter,
        );

        assert!(monitored.send_msg(1u32).await.is_err());
        assert_eq!(value(&metrics, "grpc_client_msg_sent_total"), 0.0);
        assert!(!monitored.is_finished());
    }

    #[tokio::test]
    async fn test_server_stream_counts_only_successes() {
        let metrics = ServerMetrics::new();
        let reporter = ServerReporter::new(metrics.clone(), GrpcType::BidiStream, "/svc.S/M");
        let (tx, rx) = mpsc::channel::<Result<u32, Status>>(4);
        drop(rx);
        let inbound = stream::iter(vec![Ok(1u32), Err(Status::internal("broken"))]);
        let mut monitored =
            MonitoredServerStream::new(ServerChannel::new(inbound, tx), reporter.message_counters());

        assert!(monitored.send_msg(5).await.is_err());
        assert!(monitored.recv_msg().await.unwrap().is_some());
        assert!(monitored.recv_msg().await.is_err());
        assert_eq!(monitored.recv_msg().await.unwrap(), None);

        assert_eq!(value(&metrics, "grpc_server_msg_sent_total"), 0.0);
        assert_eq!(value(&metrics, "grpc_server_msg_received_total"), 1.0);
        // The server call ends with its handler, not with the inbound stream
        assert_eq!(value(&metrics, "grpc_server_handled_total"), 0.0);

        reporter.handled(Code::Ok);
        assert_eq!(value(&metrics, "grpc_server_handled_total"), 1.0);
    }

    #[tokio::test]
    async fn test_server_stream_into_inner_stops_counting() {
        let metrics = ServerMetrics::new();
        let reporter = ServerReporter::new(metrics.clone(), GrpcType::ServerStream, "/svc.S/M");
        let (tx, mut rx) = mpsc::channel(4);
        let mut monitored = MonitoredServerStream::new(
            ServerChannel::new(stream::empty::<Result<u32, Status>>(), tx),
            reporter.message_counters(),
        );

        monitored.send_msg(1u32).await.unwrap();
        let mut raw = monitored.into_inner();
        raw.send_msg(2).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap().unwrap(), 2);
        assert_eq!(value(&metrics, "grpc_server_msg_sent_total"), 1.0);
        reporter.handled(Code::Ok);
    }
}
