//! `Stream` decorators for tonic-native streaming calls
//!
//! Tonic hands server-streaming responses to the transport as a `Stream` and
//! gives clients the response as a `Stream` too. These decorators sit in that
//! position, count every message that passes, and report the call as handled
//! when the stream finishes. A decorator dropped before its stream ends (the
//! peer went away, or the caller stopped reading) reports the call as
//! canceled through its reporter.

use crate::counters::MessageCounters;
use crate::reporter::{CallReporter, ClientReporter, MessageTimers, RoleMetrics, ServerReporter};
use futures::{ready, Stream};
use pin_project::pin_project;
use prometheus::HistogramTimer;
use std::pin::Pin;
use std::task::{Context, Poll};
use tonic::{Code, Status};

fn finish<M: RoleMetrics>(reporter: &mut Option<CallReporter<M>>, code: Code) {
    if let Some(reporter) = reporter.take() {
        reporter.handled(code);
    }
}

/// Server response stream counting each message handed to the transport
#[pin_project]
pub struct MonitoredResponseStream<S> {
    #[pin]
    inner: S,
    reporter: Option<ServerReporter>,
    messages: MessageCounters,
}

impl<S> MonitoredResponseStream<S> {
    pub(crate) fn new(inner: S, reporter: ServerReporter) -> Self {
        Self {
            inner,
            messages: reporter.message_counters(),
            reporter: Some(reporter),
        }
    }
}

impl<S, T> Stream for MonitoredResponseStream<S>
where
    S: Stream<Item = Result<T, Status>>,
{
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.inner.poll_next(cx));

        match &item {
            Some(Ok(_)) => this.messages.sent(),
            Some(Err(status)) => finish(this.reporter, status.code()),
            None => finish(this.reporter, Code::Ok),
        }
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Client response stream counting and timing each received message
#[pin_project]
pub struct MonitoredStreaming<S> {
    #[pin]
    inner: S,
    reporter: Option<ClientReporter>,
    messages: MessageCounters,
    timers: MessageTimers,
    pending: Option<HistogramTimer>,
}

impl<S> MonitoredStreaming<S> {
    pub(crate) fn new(inner: S, reporter: ClientReporter) -> Self {
        Self {
            inner,
            messages: reporter.message_counters(),
            timers: reporter.message_timers(),
            reporter: Some(reporter),
            pending: None,
        }
    }
}

impl<S, T> Stream for MonitoredStreaming<S>
where
    S: Stream<Item = Result<T, Status>>,
{
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        // One receive spans every poll until the item arrives
        if this.pending.is_none() {
            *this.pending = this.timers.receive();
        }
        let item = ready!(this.inner.poll_next(cx));
        if let Some(timer) = this.pending.take() {
            timer.observe_duration();
        }

        match &item {
            Some(Ok(_)) => this.messages.received(),
            Some(Err(status)) => finish(this.reporter, status.code()),
            None => finish(this.reporter, Code::Ok),
        }
        Poll::Ready(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
