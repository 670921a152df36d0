//! Per-call reporters
//!
//! A reporter is created when a call is intercepted and lives exactly as long
//! as the call. Creation counts the call as started; `handled` consumes the
//! reporter, so the terminal event can only be recorded once. A reporter that
//! is dropped without reaching `handled` (the handler future was dropped, or a
//! monitored stream was abandoned) records the call as `Canceled`, which keeps
//! started and handled balanced on every exit path.

use crate::client::ClientMetrics;
use crate::counters::{CallCounters, MessageCounters};
use crate::histogram::HistogramSlot;
use crate::labels::{split_method_name, CallLabels, GrpcType};
use crate::server::ServerMetrics;
use prometheus::HistogramTimer;
use std::time::Instant;
use tonic::Code;
use tracing::debug;

/// Access to the series a reporter mutates
pub trait RoleMetrics: Clone + Send + Sync + 'static {
    #[doc(hidden)]
    fn call_counters(&self) -> &CallCounters;

    #[doc(hidden)]
    fn handling_time(&self) -> &HistogramSlot;
}

pub struct CallReporter<M: RoleMetrics> {
    metrics: M,
    labels: CallLabels,
    messages: MessageCounters,
    start: Instant,
    finished: bool,
}

pub type ServerReporter = CallReporter<ServerMetrics>;
pub type ClientReporter = CallReporter<ClientMetrics>;

impl<M: RoleMetrics> CallReporter<M> {
    /// Start reporting a call; increments the started counter
    pub fn new(metrics: M, grpc_type: GrpcType, full_method: &str) -> Self {
        let (service, method) = split_method_name(full_method);
        let labels = CallLabels::new(grpc_type, service, method);

        let counters = metrics.call_counters();
        counters.started(&labels).inc();
        let messages = counters.messages(&labels);

        Self {
            metrics,
            labels,
            messages,
            start: Instant::now(),
            finished: false,
        }
    }

    pub fn labels(&self) -> &CallLabels {
        &self.labels
    }

    pub fn received_message(&self) {
        self.messages.received();
    }

    pub fn sent_message(&self) {
        self.messages.sent();
    }

    pub(crate) fn message_counters(&self) -> MessageCounters {
        self.messages.clone()
    }

    /// Record the terminal status of the call
    pub fn handled(mut self, code: Code) {
        self.record_handled(code);
    }

    fn record_handled(&mut self, code: Code) {
        self.finished = true;
        self.metrics
            .call_counters()
            .handled(&self.labels, code)
            .inc();
        self.metrics
            .handling_time()
            .observe(&self.labels, self.start.elapsed().as_secs_f64());
    }
}

impl CallReporter<ClientMetrics> {
    /// Timer for one outbound message, if send timing is enabled
    ///
    /// The timer records on `observe_duration` or on drop, so each attempt is
    /// observed exactly once whether or not the send succeeds.
    pub fn send_message_timer(&self) -> Option<HistogramTimer> {
        self.message_timers().send()
    }

    /// Timer for one inbound message, if receive timing is enabled
    pub fn receive_message_timer(&self) -> Option<HistogramTimer> {
        self.message_timers().receive()
    }

    pub(crate) fn message_timers(&self) -> MessageTimers {
        MessageTimers {
            metrics: self.metrics.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Per-message latency timers of one client call
///
/// Outlives the reporter inside stream decorators, so messages exchanged after
/// the terminal event are still timed.
#[derive(Clone)]
pub(crate) struct MessageTimers {
    metrics: ClientMetrics,
    labels: CallLabels,
}

impl MessageTimers {
    pub(crate) fn send(&self) -> Option<HistogramTimer> {
        self.metrics.stream_send_time().start_timer(&self.labels)
    }

    pub(crate) fn receive(&self) -> Option<HistogramTimer> {
        self.metrics.stream_receive_time().start_timer(&self.labels)
    }
}

impl<M: RoleMetrics> Drop for CallReporter<M> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                grpc_type = %self.labels.grpc_type,
                grpc_service = %self.labels.service,
                grpc_method = %self.labels.method,
                "Call dropped before completion, reporting as canceled"
            );
            self.record_handled(Code::Cancelled);
        }
    }
}
