//! Mandatory per-call counters shared by the server and client registries

use crate::labels::{CallLabels, ALL_CODES, CALL_CODE_LABELS, CALL_LABELS};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntCounter, IntCounterVec, Opts, Result};
use std::collections::HashMap;
use tonic::Code;

/// Which side of the call a registry instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

/// The started/handled/received/sent counter vectors of one role
#[derive(Clone)]
pub struct CallCounters {
    pub(crate) started: IntCounterVec,
    pub(crate) handled: IntCounterVec,
    pub(crate) msg_received: IntCounterVec,
    pub(crate) msg_sent: IntCounterVec,
}

impl CallCounters {
    pub(crate) fn new(role: Role, const_labels: &HashMap<String, String>) -> Result<Self> {
        let opts = |name: &str, help: &str| {
            Opts::new(format!("grpc_{}_{}", role.as_str(), name), help)
                .const_labels(const_labels.clone())
        };

        let (started_help, handled_help, received_help, sent_help) = match role {
            Role::Server => (
                "Total number of RPCs started on the server.",
                "Total number of RPCs completed on the server, regardless of success or failure.",
                "Total number of RPC stream messages received on the server.",
                "Total number of gRPC stream messages sent by the server.",
            ),
            Role::Client => (
                "Total number of RPCs started on the client.",
                "Total number of RPCs completed by the client, regardless of success or failure.",
                "Total number of RPC stream messages received by the client.",
                "Total number of gRPC stream messages sent by the client.",
            ),
        };

        Ok(Self {
            started: IntCounterVec::new(opts("started_total", started_help), &CALL_LABELS)?,
            handled: IntCounterVec::new(opts("handled_total", handled_help), &CALL_CODE_LABELS)?,
            msg_received: IntCounterVec::new(
                opts("msg_received_total", received_help),
                &CALL_LABELS,
            )?,
            msg_sent: IntCounterVec::new(opts("msg_sent_total", sent_help), &CALL_LABELS)?,
        })
    }

    /// Resolve the per-message counters of one call
    pub(crate) fn messages(&self, labels: &CallLabels) -> MessageCounters {
        let values = labels.values();
        MessageCounters {
            received: self.msg_received.with_label_values(&values),
            sent: self.msg_sent.with_label_values(&values),
        }
    }

    pub(crate) fn started(&self, labels: &CallLabels) -> IntCounter {
        self.started.with_label_values(&labels.values())
    }

    pub(crate) fn handled(&self, labels: &CallLabels, code: Code) -> IntCounter {
        self.handled.with_label_values(&labels.values_with_code(code))
    }

    /// Create zero-valued series for every label combination of one method
    pub(crate) fn touch(&self, labels: &CallLabels) {
        let values = labels.values();
        let _ = self.started.with_label_values(&values);
        let _ = self.msg_received.with_label_values(&values);
        let _ = self.msg_sent.with_label_values(&values);
        for code in ALL_CODES {
            let _ = self.handled(labels, code);
        }
    }

    pub(crate) fn desc(&self) -> Vec<&Desc> {
        let mut descs = Vec::with_capacity(4);
        descs.extend(self.started.desc());
        descs.extend(self.handled.desc());
        descs.extend(self.msg_received.desc());
        descs.extend(self.msg_sent.desc());
        descs
    }

    pub(crate) fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::with_capacity(4);
        families.extend(self.started.collect());
        families.extend(self.handled.collect());
        families.extend(self.msg_received.collect());
        families.extend(self.msg_sent.collect());
        families
    }
}

/// Resolved received/sent counters for a single call
///
/// Cloned into stream decorators so per-message accounting never repeats the
/// label lookup.
#[derive(Clone)]
pub struct MessageCounters {
    received: IntCounter,
    sent: IntCounter,
}

impl MessageCounters {
    pub(crate) fn received(&self) {
        self.received.inc();
    }

    pub(crate) fn sent(&self) {
        self.sent.inc();
    }
}
