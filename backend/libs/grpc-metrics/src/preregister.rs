//! Method pre-registration
//!
//! Walks every method a server (or client) knows about and creates zero-valued
//! series for it, so that a missing series in a query means "never invoked"
//! rather than "not instrumented".

use crate::config::HistogramConfig;
use crate::counters::CallCounters;
use crate::error::MetricsResult;
use crate::histogram::HistogramSlot;
use crate::labels::{CallLabels, GrpcType};
use parking_lot::Mutex;
use prost_types::FileDescriptorSet;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Bare method name, e.g. `SayHello`
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>, client_streaming: bool, server_streaming: bool) -> Self {
        Self {
            name: name.into(),
            client_streaming,
            server_streaming,
        }
    }

    pub fn grpc_type(&self) -> GrpcType {
        GrpcType::from_streaming(self.client_streaming, self.server_streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Fully qualified service name, e.g. `helloworld.Greeter`
    pub name: String,
    pub methods: Vec<MethodInfo>,
}

/// Enumerates the services and methods registered with an RPC server
pub trait ServiceInfoProvider {
    fn service_info(&self) -> Vec<ServiceInfo>;
}

impl ServiceInfoProvider for [ServiceInfo] {
    fn service_info(&self) -> Vec<ServiceInfo> {
        self.to_vec()
    }
}

impl ServiceInfoProvider for Vec<ServiceInfo> {
    fn service_info(&self) -> Vec<ServiceInfo> {
        self.clone()
    }
}

/// Services described by compiled protobuf descriptors, e.g. the set
/// embedded with `tonic::include_file_descriptor_set!`
impl ServiceInfoProvider for FileDescriptorSet {
    fn service_info(&self) -> Vec<ServiceInfo> {
        self.file
            .iter()
            .flat_map(|file| {
                let package = file.package();
                file.service.iter().map(move |service| {
                    let name = if package.is_empty() {
                        service.name().to_string()
                    } else {
                        format!("{}.{}", package, service.name())
                    };
                    let methods = service
                        .method
                        .iter()
                        .map(|m| {
                            MethodInfo::new(m.name(), m.client_streaming(), m.server_streaming())
                        })
                        .collect();
                    ServiceInfo { name, methods }
                })
            })
            .collect()
    }
}

/// Label tuples pre-registered on one registry
///
/// Remembered so that histograms enabled later get the same zero-valued
/// series. The lock also orders pre-registration against enablement.
#[derive(Default)]
pub(crate) struct KnownMethods {
    labels: Mutex<HashSet<CallLabels>>,
}

impl KnownMethods {
    pub(crate) fn register<P>(
        &self,
        provider: &P,
        counters: &CallCounters,
        histograms: &[&HistogramSlot],
    ) -> usize
    where
        P: ServiceInfoProvider + ?Sized,
    {
        let mut known = self.labels.lock();
        let mut count = 0;

        for service in provider.service_info() {
            for method in &service.methods {
                let labels = CallLabels::new(method.grpc_type(), &service.name, &method.name);
                // Referencing a series creates it at zero without incrementing
                counters.touch(&labels);
                for histogram in histograms {
                    histogram.touch(&labels);
                }
                known.insert(labels);
                count += 1;
            }
        }

        debug!(methods = count, total = known.len(), "Pre-registered gRPC methods");
        count
    }

    /// Enable `slot` and back-fill series for every known method
    pub(crate) fn enable(&self, slot: &HistogramSlot, config: &HistogramConfig) -> MetricsResult<()> {
        let known = self.labels.lock();
        if slot.enable(config)? {
            for labels in known.iter() {
                slot.touch(labels);
            }
        }
        Ok(())
    }
}
