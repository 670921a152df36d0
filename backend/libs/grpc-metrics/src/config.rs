//! Metrics configuration
//!
//! Histogram options are plain values merged onto the defaults of each
//! histogram right before its series are created. `MetricsConfig` bundles
//! everything a registry needs and can be loaded from the environment.

use crate::error::{MetricsError, MetricsResult};
use prometheus::HistogramOpts;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Default buckets for message size histograms, in bytes
pub const DEFAULT_MSG_SIZE_BUCKETS: [f64; 12] = [
    0.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 8192.0, 32768.0, 131072.0, 524288.0,
];

/// Options for one optional histogram
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramConfig {
    /// Bucket upper bounds; `None` keeps the histogram's default buckets.
    /// The `+Inf` bucket is implicit.
    pub buckets: Option<Vec<f64>>,
}

impl HistogramConfig {
    pub fn with_buckets(buckets: Vec<f64>) -> Self {
        Self {
            buckets: Some(buckets),
        }
    }

    /// Reject bucket lists prometheus would refuse or silently misreport
    pub fn validate(&self) -> MetricsResult<()> {
        let Some(buckets) = &self.buckets else {
            return Ok(());
        };

        if buckets.is_empty() {
            return Err(MetricsError::InvalidBuckets(
                "bucket list must not be empty".to_string(),
            ));
        }
        if let Some(b) = buckets.iter().find(|b| !b.is_finite()) {
            return Err(MetricsError::InvalidBuckets(format!(
                "bucket bound {} is not finite",
                b
            )));
        }
        if let Some(pair) = buckets.windows(2).find(|w| w[0] >= w[1]) {
            return Err(MetricsError::InvalidBuckets(format!(
                "bucket bounds must be strictly increasing ({} >= {})",
                pair[0], pair[1]
            )));
        }
        Ok(())
    }

    /// Overlay these options on `base`
    pub fn merge(&self, base: HistogramOpts) -> HistogramOpts {
        match &self.buckets {
            Some(buckets) => base.buckets(buckets.clone()),
            None => base,
        }
    }
}

/// Configuration for a server or client metrics registry
///
/// Histogram entries that are `Some` get enabled at construction. The
/// stream timing and message size entries only apply to the client role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Constant labels attached to every series of the registry
    #[serde(default)]
    pub const_labels: HashMap<String, String>,

    #[serde(default)]
    pub handling_time_histogram: Option<HistogramConfig>,

    #[serde(default)]
    pub stream_receive_time_histogram: Option<HistogramConfig>,

    #[serde(default)]
    pub stream_send_time_histogram: Option<HistogramConfig>,

    #[serde(default)]
    pub msg_size_received_histogram: Option<HistogramConfig>,

    #[serde(default)]
    pub msg_size_sent_histogram: Option<HistogramConfig>,
}

impl MetricsConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `GRPC_METRICS_HANDLING_TIME_HISTOGRAM`: enable handling time histogram (true/false)
    /// - `GRPC_METRICS_HANDLING_TIME_BUCKETS`: comma-separated bucket bounds in seconds
    /// - `GRPC_METRICS_STREAM_RECV_HISTOGRAM`: enable client per-message receive time
    /// - `GRPC_METRICS_STREAM_SEND_HISTOGRAM`: enable client per-message send time
    /// - `GRPC_METRICS_MSG_SIZE_HISTOGRAMS`: enable client message size histograms
    /// - `GRPC_METRICS_CONST_LABELS`: `key=value` pairs separated by commas
    pub fn from_env() -> MetricsResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> MetricsResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| -> MetricsResult<bool> {
            match lookup(key) {
                None => Ok(false),
                Some(v) => parse_bool(&v).ok_or_else(|| {
                    MetricsError::InvalidConfig(format!("{} must be a boolean, got {:?}", key, v))
                }),
            }
        };

        let handling_buckets = lookup("GRPC_METRICS_HANDLING_TIME_BUCKETS")
            .map(|v| parse_buckets(&v))
            .transpose()?;

        // Custom buckets imply the histogram is wanted
        let handling_time_histogram =
            if flag("GRPC_METRICS_HANDLING_TIME_HISTOGRAM")? || handling_buckets.is_some() {
                Some(HistogramConfig {
                    buckets: handling_buckets,
                })
            } else {
                None
            };

        let enabled = |on: bool| on.then(HistogramConfig::default);
        let msg_size = flag("GRPC_METRICS_MSG_SIZE_HISTOGRAMS")?;

        let const_labels = match lookup("GRPC_METRICS_CONST_LABELS") {
            Some(v) => parse_const_labels(&v)?,
            None => HashMap::new(),
        };

        let config = Self {
            const_labels,
            handling_time_histogram,
            stream_receive_time_histogram: enabled(flag("GRPC_METRICS_STREAM_RECV_HISTOGRAM")?),
            stream_send_time_histogram: enabled(flag("GRPC_METRICS_STREAM_SEND_HISTOGRAM")?),
            msg_size_received_histogram: enabled(msg_size),
            msg_size_sent_histogram: enabled(msg_size),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MetricsResult<()> {
        for histogram in [
            &self.handling_time_histogram,
            &self.stream_receive_time_histogram,
            &self.stream_send_time_histogram,
            &self.msg_size_received_histogram,
            &self.msg_size_sent_histogram,
        ]
        .into_iter()
        .flatten()
        {
            histogram.validate()?;
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" => Some(true),
        "0" | "false" | "FALSE" | "False" | "" => Some(false),
        _ => None,
    }
}

fn parse_buckets(value: &str) -> MetricsResult<Vec<f64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>().map_err(|e| {
                MetricsError::InvalidConfig(format!("invalid bucket bound {:?}: {}", s, e))
            })
        })
        .collect()
}

fn parse_const_labels(value: &str) -> MetricsResult<HashMap<String, String>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').ok_or_else(|| {
                MetricsError::InvalidConfig(format!("const label {:?} is not key=value", pair))
            })?;
            Ok((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
