//! Optional, lazily instantiated histogram series
//!
//! A slot starts disabled. The first successful `enable` merges the supplied
//! options onto the defaults and creates the `HistogramVec`; every later call
//! is a no-op. Readers on the RPC path only ever see a fully built vector.

use crate::config::HistogramConfig;
use crate::error::MetricsResult;
use crate::labels::{CallLabels, CALL_LABELS};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Histogram, HistogramOpts, HistogramTimer, HistogramVec};
use tracing::{debug, warn};

pub struct HistogramSlot {
    opts: Mutex<HistogramOpts>,
    vec: OnceCell<HistogramVec>,
}

impl HistogramSlot {
    pub(crate) fn new(opts: HistogramOpts) -> Self {
        Self {
            opts: Mutex::new(opts),
            vec: OnceCell::new(),
        }
    }

    /// Create the series; returns `Ok(false)` if they already existed
    ///
    /// Options passed once the series exist are ignored without validation.
    pub(crate) fn enable(&self, config: &HistogramConfig) -> MetricsResult<bool> {
        let mut opts = self.opts.lock();
        if self.vec.get().is_some() {
            debug!(
                histogram = %opts.common_opts.name,
                "Histogram already enabled, ignoring new options"
            );
            return Ok(false);
        }

        if let Err(e) = config.validate() {
            warn!(histogram = %opts.common_opts.name, error = %e, "Rejected histogram options");
            return Err(e);
        }

        let merged = config.merge(opts.clone());
        let vec = HistogramVec::new(merged.clone(), &CALL_LABELS)?;
        *opts = merged;
        // Holding the options lock serializes initializers
        let _ = self.vec.set(vec);

        debug!(
            histogram = %opts.common_opts.name,
            buckets = ?opts.buckets,
            "Histogram enabled"
        );
        Ok(true)
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.vec.get().is_some()
    }

    pub(crate) fn series(&self, labels: &CallLabels) -> Option<Histogram> {
        self.vec.get().map(|v| v.with_label_values(&labels.values()))
    }

    pub(crate) fn start_timer(&self, labels: &CallLabels) -> Option<HistogramTimer> {
        self.series(labels).map(|h| h.start_timer())
    }

    pub(crate) fn observe(&self, labels: &CallLabels, value: f64) {
        if let Some(h) = self.series(labels) {
            h.observe(value);
        }
    }

    /// Reference the series for `labels` so it is exported before first use
    pub(crate) fn touch(&self, labels: &CallLabels) {
        let _ = self.series(labels);
    }

    pub(crate) fn desc(&self) -> Vec<&Desc> {
        self.vec.get().map(|v| v.desc()).unwrap_or_default()
    }

    pub(crate) fn collect(&self) -> Vec<MetricFamily> {
        self.vec.get().map(|v| v.collect()).unwrap_or_default()
    }
}
