use std::sync::LazyLock;

use prometheus::{Histogram, HistogramOpts, HistogramVec};

/// Process-wide callback latency histograms, labeled by observer name and
/// callback kind.
static OBSERVER_DURATIONS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let histograms = HistogramVec::new(
        HistogramOpts::new(
            "catalog_loop_observer_duration_seconds",
            "Wall-clock duration of catalog loop observer callbacks",
        ),
        &["observer", "kind"],
    )
    .expect("histogram options are statically valid");

    // Registration only fails when the collector already exists, which is
    // fine for our purposes.
    let _ = prometheus::register(Box::new(histograms.clone()));

    histograms
});

pub(crate) const KIND_OBJECT: &str = "object";
pub(crate) const KIND_REMOTE: &str = "remote";
pub(crate) const KIND_INLINE: &str = "inline";

/// Samples buffered per observer context and published to the process-wide
/// registry when the observer finishes. The shared histogram takes a lock
/// per observation, so the hot path only appends to a plain vector.
pub(crate) struct LocalDurations {
    histogram: Histogram,
    samples: Vec<f64>,
}

impl LocalDurations {
    pub(crate) fn observe(&mut self, seconds: f64) {
        self.samples.push(seconds);
    }

    pub(crate) fn flush(&mut self) {
        for sample in self.samples.drain(..) {
            self.histogram.observe(sample);
        }
    }
}

pub(crate) fn local_timer(observer: &str, kind: &str) -> LocalDurations {
    LocalDurations {
        histogram: OBSERVER_DURATIONS.with_label_values(&[observer, kind]),
        samples: Vec::new(),
    }
}

#[cfg(test)]
pub(crate) fn sample_count(observer: &str, kind: &str) -> u64 {
    OBSERVER_DURATIONS.with_label_values(&[observer, kind]).get_sample_count()
}
