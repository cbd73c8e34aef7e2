//! Process-wide timing and counters for the quantizer pipeline.
//!
//! Every stage of a quantizer call records into a global collector: timed
//! stages through [`span`], element counts through [`add_count`]. The CLI
//! prints [`report`] at the end of a `--verbose` run.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Pipeline stages and counts tracked by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Metric {
    /// Building a quantizer, including remap and weight loading.
    QuantizerFromConfig,
    /// Full forward pass with both projections.
    QuantizerForward,
    /// `z_channels -> e_dim` projection.
    QuantConv,
    /// `e_dim -> z_channels` projection.
    PostQuantConv,
    /// Distance computation and argmin.
    NearestNeighbor,
    /// Gathering codebook rows by index.
    CodebookLookup,
    /// Inference-only index computation.
    CodebookIndex,
    /// Full to compact index translation.
    RemapToUsed,
    /// Compact to full index translation.
    UnmapToAll,
    /// Number of latent positions matched against the codebook.
    PositionsQuantized,
    /// Number of indices missing from the remap table.
    UnknownIndices,
}

impl Metric {
    const ALL: [Metric; 11] = [
        Metric::QuantizerFromConfig,
        Metric::QuantizerForward,
        Metric::QuantConv,
        Metric::PostQuantConv,
        Metric::NearestNeighbor,
        Metric::CodebookLookup,
        Metric::CodebookIndex,
        Metric::RemapToUsed,
        Metric::UnmapToAll,
        Metric::PositionsQuantized,
        Metric::UnknownIndices,
    ];
    const COUNT: usize = Self::ALL.len();

    /// Dotted name used in reports.
    pub fn name(self) -> &'static str {
        match self {
            Metric::QuantizerFromConfig => "quantizer.from_config",
            Metric::QuantizerForward => "quantizer.forward",
            Metric::QuantConv => "projection.quant_conv",
            Metric::PostQuantConv => "projection.post_quant_conv",
            Metric::NearestNeighbor => "codebook.nearest",
            Metric::CodebookLookup => "codebook.lookup",
            Metric::CodebookIndex => "quantizer.codebook_index",
            Metric::RemapToUsed => "remap.to_used",
            Metric::UnmapToAll => "remap.to_all",
            Metric::PositionsQuantized => "codebook.positions",
            Metric::UnknownIndices => "remap.unknown_indices",
        }
    }

    /// Counters accumulate deltas; everything else is a timed stage.
    fn is_counter(self) -> bool {
        matches!(self, Metric::PositionsQuantized | Metric::UnknownIndices)
    }

    fn slot(self) -> usize {
        self as usize
    }
}

struct Collector {
    started: Instant,
    micros: [AtomicU64; Metric::COUNT],
    hits: [AtomicU64; Metric::COUNT],
}

static COLLECTOR: OnceLock<Collector> = OnceLock::new();

fn collector() -> &'static Collector {
    COLLECTOR.get_or_init(|| Collector {
        started: Instant::now(),
        micros: std::array::from_fn(|_| AtomicU64::new(0)),
        hits: std::array::from_fn(|_| AtomicU64::new(0)),
    })
}

/// Timer for one stage; records its elapsed time on drop.
pub struct PerfSpan {
    metric: Metric,
    start: Instant,
}

impl Drop for PerfSpan {
    fn drop(&mut self) {
        add_duration(self.metric, self.start.elapsed());
    }
}

/// Start timing `metric`.
pub fn span(metric: Metric) -> PerfSpan {
    PerfSpan {
        metric,
        start: Instant::now(),
    }
}

/// Record one occurrence of `metric` lasting `duration`.
pub fn add_duration(metric: Metric, duration: Duration) {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    let collector = collector();
    collector.micros[metric.slot()].fetch_add(micros, Ordering::Relaxed);
    collector.hits[metric.slot()].fetch_add(1, Ordering::Relaxed);
}

/// Add `delta` to a counter.
pub fn add_count(metric: Metric, delta: u64) {
    collector().hits[metric.slot()].fetch_add(delta, Ordering::Relaxed);
}

/// Recorded totals for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricTotal {
    /// Which metric.
    pub metric: Metric,
    /// Accumulated time in microseconds (zero for counters).
    pub micros: u64,
    /// Occurrences for stages, accumulated value for counters.
    pub hits: u64,
}

/// Totals for every metric that has recorded anything.
pub fn totals() -> Vec<MetricTotal> {
    let collector = collector();
    Metric::ALL
        .iter()
        .map(|&metric| MetricTotal {
            metric,
            micros: collector.micros[metric.slot()].load(Ordering::Relaxed),
            hits: collector.hits[metric.slot()].load(Ordering::Relaxed),
        })
        .filter(|total| total.hits > 0 || total.micros > 0)
        .collect()
}

/// Human-readable summary: stages by total time, then counters.
pub fn report() -> String {
    let uptime = collector().started.elapsed();
    let (mut counters, mut stages): (Vec<_>, Vec<_>) =
        totals().into_iter().partition(|total| total.metric.is_counter());
    stages.sort_by(|a, b| b.micros.cmp(&a.micros));
    counters.sort_by(|a, b| b.hits.cmp(&a.hits));

    let mut out = String::new();
    let _ = writeln!(out, "vqbook timings after {:.3}s", uptime.as_secs_f64());
    if stages.is_empty() && counters.is_empty() {
        let _ = writeln!(out, "  (nothing recorded)");
        return out;
    }
    for stage in &stages {
        let total_ms = stage.micros as f64 / 1000.0;
        let mean_ms = total_ms / stage.hits.max(1) as f64;
        let _ = writeln!(
            out,
            "  {:<28} {:>10.3}ms total {:>6}x {:>9.3}ms mean",
            stage.metric.name(),
            total_ms,
            stage.hits,
            mean_ms
        );
    }
    for counter in &counters {
        let _ = writeln!(out, "  {:<28} {:>10}", counter.metric.name(), counter.hits);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_recorded_metrics() {
        add_count(Metric::PositionsQuantized, 32);
        add_duration(Metric::NearestNeighbor, Duration::from_millis(2));
        {
            let _span = span(Metric::CodebookLookup);
        }
        let report = report();
        assert!(report.contains("codebook.positions"));
        assert!(report.contains("codebook.nearest"));
        assert!(report.contains("codebook.lookup"));
    }

    #[test]
    fn counters_accumulate_deltas() {
        let before = totals()
            .into_iter()
            .find(|total| total.metric == Metric::UnknownIndices)
            .map_or(0, |total| total.hits);
        add_count(Metric::UnknownIndices, 3);
        add_count(Metric::UnknownIndices, 4);
        let after = totals()
            .into_iter()
            .find(|total| total.metric == Metric::UnknownIndices)
            .map_or(0, |total| total.hits);
        assert!(after >= before + 7);
    }

    #[test]
    fn slots_follow_declaration_order() {
        for (idx, metric) in Metric::ALL.iter().enumerate() {
            assert_eq!(metric.slot(), idx);
        }
    }
}
