//! Run summaries built from job reports.

use std::{collections::BTreeMap, fmt, time::Duration};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    buckets::{Bucket, BucketsExt, LATENCY_BUCKETS},
    dispatch::{JobOutcome, JobReport, OutcomeKind},
};

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
}

impl LatencySummary {
    /// `None` for an empty sample. Percentiles are bucket estimates clamped
    /// to the observed range; min, max and mean are exact.
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        let min = *samples.iter().min()?;
        let max = *samples.iter().max()?;
        let total: Duration = samples.iter().sum();
        let mean = total / samples.len() as u32;

        let secs = samples.iter().map(Duration::as_secs_f64).collect::<Vec<_>>();
        let buckets = Bucket::cumulative(&secs, &LATENCY_BUCKETS);
        let quantile = |q: f64| {
            Duration::from_secs_f64(buckets.estimate_quantile(q).max(0.0)).clamp(min, max)
        };

        Some(Self {
            count: samples.len(),
            min,
            max,
            mean,
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NodeBreakdown {
    pub index: usize,
    pub url: String,
    pub jobs: u64,
    pub accepted: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub mean_submit_latency: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunReport {
    pub total: u64,
    /// Jobs a node accepted (a receipt handle was returned).
    pub accepted: u64,
    pub counts: BTreeMap<String, u64>,
    /// Failed jobs grouped by cause.
    pub failure_causes: BTreeMap<String, u64>,
    /// Share of jobs that ended submitted or confirmed.
    pub success_rate: f64,
    pub wall_clock: Duration,
    /// Accepted submissions per second of wall clock.
    pub throughput: f64,
    pub submit_latency: Option<LatencySummary>,
    pub confirmation_latency: Option<LatencySummary>,
    pub nodes: Vec<NodeBreakdown>,
}

impl RunReport {
    pub fn from_reports(reports: &[JobReport], wall_clock: Duration) -> Self {
        let mut counts = BTreeMap::new();
        let mut failure_causes = BTreeMap::new();
        let mut nodes: BTreeMap<usize, (NodeBreakdown, Vec<Duration>)> = BTreeMap::new();
        let mut submit_samples = vec![];
        let mut confirm_samples = vec![];
        let mut accepted = 0;
        let mut succeeded = 0;

        for report in reports {
            let kind = report.outcome.kind();
            *counts.entry(kind.to_string()).or_insert(0) += 1;
            if report.outcome.is_success() {
                succeeded += 1;
            }
            if let JobOutcome::Failed(cause) = &report.outcome {
                *failure_causes.entry(cause.label().to_owned()).or_insert(0) += 1;
            }
            if report.handle.is_some() {
                accepted += 1;
            }
            if let Some(latency) = report.submit_latency {
                submit_samples.push(latency);
            }
            if let Some(record) = report.confirmation.as_ref().filter(|r| r.is_confirmed()) {
                confirm_samples.push(record.latency);
            }

            let Some(index) = report.node_index else {
                continue;
            };
            let (node, latencies) = nodes.entry(index).or_insert_with(|| {
                (
                    NodeBreakdown {
                        index,
                        url: report.node_url.clone().unwrap_or_default(),
                        ..Default::default()
                    },
                    vec![],
                )
            });
            node.jobs += 1;
            if report.handle.is_some() {
                node.accepted += 1;
            }
            match kind {
                OutcomeKind::Confirmed => node.confirmed += 1,
                OutcomeKind::Failed => node.failed += 1,
                OutcomeKind::TimedOut => node.timed_out += 1,
                _ => {}
            }
            if let Some(latency) = report.submit_latency {
                latencies.push(latency);
            }
        }

        let nodes = nodes
            .into_values()
            .map(|(mut node, latencies)| {
                node.mean_submit_latency = LatencySummary::from_samples(&latencies).map(|s| s.mean);
                node
            })
            .collect();

        let total = reports.len() as u64;
        let secs = wall_clock.as_secs_f64();
        Self {
            total,
            accepted,
            counts,
            failure_causes,
            success_rate: if total == 0 {
                0.0
            } else {
                succeeded as f64 / total as f64
            },
            wall_clock,
            throughput: if secs > 0.0 { accepted as f64 / secs } else { 0.0 },
            submit_latency: LatencySummary::from_samples(&submit_samples),
            confirmation_latency: LatencySummary::from_samples(&confirm_samples),
            nodes,
        }
    }

    pub fn count(&self, kind: OutcomeKind) -> u64 {
        self.counts.get(&kind.to_string()).copied().unwrap_or_default()
    }
}

fn ms(d: Duration) -> String {
    format!("{:.1}ms", d.as_secs_f64() * 1000.0)
}

fn write_latency(
    f: &mut fmt::Formatter<'_>,
    label: &str,
    summary: &Option<LatencySummary>,
) -> fmt::Result {
    match summary {
        Some(s) => writeln!(
            f,
            "{label:<22} n={:<7} min={:<10} avg={:<10} p50={:<10} p90={:<10} p99={:<10} max={}",
            s.count,
            ms(s.min),
            ms(s.mean),
            ms(s.p50),
            ms(s.p90),
            ms(s.p99),
            ms(s.max)
        ),
        None => writeln!(f, "{label:<22} no samples"),
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "jobs                   {}", self.total)?;
        writeln!(f, "accepted               {}", self.accepted)?;
        for (kind, count) in &self.counts {
            writeln!(f, "  {kind:<20} {count}")?;
        }
        for (cause, count) in &self.failure_causes {
            writeln!(f, "  failed: {cause:<12} {count}")?;
        }
        writeln!(f, "success rate           {:.2}%", self.success_rate * 100.0)?;
        writeln!(f, "wall clock             {:.2}s", self.wall_clock.as_secs_f64())?;
        writeln!(f, "throughput             {:.1}/s", self.throughput)?;
        write_latency(f, "submit latency", &self.submit_latency)?;
        write_latency(f, "confirmation latency", &self.confirmation_latency)?;

        if self.nodes.is_empty() {
            return Ok(());
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:<4} {:<40} {:>8} {:>9} {:>10} {:>7} {:>9} {:>12}",
            "#", "node", "jobs", "accepted", "confirmed", "failed", "timedout", "avg submit"
        )?;
        for node in &self.nodes {
            writeln!(
                f,
                "{:<4} {:<40} {:>8} {:>9} {:>10} {:>7} {:>9} {:>12}",
                node.index,
                node.url,
                node.jobs,
                node.accepted,
                node.confirmed,
                node.failed,
                node.timed_out,
                node.mean_submit_latency.map(ms).unwrap_or_else(|| "-".to_owned()),
            )?;
        }
        Ok(())
    }
}

/// The single reader of the results channel.
#[derive(Debug, Clone)]
pub struct StatsCollector {
    progress_every: usize,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self {
            progress_every: 1000,
        }
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs a progress line every `n` reports; 0 disables it.
    pub fn with_progress_every(mut self, n: usize) -> Self {
        self.progress_every = n;
        self
    }

    /// Drains `results` until every sender is dropped.
    pub async fn collect(&self, mut results: mpsc::Receiver<JobReport>) -> Vec<JobReport> {
        let mut reports = vec![];
        let mut succeeded = 0usize;
        while let Some(report) = results.recv().await {
            if report.outcome.is_success() {
                succeeded += 1;
            }
            reports.push(report);
            if self.progress_every > 0 && reports.len() % self.progress_every == 0 {
                info!(received = reports.len(), succeeded, "collecting results");
            }
        }
        reports
    }
}
