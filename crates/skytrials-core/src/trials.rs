//! Background trial pools and job-output aggregation.
//!
//! Architecture:
//! 1. The manifest lists the job outputs expected for a bin or hypothesis
//! 2. Each listed file is read; absent files count as missing, unparsable ones
//!    as corrupt, and neither stops the aggregation
//! 3. Background TS arrays are concatenated into one sorted pool per bin
//! 4. Injection samples are summed per injected mean into a curve
//! 5. Every aggregation returns a report so callers can tell "no jobs planned",
//!    "nothing produced yet" and "everything corrupt" apart

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::manifest::{JobEntry, JobManifest, JobTarget};
use crate::pvalue::{PValue, TailRule, is_unseen};
use crate::sensitivity::{InjectionSample, SensitivityCurve};

// ---------------------------------------------------------------------------
// Background pool
// ---------------------------------------------------------------------------

/// Background TS values for one declination bin or source position.
///
/// Values are kept sorted ascending, so the pool is identical whatever order
/// its job files were merged in, and each p-value lookup is a binary search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackgroundPool {
    values: Vec<f64>,
}

impl BackgroundPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(mut values: Vec<f64>) -> Self {
        values.sort_by(f64::total_cmp);
        Self { values }
    }

    /// A new pool holding this pool's values plus `other`'s.
    pub fn concat(&self, other: &BackgroundPool) -> BackgroundPool {
        let mut merged = Vec::with_capacity(self.values.len() + other.values.len());
        let (mut i, mut j) = (0, 0);
        while i < self.values.len() && j < other.values.len() {
            if self.values[i].total_cmp(&other.values[j]).is_le() {
                merged.push(self.values[i]);
                i += 1;
            } else {
                merged.push(other.values[j]);
                j += 1;
            }
        }
        merged.extend_from_slice(&self.values[i..]);
        merged.extend_from_slice(&other.values[j..]);
        BackgroundPool { values: merged }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sorted values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn min(&self) -> Option<f64> {
        self.values.first().copied()
    }

    pub fn max(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// Number of background trials in the tail of `ts` under `rule`.
    pub fn tail_count(&self, ts: f64, rule: TailRule) -> usize {
        let below = match rule {
            TailRule::AtLeast => self.values.partition_point(|v| *v < ts),
            TailRule::Exceeding => self.values.partition_point(|v| *v <= ts),
        };
        self.values.len() - below
    }

    /// Empirical p-value: fraction of the pool with TS >= `ts`.
    pub fn p_value(&self, ts: f64) -> PValue {
        self.p_value_with(ts, TailRule::AtLeast)
    }

    /// Empirical p-value with an explicit tail rule.
    pub fn p_value_with(&self, ts: f64, rule: TailRule) -> PValue {
        if !ts.is_finite() || is_unseen(ts) {
            return PValue::Unseen;
        }
        if self.values.is_empty() {
            return PValue::EmptyPool;
        }
        PValue::Value(self.tail_count(ts, rule) as f64 / self.values.len() as f64)
    }

    /// TS value that a fraction `p` of background trials reach or exceed.
    ///
    /// Injection jobs count a trial as passing when its TS is above this
    /// threshold. `None` when the pool is too small to resolve `p`.
    pub fn threshold(&self, p: f64) -> Option<f64> {
        let n = self.values.len();
        if !(p > 0.0 && p <= 1.0) || (n as f64) * p < 1.0 {
            return None;
        }
        let tail = ((n as f64) * p).floor() as usize;
        self.values.get(n - tail).copied()
    }

    /// P-values for many TS values against this one pool.
    pub fn p_values(&self, ts: &[f64], rule: TailRule) -> Vec<PValue> {
        ts.iter().map(|&t| self.p_value_with(t, rule)).collect()
    }
}

// ---------------------------------------------------------------------------
// Aggregation report
// ---------------------------------------------------------------------------

/// Outcome class of one aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStatus {
    /// The manifest lists no jobs for this target.
    NoJobs,
    /// Jobs are listed but none of their files exist.
    NoFiles,
    /// Files exist but none could be read.
    AllCorrupt,
    /// Some files loaded, others missing or corrupt.
    Partial,
    Complete,
}

impl AggregationStatus {
    /// Whether at least one job output contributed.
    pub fn has_data(self) -> bool {
        matches!(self, AggregationStatus::Partial | AggregationStatus::Complete)
    }
}

impl fmt::Display for AggregationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregationStatus::NoJobs => "no jobs",
            AggregationStatus::NoFiles => "no files",
            AggregationStatus::AllCorrupt => "all corrupt",
            AggregationStatus::Partial => "partial",
            AggregationStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// File accounting for one bin or hypothesis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub expected: usize,
    pub loaded: usize,
    pub missing: usize,
    pub corrupt: usize,
    /// Trials (background) or samples (injection) merged.
    pub trials: usize,
    pub corrupt_paths: Vec<PathBuf>,
}

impl AggregationReport {
    pub fn status(&self) -> AggregationStatus {
        if self.expected == 0 {
            AggregationStatus::NoJobs
        } else if self.loaded == 0 && self.corrupt == 0 {
            AggregationStatus::NoFiles
        } else if self.loaded == 0 {
            AggregationStatus::AllCorrupt
        } else if self.missing + self.corrupt > 0 {
            AggregationStatus::Partial
        } else {
            AggregationStatus::Complete
        }
    }

    pub fn skipped(&self) -> usize {
        self.missing + self.corrupt
    }
}

/// Totals over many aggregations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationSummary {
    pub targets: usize,
    pub complete: usize,
    pub partial: usize,
    pub no_jobs: usize,
    pub no_files: usize,
    pub all_corrupt: usize,
    pub total_trials: usize,
    pub missing_files: usize,
    pub corrupt_files: usize,
}

impl AggregationSummary {
    pub fn record(&mut self, report: &AggregationReport) {
        self.targets += 1;
        match report.status() {
            AggregationStatus::Complete => self.complete += 1,
            AggregationStatus::Partial => self.partial += 1,
            AggregationStatus::NoJobs => self.no_jobs += 1,
            AggregationStatus::NoFiles => self.no_files += 1,
            AggregationStatus::AllCorrupt => self.all_corrupt += 1,
        }
        self.total_trials += report.trials;
        self.missing_files += report.missing;
        self.corrupt_files += report.corrupt;
    }

    /// Targets left without any usable data.
    pub fn failed(&self) -> usize {
        self.no_jobs + self.no_files + self.all_corrupt
    }
}

impl fmt::Display for AggregationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} complete, {} partial, {} without data; \
             {} trials, {} missing files, {} corrupt files",
            self.complete,
            self.targets,
            self.partial,
            self.failed(),
            self.total_trials,
            self.missing_files,
            self.corrupt_files
        )
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

enum Loaded<T> {
    Ok(T),
    Missing,
    Corrupt(String),
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Loaded<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Loaded::Missing,
        Err(e) => return Loaded::Corrupt(e.to_string()),
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Loaded::Ok(value),
        Err(e) => Loaded::Corrupt(e.to_string()),
    }
}

/// Merges job outputs listed in a [`JobManifest`].
pub struct TrialAggregator<'a> {
    manifest: &'a JobManifest,
}

impl<'a> TrialAggregator<'a> {
    pub fn new(manifest: &'a JobManifest) -> Self {
        Self { manifest }
    }

    fn note_corrupt(report: &mut AggregationReport, entry: &JobEntry, reason: &str) {
        warn!("skipping corrupt job output {}: {reason}", entry.path.display());
        report.corrupt += 1;
        report.corrupt_paths.push(entry.path.clone());
    }

    /// Concatenate every background job output for `bin`.
    pub fn background_pool(&self, bin: usize) -> (BackgroundPool, AggregationReport) {
        let mut report = AggregationReport::default();
        let mut values = Vec::new();

        for entry in self.manifest.background_entries(bin) {
            report.expected += 1;
            match read_json::<Vec<f64>>(&entry.path) {
                Loaded::Ok(ts) => {
                    debug!("{}: {} trials", entry.path.display(), ts.len());
                    report.loaded += 1;
                    values.extend(ts);
                }
                Loaded::Missing => report.missing += 1,
                Loaded::Corrupt(reason) => Self::note_corrupt(&mut report, entry, &reason),
            }
        }

        report.trials = values.len();
        match report.status() {
            AggregationStatus::Complete => {}
            status => warn!(
                "declination bin {bin}: {status} ({} of {} job outputs loaded)",
                report.loaded, report.expected
            ),
        }
        (BackgroundPool::from_values(values), report)
    }

    /// Pools for bins `0..bin_count`, with a summary across bins.
    pub fn background_pools(
        &self,
        bin_count: usize,
    ) -> (Vec<BackgroundPool>, Vec<AggregationReport>, AggregationSummary) {
        let mut pools = Vec::with_capacity(bin_count);
        let mut reports = Vec::with_capacity(bin_count);
        let mut summary = AggregationSummary::default();
        for bin in 0..bin_count {
            let (pool, report) = self.background_pool(bin);
            summary.record(&report);
            pools.push(pool);
            reports.push(report);
        }
        info!("background aggregation: {summary}");
        (pools, reports, summary)
    }

    /// Sum injection samples for `hypothesis` per injected mean.
    pub fn sensitivity_curve(&self, hypothesis: &str) -> (SensitivityCurve, AggregationReport) {
        let mut report = AggregationReport::default();
        let mut curve = SensitivityCurve::new();

        for entry in self.manifest.injection_entries(hypothesis) {
            report.expected += 1;
            let JobTarget::Injection { mu, .. } = entry.target else {
                continue;
            };
            match read_json::<InjectionSample>(&entry.path) {
                Loaded::Ok(sample) => {
                    if let Err(e) = sample.validate() {
                        Self::note_corrupt(&mut report, entry, &e.to_string());
                    } else if sample.mu != mu {
                        let reason = format!("holds mu {} but was planned for {mu}", sample.mu);
                        Self::note_corrupt(&mut report, entry, &reason);
                    } else {
                        report.loaded += 1;
                        report.trials += 1;
                        curve.add(sample);
                    }
                }
                Loaded::Missing => report.missing += 1,
                Loaded::Corrupt(reason) => Self::note_corrupt(&mut report, entry, &reason),
            }
        }

        match report.status() {
            AggregationStatus::Complete => {}
            status => warn!(
                "hypothesis {hypothesis}: {status} ({} of {} job outputs loaded)",
                report.loaded, report.expected
            ),
        }
        (curve, report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{write_background_trials, write_injection_sample};

    #[test]
    fn test_p_value_scenario() {
        let pool = BackgroundPool::from_values(vec![7.1, 0.5, 5.0, 3.4, 1.2]);
        assert_eq!(pool.p_value_with(3.4, TailRule::Exceeding), PValue::Value(0.4));
        assert_eq!(pool.p_value(3.4), PValue::Value(0.6));
        assert_eq!(pool.p_value(7.2), PValue::Value(0.0));
        assert_eq!(pool.p_value(0.5), PValue::Value(1.0));
        assert_eq!(pool.p_value(-3.0), PValue::Value(1.0));
        assert_eq!(pool.p_value_with(7.1, TailRule::Exceeding), PValue::Value(0.0));
    }

    #[test]
    fn test_threshold() {
        let pool = BackgroundPool::from_values((1..=100).map(f64::from).collect());
        assert_eq!(pool.threshold(0.5), Some(51.0));
        assert_eq!(pool.p_value(51.0), PValue::Value(0.5));
        assert_eq!(pool.threshold(0.01), Some(100.0));
        assert_eq!(pool.threshold(2.87e-7), None);
        assert_eq!(BackgroundPool::new().threshold(0.5), None);
    }

    #[test]
    fn test_empty_pool_and_unseen_inputs() {
        let empty = BackgroundPool::new();
        assert_eq!(empty.p_value(1.0), PValue::EmptyPool);
        let pool = BackgroundPool::from_values(vec![1.0]);
        assert_eq!(pool.p_value(f64::NAN), PValue::Unseen);
        assert_eq!(pool.p_value(crate::pvalue::UNSEEN), PValue::Unseen);
    }

    #[test]
    fn test_concat_matches_from_values() {
        let a = BackgroundPool::from_values(vec![3.0, 1.0, 2.0]);
        let b = BackgroundPool::from_values(vec![2.5, 0.0]);
        let merged = a.concat(&b);
        assert_eq!(merged.values(), &[0.0, 1.0, 2.0, 2.5, 3.0]);
        assert_eq!(merged, b.concat(&a));
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_report_status_classes() {
        let mut r = AggregationReport::default();
        assert_eq!(r.status(), AggregationStatus::NoJobs);
        r.expected = 2;
        r.missing = 2;
        assert_eq!(r.status(), AggregationStatus::NoFiles);
        r.missing = 1;
        r.corrupt = 1;
        assert_eq!(r.status(), AggregationStatus::AllCorrupt);
        r.corrupt = 0;
        r.loaded = 1;
        assert_eq!(r.status(), AggregationStatus::Partial);
        r.missing = 0;
        r.loaded = 2;
        assert_eq!(r.status(), AggregationStatus::Complete);
    }

    #[test]
    fn test_background_pool_skips_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = JobManifest::plan_background(1, 4, dir.path());
        write_background_trials(&manifest.entries[0].path, &[1.0, 2.0]).unwrap();
        write_background_trials(&manifest.entries[1].path, &[3.0]).unwrap();
        std::fs::write(&manifest.entries[2].path, "[1.0, 2.").unwrap();

        let (pool, report) = TrialAggregator::new(&manifest).background_pool(0);
        assert_eq!(pool.len(), 3);
        assert_eq!(report.expected, 4);
        assert_eq!(report.loaded, 2);
        assert_eq!(report.corrupt, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(report.corrupt_paths, vec![manifest.entries[2].path.clone()]);
        assert_eq!(report.status(), AggregationStatus::Partial);
    }

    #[test]
    fn test_missing_and_corrupt_bins_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = JobManifest::plan_background(2, 2, dir.path());
        for entry in manifest.background_entries(1) {
            std::fs::write(&entry.path, "garbage").unwrap();
        }
        let aggregator = TrialAggregator::new(&manifest);
        assert_eq!(aggregator.background_pool(0).1.status(), AggregationStatus::NoFiles);
        assert_eq!(aggregator.background_pool(1).1.status(), AggregationStatus::AllCorrupt);
        assert_eq!(aggregator.background_pool(7).1.status(), AggregationStatus::NoJobs);
    }

    #[test]
    fn test_background_pools_summary() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = JobManifest::plan_background(2, 1, dir.path());
        write_background_trials(&manifest.entries[0].path, &[0.1, 0.2, 0.3]).unwrap();

        let (pools, reports, summary) = TrialAggregator::new(&manifest).background_pools(3);
        assert_eq!(pools.len(), 3);
        assert_eq!(reports[0].status(), AggregationStatus::Complete);
        assert_eq!(summary.complete, 1);
        assert_eq!(summary.no_files, 1);
        assert_eq!(summary.no_jobs, 1);
        assert_eq!(summary.total_trials, 3);
        assert_eq!(summary.failed(), 2);
    }

    #[test]
    fn test_sensitivity_curve_sums_per_mu() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = JobManifest::plan_injection("src", &[0.0, 50.0], 2, dir.path()).unwrap();
        let samples = [(0.0, 5, 500), (0.0, 5, 500), (50.0, 150, 500), (50.0, 250, 500)];
        for (entry, (mu, passed, total)) in manifest.entries.iter().zip(samples) {
            write_injection_sample(&entry.path, &InjectionSample::new(mu, passed, total)).unwrap();
        }

        let (curve, report) = TrialAggregator::new(&manifest).sensitivity_curve("src");
        assert_eq!(report.status(), AggregationStatus::Complete);
        assert_eq!(
            curve.samples(),
            &[InjectionSample::new(0.0, 10, 1000), InjectionSample::new(50.0, 400, 1000)]
        );
    }

    #[test]
    fn test_sample_with_wrong_mu_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = JobManifest::plan_injection("src", &[10.0], 1, dir.path()).unwrap();
        write_injection_sample(&manifest.entries[0].path, &InjectionSample::new(20.0, 1, 10))
            .unwrap();
        let (curve, report) = TrialAggregator::new(&manifest).sensitivity_curve("src");
        assert!(curve.is_empty());
        assert_eq!(report.status(), AggregationStatus::AllCorrupt);
    }
}
