//! Job manifests and job-output writers.
//!
//! A manifest lists every job output expected for a run, generated when the
//! batch is planned. Aggregation walks the manifest instead of globbing the
//! output directory, so an absent file is positively known to be missing.
//!
//! # Storage Format
//!
//! - `manifest.json`: `{ version, id, created_at, entries: [{ target, job, path }] }`
//! - `dec_{bin}_job_{job}.json`: background TS values (JSON array)
//! - `{hypothesis}_mu_{mu}_job_{job}.json`: injection sample `[mu, passed, total]`

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sensitivity::InjectionSample;

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// What a job computes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTarget {
    /// Scrambled background trials for one declination bin.
    Background { bin: usize },
    /// Signal-injection trials for one hypothesis at one injected mean.
    Injection { hypothesis: String, mu: f64 },
}

/// One expected job output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub target: JobTarget,
    pub job: usize,
    pub path: PathBuf,
}

/// Filename of a background job output.
pub fn background_file_name(bin: usize, job: usize) -> String {
    format!("dec_{bin}_job_{job}.json")
}

/// Filename of an injection job output.
pub fn injection_file_name(hypothesis: &str, mu: f64, job: usize) -> String {
    format!("{hypothesis}_mu_{mu}_job_{job}.json")
}

fn check_hypothesis_name(hypothesis: &str) -> Result<()> {
    let valid = !hypothesis.is_empty()
        && hypothesis
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'));
    if !valid {
        return Err(Error::validation(format!(
            "hypothesis name {hypothesis:?} must be non-empty and filename-safe"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// The list of job outputs a run expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub version: u32,
    pub id: String,
    /// Unix seconds.
    pub created_at: u64,
    pub entries: Vec<JobEntry>,
}

impl JobManifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            id: Uuid::new_v4().to_string(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            entries: Vec::new(),
        }
    }

    /// Plan `jobs_per_bin` background jobs for each of `bin_count` bins.
    pub fn plan_background(bin_count: usize, jobs_per_bin: usize, dir: &Path) -> Self {
        let mut manifest = Self::new();
        for bin in 0..bin_count {
            for job in 0..jobs_per_bin {
                manifest.entries.push(JobEntry {
                    target: JobTarget::Background { bin },
                    job,
                    path: dir.join(background_file_name(bin, job)),
                });
            }
        }
        info!(
            "planned {} background jobs over {bin_count} bins",
            manifest.entries.len()
        );
        manifest
    }

    /// Plan `jobs_per_level` injection jobs for each injected mean in `mu_grid`.
    pub fn plan_injection(
        hypothesis: &str,
        mu_grid: &[f64],
        jobs_per_level: usize,
        dir: &Path,
    ) -> Result<Self> {
        check_hypothesis_name(hypothesis)?;
        if let Some(bad) = mu_grid.iter().find(|mu| !mu.is_finite() || **mu < 0.0) {
            return Err(Error::validation(format!("injected mean {bad} is not valid")));
        }

        let mut manifest = Self::new();
        for &mu in mu_grid {
            for job in 0..jobs_per_level {
                manifest.entries.push(JobEntry {
                    target: JobTarget::Injection {
                        hypothesis: hypothesis.to_string(),
                        mu,
                    },
                    job,
                    path: dir.join(injection_file_name(hypothesis, mu, job)),
                });
            }
        }
        info!(
            "planned {} injection jobs for {hypothesis} over {} levels",
            manifest.entries.len(),
            mu_grid.len()
        );
        Ok(manifest)
    }

    /// Add another manifest's entries, skipping paths already listed.
    ///
    /// Returns the number of entries added. Existing entries are never
    /// replaced, so outputs of an earlier grid stay part of the run.
    pub fn extend(&mut self, other: JobManifest) -> usize {
        let known: HashSet<PathBuf> = self.entries.iter().map(|e| e.path.clone()).collect();
        let before = self.entries.len();
        for entry in other.entries {
            if !known.contains(&entry.path) {
                self.entries.push(entry);
            }
        }
        self.entries.len() - before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries for one background bin.
    pub fn background_entries(&self, bin: usize) -> impl Iterator<Item = &JobEntry> {
        self.entries
            .iter()
            .filter(move |e| matches!(e.target, JobTarget::Background { bin: b } if b == bin))
    }

    /// Entries for one injection hypothesis.
    pub fn injection_entries<'a>(
        &'a self,
        hypothesis: &'a str,
    ) -> impl Iterator<Item = &'a JobEntry> {
        self.entries.iter().filter(move |e| {
            matches!(&e.target, JobTarget::Injection { hypothesis: h, .. } if h == hypothesis)
        })
    }

    /// Distinct background bins, ascending.
    pub fn background_bins(&self) -> Vec<usize> {
        let mut bins: Vec<usize> = self
            .entries
            .iter()
            .filter_map(|e| match e.target {
                JobTarget::Background { bin } => Some(bin),
                JobTarget::Injection { .. } => None,
            })
            .collect();
        bins.sort_unstable();
        bins.dedup();
        bins
    }

    /// Distinct injection hypotheses, sorted.
    pub fn hypotheses(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter_map(|e| match &e.target {
                JobTarget::Injection { hypothesis, .. } => Some(hypothesis.clone()),
                JobTarget::Background { .. } => None,
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let manifest: JobManifest = serde_json::from_str(&raw)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::IncompatibleFile {
                path: path.to_path_buf(),
                message: format!(
                    "manifest version {} is not supported (expected {MANIFEST_VERSION})",
                    manifest.version
                ),
            });
        }
        Ok(manifest)
    }
}

impl Default for JobManifest {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Job-output writers
// ---------------------------------------------------------------------------

/// Write `contents` next to `path`, then rename into place.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Write one background job's TS values.
pub fn write_background_trials(path: &Path, ts: &[f64]) -> Result<()> {
    if let Some(bad) = ts.iter().find(|v| !v.is_finite()) {
        return Err(Error::validation(format!("background TS value {bad} is not finite")));
    }
    write_atomic(path, &serde_json::to_string(ts)?)
}

/// Write one injection job's `[mu, passed, total]` sample.
pub fn write_injection_sample(path: &Path, sample: &InjectionSample) -> Result<()> {
    sample.validate()?;
    write_atomic(path, &serde_json::to_string(sample)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_background_layout() {
        let dir = Path::new("/data/bg");
        let m = JobManifest::plan_background(3, 4, dir);
        assert_eq!(m.len(), 12);
        assert_eq!(m.background_entries(1).count(), 4);
        assert_eq!(m.background_bins(), vec![0, 1, 2]);
        assert_eq!(m.entries[5].path, dir.join("dec_1_job_1.json"));
        assert_eq!(m.version, MANIFEST_VERSION);
    }

    #[test]
    fn test_plan_injection_file_names() {
        let dir = Path::new("inj");
        let m = JobManifest::plan_injection("crab_E2", &[0.0, 12.5], 2, dir).unwrap();
        let names: Vec<String> = m
            .injection_entries("crab_E2")
            .map(|e| e.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "crab_E2_mu_0_job_0.json",
                "crab_E2_mu_0_job_1.json",
                "crab_E2_mu_12.5_job_0.json",
                "crab_E2_mu_12.5_job_1.json",
            ]
        );
        assert_eq!(m.hypotheses(), vec!["crab_E2".to_string()]);
    }

    #[test]
    fn test_plan_injection_rejects_bad_input() {
        let dir = Path::new("inj");
        assert!(JobManifest::plan_injection("", &[1.0], 1, dir).is_err());
        assert!(JobManifest::plan_injection("a/b", &[1.0], 1, dir).is_err());
        assert!(JobManifest::plan_injection("src", &[f64::NAN], 1, dir).is_err());
        assert!(JobManifest::plan_injection("src", &[-1.0], 1, dir).is_err());
    }

    #[test]
    fn test_extend_keeps_prior_entries() {
        let dir = Path::new("inj");
        let mut m = JobManifest::plan_injection("src", &[0.0, 50.0, 100.0], 1, dir).unwrap();
        let id = m.id.clone();
        let expanded = JobManifest::plan_injection("src", &[100.0, 150.0, 200.0], 1, dir).unwrap();

        let added = m.extend(expanded);
        assert_eq!(added, 2);
        assert_eq!(m.len(), 5);
        assert_eq!(m.id, id);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut m = JobManifest::plan_background(2, 2, dir.path());
        m.extend(JobManifest::plan_injection("src", &[10.0], 1, dir.path()).unwrap());
        m.save(&path).unwrap();

        let loaded = JobManifest::load(&path).unwrap();
        assert_eq!(loaded.id, m.id);
        assert_eq!(loaded.entries, m.entries);
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut m = JobManifest::new();
        m.version = 99;
        m.save(&path).unwrap();
        assert!(matches!(JobManifest::load(&path), Err(Error::IncompatibleFile { .. })));
    }

    #[test]
    fn test_target_json_shape() {
        let bg = serde_json::to_value(JobTarget::Background { bin: 3 }).unwrap();
        assert_eq!(bg, serde_json::json!({"background": {"bin": 3}}));
        let inj = serde_json::to_value(JobTarget::Injection {
            hypothesis: "src".into(),
            mu: 50.0,
        })
        .unwrap();
        assert_eq!(inj, serde_json::json!({"injection": {"hypothesis": "src", "mu": 50.0}}));
    }

    #[test]
    fn test_writers_leave_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(background_file_name(0, 0));
        write_background_trials(&path, &[0.0, 1.5, 2.25]).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let values: Vec<f64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(values, vec![0.0, 1.5, 2.25]);
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_writer_rejects_non_finite_ts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(background_file_name(0, 0));
        assert!(write_background_trials(&path, &[1.0, f64::NAN]).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_injection_sample_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(injection_file_name("src", 50.0, 0));
        write_injection_sample(&path, &InjectionSample::new(50.0, 400, 1000)).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "[50.0,400,1000]");
    }
}
