//! Sensitivity and discovery-potential estimation from injection trials.
//!
//! For one hypothesis, injection jobs report how many of their trials crossed
//! a TS threshold at each injected mean signal μ. The pass-fraction curve is
//! fitted with a monotonic family (weighted Levenberg–Marquardt, binomial
//! weights), inverted at the target fraction, and converted to flux.
//!
//! Fit failures are returned as [`FitError`] and recorded in the result's
//! [`SensitivityStatus`]; they never abort a batch over many hypotheses.

use std::fmt;
use std::path::Path;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::config::SensitivityConfig;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Injection samples and curves
// ---------------------------------------------------------------------------

/// One injection job's result: `[mu, passed, total]` on disk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, u64, u64)", into = "(f64, u64, u64)")]
pub struct InjectionSample {
    pub mu: f64,
    pub passed: u64,
    pub total: u64,
}

impl From<(f64, u64, u64)> for InjectionSample {
    fn from((mu, passed, total): (f64, u64, u64)) -> Self {
        Self { mu, passed, total }
    }
}

impl From<InjectionSample> for (f64, u64, u64) {
    fn from(s: InjectionSample) -> Self {
        (s.mu, s.passed, s.total)
    }
}

impl InjectionSample {
    pub fn new(mu: f64, passed: u64, total: u64) -> Self {
        Self { mu, passed, total }
    }

    pub fn fraction(&self) -> f64 {
        self.passed as f64 / self.total as f64
    }

    pub fn validate(&self) -> Result<()> {
        if !self.mu.is_finite() || self.mu < 0.0 {
            return Err(Error::validation(format!("injected mean {} is not valid", self.mu)));
        }
        if self.total == 0 {
            return Err(Error::validation("injection sample has zero trials"));
        }
        if self.passed > self.total {
            return Err(Error::validation(format!(
                "{} of {} trials passed",
                self.passed, self.total
            )));
        }
        Ok(())
    }

    /// Binomial standard deviation of the pass-fraction.
    ///
    /// Uses the shrunk estimate (k + ½)/(n + 1) so levels at exactly 0 or 1
    /// keep a finite weight.
    fn sigma(&self) -> f64 {
        let n = self.total as f64;
        let p = (self.passed as f64 + 0.5) / (n + 1.0);
        (p * (1.0 - p) / n).sqrt()
    }
}

/// Injection samples of one hypothesis, summed per injected mean.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensitivityCurve {
    samples: Vec<InjectionSample>,
}

impl SensitivityCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_samples(samples: impl IntoIterator<Item = InjectionSample>) -> Self {
        let mut curve = Self::new();
        for sample in samples {
            curve.add(sample);
        }
        curve
    }

    /// Add a sample, summing counts into an existing level with the same μ.
    pub fn add(&mut self, sample: InjectionSample) {
        match self
            .samples
            .binary_search_by(|s| s.mu.total_cmp(&sample.mu))
        {
            Ok(i) => {
                self.samples[i].passed += sample.passed;
                self.samples[i].total += sample.total;
            }
            Err(i) => self.samples.insert(i, sample),
        }
    }

    /// A new curve combining both curves' trials.
    pub fn merge(&self, other: &SensitivityCurve) -> SensitivityCurve {
        let mut merged = self.clone();
        for sample in &other.samples {
            merged.add(*sample);
        }
        merged
    }

    /// Levels in ascending μ.
    pub fn samples(&self) -> &[InjectionSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn fraction_range(&self) -> Option<(f64, f64)> {
        let mut fractions = self.samples.iter().map(InjectionSample::fraction);
        let first = fractions.next()?;
        Some(fractions.fold((first, first), |(lo, hi), f| (lo.min(f), hi.max(f))))
    }

    /// Whether the sampled pass-fractions span `target`.
    pub fn brackets(&self, target: f64) -> bool {
        self.fraction_range()
            .is_some_and(|(lo, hi)| lo <= target && target <= hi)
    }

    /// Extra injection levels to run when the grid does not span `target`.
    ///
    /// Extends upward with the grid's largest spacing when every level falls
    /// short of the target, or fills in below the smallest μ when every level
    /// already exceeds it. `None` when the grid already brackets the target,
    /// or when it starts at μ = 0 and there is no room below.
    pub fn suggest_extension(&self, target: f64, count: usize) -> Option<Vec<f64>> {
        let (lo, hi) = self.fraction_range()?;
        let first = self.samples.first()?.mu;
        let last = self.samples.last()?.mu;
        if hi < target {
            let step = self
                .samples
                .windows(2)
                .map(|w| w[1].mu - w[0].mu)
                .fold(0.0f64, f64::max);
            let step = if step > 0.0 { step } else { last.max(1.0) };
            Some((1..=count).map(|i| last + step * i as f64).collect())
        } else if lo > target {
            if first <= 0.0 {
                return None;
            }
            let step = first / (count + 1) as f64;
            Some((0..count).map(|i| step * i as f64).collect())
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Curve families
// ---------------------------------------------------------------------------

/// Monotonic pass-fraction model f(μ; θ).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveFamily {
    /// θ = [midpoint, width]: 1 / (1 + exp(-(μ - midpoint) / width)).
    Logistic,
    /// θ = [df, scale]: χ²_df CDF of μ / scale.
    ChiSquareCdf,
    /// θ = [floor, df, scale]: floor + (1 - floor)·χ²_df CDF of μ / scale.
    #[default]
    OffsetChiSquareCdf,
}

impl fmt::Display for CurveFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurveFamily::Logistic => write!(f, "logistic"),
            CurveFamily::ChiSquareCdf => write!(f, "chi-square CDF"),
            CurveFamily::OffsetChiSquareCdf => write!(f, "offset chi-square CDF"),
        }
    }
}

/// Degrees of freedom the χ² families start from. Steep curves sit at large
/// df; a single start near df = 2 stalls on them.
const START_DF: [f64; 7] = [1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0];

fn chi2_cdf(df: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    ChiSquared::new(df).map_or(f64::NAN, |d| d.cdf(x))
}

impl CurveFamily {
    pub fn param_count(self) -> usize {
        match self {
            CurveFamily::Logistic | CurveFamily::ChiSquareCdf => 2,
            CurveFamily::OffsetChiSquareCdf => 3,
        }
    }

    pub fn param_names(self) -> &'static [&'static str] {
        match self {
            CurveFamily::Logistic => &["midpoint", "width"],
            CurveFamily::ChiSquareCdf => &["df", "scale"],
            CurveFamily::OffsetChiSquareCdf => &["floor", "df", "scale"],
        }
    }

    /// Model pass-fraction at `mu`.
    pub fn eval(self, params: &[f64], mu: f64) -> f64 {
        match (self, params) {
            (CurveFamily::Logistic, [mid, width]) => 1.0 / (1.0 + (-(mu - mid) / width).exp()),
            (CurveFamily::ChiSquareCdf, [df, scale]) => chi2_cdf(*df, mu / scale),
            (CurveFamily::OffsetChiSquareCdf, [floor, df, scale]) => {
                floor + (1.0 - floor) * chi2_cdf(*df, mu / scale)
            }
            _ => f64::NAN,
        }
    }

    fn in_domain(self, params: &[f64]) -> bool {
        if params.iter().any(|p| !p.is_finite()) {
            return false;
        }
        match (self, params) {
            (CurveFamily::Logistic, [_, width]) => *width > 0.0,
            (CurveFamily::ChiSquareCdf, [df, scale]) => *df > 0.0 && *scale > 0.0,
            (CurveFamily::OffsetChiSquareCdf, [floor, df, scale]) => {
                (0.0..1.0).contains(floor) && *df > 0.0 && *scale > 0.0
            }
            _ => false,
        }
    }

    /// Maps θ to unconstrained fit coordinates: logit for the floor, log for
    /// df, scale and width.
    fn to_internal(self, params: &[f64]) -> Vec<f64> {
        match (self, params) {
            (CurveFamily::Logistic, [mid, width]) => vec![*mid, width.ln()],
            (CurveFamily::ChiSquareCdf, [df, scale]) => vec![df.ln(), scale.ln()],
            (CurveFamily::OffsetChiSquareCdf, [floor, df, scale]) => {
                vec![(floor / (1.0 - floor)).ln(), df.ln(), scale.ln()]
            }
            _ => params.to_vec(),
        }
    }

    fn from_internal(self, coords: &[f64]) -> Vec<f64> {
        match (self, coords) {
            (CurveFamily::Logistic, [mid, ln_width]) => vec![*mid, ln_width.exp()],
            (CurveFamily::ChiSquareCdf, [ln_df, ln_scale]) => vec![ln_df.exp(), ln_scale.exp()],
            (CurveFamily::OffsetChiSquareCdf, [logit_floor, ln_df, ln_scale]) => vec![
                1.0 / (1.0 + (-logit_floor).exp()),
                ln_df.exp(),
                ln_scale.exp(),
            ],
            _ => coords.to_vec(),
        }
    }

    /// Starting θ for the fit; the χ² families start once per df in
    /// [`START_DF`], scaled so the median lands on the level nearest 50%.
    fn starting_points(self, samples: &[InjectionSample]) -> Vec<Vec<f64>> {
        let max_mu = samples.iter().map(|s| s.mu).fold(0.0, f64::max);
        let min_mu = samples.iter().map(|s| s.mu).fold(f64::INFINITY, f64::min);
        let mid = samples
            .iter()
            .min_by(|a, b| {
                (a.fraction() - 0.5)
                    .abs()
                    .total_cmp(&(b.fraction() - 0.5).abs())
            })
            .map_or(max_mu / 2.0, |s| s.mu);
        let mid = if mid > 0.0 { mid } else { max_mu / 2.0 };
        let scale = |df: f64| {
            let median = ChiSquared::new(df).map_or(df, |d| d.inverse_cdf(0.5));
            mid / median
        };

        match self {
            CurveFamily::Logistic => {
                let width = ((max_mu - min_mu) / 8.0).max(1e-3 * max_mu.max(1.0));
                vec![vec![mid, width]]
            }
            CurveFamily::ChiSquareCdf => START_DF.iter().map(|&df| vec![df, scale(df)]).collect(),
            CurveFamily::OffsetChiSquareCdf => {
                let floor = samples
                    .first()
                    .map_or(0.0, |s| s.fraction())
                    .clamp(1e-3, 0.5);
                START_DF
                    .iter()
                    .map(|&df| vec![floor, df, scale(df)])
                    .collect()
            }
        }
    }

    /// Smallest μ >= 0 with f(μ; θ) = `target`, by bisection.
    ///
    /// The upper bracket starts at `hint` and doubles until it passes the target.
    /// `None` when f(0) is already at or above the target or no bracket is
    /// found.
    pub fn invert(self, params: &[f64], target: f64, hint: f64) -> Option<f64> {
        let mut lo = 0.0;
        if !(self.eval(params, lo) < target) {
            return None;
        }
        let mut hi = if hint > 0.0 { hint } else { 1.0 };
        let mut expand = 0;
        while self.eval(params, hi) < target {
            hi *= 2.0;
            expand += 1;
            if expand > 60 {
                return None;
            }
        }
        for _ in 0..200 {
            let mid = 0.5 * (lo + hi);
            if self.eval(params, mid) < target {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo <= 1e-12 * hi.max(1.0) {
                break;
            }
        }
        Some(0.5 * (lo + hi))
    }
}

// ---------------------------------------------------------------------------
// Fit
// ---------------------------------------------------------------------------

/// Why a curve could not be fitted or inverted.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitError {
    #[error("{levels} injection levels, the {family} curve needs at least {required}")]
    InsufficientLevels {
        levels: usize,
        required: usize,
        family: CurveFamily,
    },

    #[error("pass fractions are all {fraction}")]
    DegenerateFractions { fraction: f64 },

    #[error("target fraction {target} is outside the sampled range [{min}, {max}]")]
    TargetNotBracketed { target: f64, min: f64, max: f64 },

    #[error("target fraction {0} must lie in (0, 1)")]
    InvalidTarget(f64),

    #[error("fit did not converge: {0}")]
    NonConvergence(String),
}

/// A fitted pass-fraction curve.
#[derive(Debug, Clone)]
pub struct CurveFit {
    pub family: CurveFamily,
    pub params: Vec<f64>,
    /// Parameter covariance, inverse of the weighted normal matrix.
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub ndof: usize,
    pub iterations: usize,
}

impl CurveFit {
    pub fn eval(&self, mu: f64) -> f64 {
        self.family.eval(&self.params, mu)
    }

    pub fn param_errors(&self) -> Vec<f64> {
        (0..self.params.len())
            .map(|i| self.covariance[(i, i)].max(0.0).sqrt())
            .collect()
    }

    /// ∂f/∂θ at `mu`.
    fn param_gradient(&self, mu: f64) -> DVector<f64> {
        gradient(|p| self.family.eval(p, mu), &self.params)
    }

    /// μ at which the curve reaches `target`, with its delta-method uncertainty.
    pub fn invert(&self, target: f64, hint: f64) -> Option<(f64, f64)> {
        let mu = self.family.invert(&self.params, target, hint)?;
        let h = 1e-6 * mu.abs().max(1.0);
        let below = (mu - h).max(0.0);
        let slope = (self.eval(mu + h) - self.eval(below)) / (mu + h - below);
        if !(slope > 0.0) {
            return Some((mu, f64::NAN));
        }
        let g = -self.param_gradient(mu) / slope;
        let var = (g.transpose() * &self.covariance * &g)[(0, 0)];
        Some((mu, var.max(0.0).sqrt()))
    }

    pub fn summary(&self) -> FitSummary {
        FitSummary {
            family: self.family,
            params: self.params.clone(),
            param_errors: self.param_errors(),
            chi2: self.chi2,
            ndof: self.ndof,
            iterations: self.iterations,
        }
    }
}

/// Serializable digest of a [`CurveFit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub family: CurveFamily,
    pub params: Vec<f64>,
    pub param_errors: Vec<f64>,
    pub chi2: f64,
    pub ndof: usize,
    pub iterations: usize,
}

/// Central-difference gradient of `f` at `params`.
fn gradient(f: impl Fn(&[f64]) -> f64, params: &[f64]) -> DVector<f64> {
    let mut shifted = params.to_vec();
    DVector::from_iterator(
        params.len(),
        (0..params.len()).map(|j| {
            let h = 1e-6 * params[j].abs().max(1e-2);
            shifted[j] = params[j] + h;
            let up = f(&shifted);
            shifted[j] = params[j] - h;
            let down = f(&shifted);
            shifted[j] = params[j];
            (up - down) / (2.0 * h)
        }),
    )
}

fn weighted_chi2(
    model: impl Fn(&[f64], f64) -> f64,
    params: &[f64],
    samples: &[InjectionSample],
    weights: &[f64],
) -> f64 {
    samples
        .iter()
        .zip(weights)
        .map(|(s, w)| {
            let r = s.fraction() - model(params, s.mu);
            w * r * r
        })
        .sum()
}

/// Weighted normal matrix JᵀWJ and gradient JᵀWr.
fn normal_equations(
    model: impl Fn(&[f64], f64) -> f64,
    params: &[f64],
    samples: &[InjectionSample],
    weights: &[f64],
) -> (DMatrix<f64>, DVector<f64>) {
    let p = params.len();
    let mut a = DMatrix::zeros(p, p);
    let mut g = DVector::zeros(p);
    for (s, w) in samples.iter().zip(weights) {
        let j = gradient(|q| model(q, s.mu), params);
        let r = s.fraction() - model(params, s.mu);
        a += &j * j.transpose() * *w;
        g += &j * (*w * r);
    }
    (a, g)
}

/// Chi2 decrease predicted by the Gauss-Newton step; infinite when the normal
/// matrix is not positive definite.
fn predicted_decrease(a: &DMatrix<f64>, g: &DVector<f64>) -> f64 {
    let mut ridged = a.clone();
    for i in 0..ridged.nrows() {
        ridged[(i, i)] += 1e-12 * a[(i, i)].abs().max(1e-12);
    }
    ridged
        .cholesky()
        .map_or(f64::INFINITY, |c| g.dot(&c.solve(g)))
}

/// Fits and inverts pass-fraction curves.
#[derive(Debug, Clone, Copy)]
pub struct SensitivityFitter {
    pub family: CurveFamily,
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Fits with a larger chi2/ndof are reported as not converged.
    pub max_reduced_chi2: f64,
}

impl Default for SensitivityFitter {
    fn default() -> Self {
        Self::from_config(&SensitivityConfig::default())
    }
}

impl SensitivityFitter {
    pub fn new(family: CurveFamily) -> Self {
        Self {
            family,
            ..Self::default()
        }
    }

    pub fn from_config(config: &SensitivityConfig) -> Self {
        Self {
            family: config.family,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
            max_reduced_chi2: config.max_reduced_chi2,
        }
    }

    /// Weighted least-squares fit of the pass-fraction curve.
    ///
    /// Runs Levenberg–Marquardt from every starting point of the family and
    /// keeps the lowest chi2.
    pub fn fit(&self, curve: &SensitivityCurve) -> std::result::Result<CurveFit, FitError> {
        let samples = curve.samples();
        let required = self.family.param_count();
        if samples.len() < required {
            return Err(FitError::InsufficientLevels {
                levels: samples.len(),
                required,
                family: self.family,
            });
        }
        if samples.iter().all(|s| s.passed == 0) {
            return Err(FitError::DegenerateFractions { fraction: 0.0 });
        }
        if samples.iter().all(|s| s.passed == s.total) {
            return Err(FitError::DegenerateFractions { fraction: 1.0 });
        }

        let weights: Vec<f64> = samples.iter().map(|s| s.sigma().powi(-2)).collect();
        let mut best: Option<(Vec<f64>, f64, usize)> = None;
        let mut last_error = None;
        for start in self.family.starting_points(samples) {
            match self.descend(&start, samples, &weights) {
                Ok((params, chi2, iterations)) => {
                    debug!("{} fit from {start:?}: chi2 {chi2:.4}", self.family);
                    if best.as_ref().is_none_or(|(_, best_chi2, _)| chi2 < *best_chi2) {
                        best = Some((params, chi2, iterations));
                    }
                }
                Err(e) => {
                    debug!("{} fit from {start:?}: {e}", self.family);
                    last_error = Some(e);
                }
            }
        }
        let Some((params, chi2, iterations)) = best else {
            return Err(last_error.unwrap_or_else(|| {
                FitError::NonConvergence(format!(
                    "no valid starting point for the {} curve",
                    self.family
                ))
            }));
        };

        let ndof = samples.len() - required;
        if ndof > 0 && chi2 / ndof as f64 > self.max_reduced_chi2 {
            return Err(FitError::NonConvergence(format!(
                "{} curve misses the pass fractions: chi2 {chi2:.1} on {ndof} dof",
                self.family
            )));
        }

        let model = |p: &[f64], mu: f64| self.family.eval(p, mu);
        let (a, _) = normal_equations(model, &params, samples, &weights);
        let covariance = a.try_inverse().ok_or_else(|| {
            FitError::NonConvergence("singular normal matrix at the fitted parameters".into())
        })?;

        debug!(
            "{} fit: params {:?}, chi2 {chi2:.4} after {iterations} iterations",
            self.family, params
        );
        Ok(CurveFit {
            family: self.family,
            params,
            covariance,
            chi2,
            ndof,
            iterations,
        })
    }

    /// Levenberg–Marquardt from `start`, stepping in unconstrained
    /// coordinates. Returns θ, chi2 and the iteration count.
    fn descend(
        &self,
        start: &[f64],
        samples: &[InjectionSample],
        weights: &[f64],
    ) -> std::result::Result<(Vec<f64>, f64, usize), FitError> {
        let family = self.family;
        let model = |u: &[f64], mu: f64| family.eval(&family.from_internal(u), mu);
        let mut coords = family.to_internal(start);
        if !family.in_domain(&family.from_internal(&coords)) {
            return Err(FitError::NonConvergence(format!(
                "starting point {start:?} is outside the {family} domain"
            )));
        }
        let mut chi2 = weighted_chi2(model, &coords, samples, weights);
        let mut lambda = 1e-3;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < self.max_iterations && !converged {
            iterations += 1;
            let (a, g) = normal_equations(model, &coords, samples, weights);

            loop {
                let mut damped = a.clone();
                for i in 0..damped.nrows() {
                    damped[(i, i)] += lambda * a[(i, i)].max(1e-12);
                }
                let trial: Option<Vec<f64>> = damped
                    .cholesky()
                    .map(|c| c.solve(&g))
                    .map(|d| coords.iter().zip(d.iter()).map(|(u, d)| u + d).collect());

                if let Some(trial) = trial.filter(|t| family.in_domain(&family.from_internal(t))) {
                    let trial_chi2 = weighted_chi2(model, &trial, samples, weights);
                    if trial_chi2.is_finite() && trial_chi2 <= chi2 {
                        let change = (chi2 - trial_chi2) / chi2.max(f64::MIN_POSITIVE);
                        let moved = coords
                            .iter()
                            .zip(&trial)
                            .map(|(u, t)| (t - u).abs() / u.abs().max(1e-12))
                            .fold(0.0, f64::max);
                        debug!(
                            "LM iteration {iterations}: chi2 {trial_chi2:.6e}, lambda {lambda:.1e}"
                        );
                        coords = trial;
                        chi2 = trial_chi2;
                        lambda = (lambda / 10.0).max(1e-12);
                        converged = change <= self.tolerance || moved <= 1e-12 || chi2 < 1e-24;
                        break;
                    }
                }

                lambda *= 10.0;
                if lambda > 1e12 {
                    // Rejecting every step is only a minimum if the
                    // Gauss-Newton step predicts no further decrease.
                    let predicted = predicted_decrease(&a, &g);
                    if predicted <= 1e-9 * chi2.max(1.0) {
                        converged = true;
                        break;
                    }
                    return Err(FitError::NonConvergence(format!(
                        "no step reduces chi2 {chi2:.3e}, predicted decrease {predicted:.3e}"
                    )));
                }
            }
        }

        if !converged {
            return Err(FitError::NonConvergence(format!(
                "{} iterations exhausted (chi2 {chi2:.3e})",
                self.max_iterations
            )));
        }
        Ok((family.from_internal(&coords), chi2, iterations))
    }

    /// Fit `curve` and solve for the request's target fraction.
    pub fn estimate(
        &self,
        request: &SensitivityRequest,
        curve: &SensitivityCurve,
    ) -> SensitivityResult {
        let mut result = SensitivityResult::pending(request);

        if !request.is_defined() {
            info!(
                "{} ({}): undefined hypothesis parameters, skipping fit",
                request.hypothesis, request.criterion
            );
            result.status = SensitivityStatus::Undefined;
            return result;
        }

        match self.solve(request.target_fraction, curve) {
            Ok((fit, mu, mu_err)) => {
                result.mu = mu;
                result.mu_err = mu_err;
                result.set_flux(request.flux_per_event);
                result.fit = Some(fit.summary());
                result.status = SensitivityStatus::Fitted;
                info!(
                    "{} {}: mu = {mu:.2} ± {mu_err:.2}, flux = {:.3e} ± {:.3e}",
                    request.hypothesis, request.criterion, result.flux, result.flux_err
                );
            }
            Err(e) => {
                warn!("{} {}: {e}", request.hypothesis, request.criterion);
                result.status = SensitivityStatus::Failed(e);
            }
        }
        result
    }

    fn solve(
        &self,
        target: f64,
        curve: &SensitivityCurve,
    ) -> std::result::Result<(CurveFit, f64, f64), FitError> {
        if !(target > 0.0 && target < 1.0) {
            return Err(FitError::InvalidTarget(target));
        }
        let (min, max) = curve.fraction_range().ok_or(FitError::InsufficientLevels {
            levels: 0,
            required: self.family.param_count(),
            family: self.family,
        })?;
        if !curve.brackets(target) {
            return Err(FitError::TargetNotBracketed { target, min, max });
        }
        let fit = self.fit(curve)?;
        let hint = curve.samples().last().map_or(1.0, |s| s.mu);
        let (mu, mu_err) = fit
            .invert(target, hint)
            .ok_or(FitError::TargetNotBracketed { target, min, max })?;
        Ok((fit, mu, mu_err))
    }

    /// Sensitivity and discovery potential of one hypothesis.
    ///
    /// The two criteria count passes against different TS thresholds, so each
    /// has its own curve.
    pub fn estimate_pair(
        &self,
        request: &SensitivityRequest,
        discovery_fraction: f64,
        sensitivity_curve: &SensitivityCurve,
        discovery_curve: &SensitivityCurve,
    ) -> SensitivityEstimate {
        let sensitivity_request = SensitivityRequest {
            criterion: Criterion::Sensitivity,
            ..request.clone()
        };
        let discovery_request = SensitivityRequest {
            criterion: Criterion::DiscoveryPotential,
            target_fraction: discovery_fraction,
            ..request.clone()
        };
        SensitivityEstimate {
            sensitivity: self.estimate(&sensitivity_request, sensitivity_curve),
            discovery: self.estimate(&discovery_request, discovery_curve),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Which pass-fraction criterion a result answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Sensitivity,
    DiscoveryPotential,
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Sensitivity => write!(f, "sensitivity"),
            Criterion::DiscoveryPotential => write!(f, "discovery potential"),
        }
    }
}

/// Parameters of one sensitivity estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct SensitivityRequest {
    pub hypothesis: String,
    pub criterion: Criterion,
    /// Source declination in radians.
    pub declination: f64,
    pub spectral_index: f64,
    pub target_fraction: f64,
    /// Flux corresponding to one injected signal event at this spectral shape.
    pub flux_per_event: f64,
}

impl SensitivityRequest {
    /// Whether the spectral index and flux conversion allow a flux estimate.
    pub fn is_defined(&self) -> bool {
        self.spectral_index.is_finite()
            && self.flux_per_event.is_finite()
            && self.flux_per_event > 0.0
    }
}

/// Outcome class of a sensitivity estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityStatus {
    Fitted,
    /// Undefined hypothesis parameters; numeric fields are NaN.
    Undefined,
    Failed(FitError),
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            s.serialize_f64(*value)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }
}

/// Fitted μ and flux for one (hypothesis, criterion, declination, index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityResult {
    pub hypothesis: String,
    pub criterion: Criterion,
    #[serde(with = "nan_as_null")]
    pub declination: f64,
    #[serde(with = "nan_as_null")]
    pub spectral_index: f64,
    pub target_fraction: f64,
    pub status: SensitivityStatus,
    #[serde(with = "nan_as_null")]
    pub mu: f64,
    #[serde(with = "nan_as_null")]
    pub mu_err: f64,
    #[serde(with = "nan_as_null")]
    pub flux: f64,
    #[serde(with = "nan_as_null")]
    pub flux_err: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fit: Option<FitSummary>,
}

impl SensitivityResult {
    fn pending(request: &SensitivityRequest) -> Self {
        Self {
            hypothesis: request.hypothesis.clone(),
            criterion: request.criterion,
            declination: request.declination,
            spectral_index: request.spectral_index,
            target_fraction: request.target_fraction,
            status: SensitivityStatus::Undefined,
            mu: f64::NAN,
            mu_err: f64::NAN,
            flux: f64::NAN,
            flux_err: f64::NAN,
            fit: None,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.status == SensitivityStatus::Fitted
    }

    fn set_flux(&mut self, flux_per_event: f64) {
        self.flux = self.mu * flux_per_event;
        self.flux_err = if self.mu > 0.0 {
            self.flux * self.mu_err / self.mu
        } else {
            f64::NAN
        };
    }

    /// Same hypothesis, criterion, declination, index and target fraction.
    fn same_key(&self, other: &SensitivityResult) -> bool {
        self.hypothesis == other.hypothesis
            && self.criterion == other.criterion
            && same_value(self.declination, other.declination)
            && same_value(self.spectral_index, other.spectral_index)
            && same_value(self.target_fraction, other.target_fraction)
    }
}

fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Both criteria for one hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityEstimate {
    pub sensitivity: SensitivityResult,
    pub discovery: SensitivityResult,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Persisted sensitivity results.
///
/// Failed fits are never stored, so rerunning with an extended μ grid retries
/// them. Fluxes are rescaled to the request's `flux_per_event` on lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensitivityCache {
    results: Vec<SensitivityResult>,
}

impl SensitivityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a cache file; a missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn results(&self) -> &[SensitivityResult] {
        &self.results
    }

    /// Stored result for `request`, with flux converted by its `flux_per_event`.
    pub fn get(&self, request: &SensitivityRequest) -> Option<SensitivityResult> {
        let key = SensitivityResult::pending(request);
        let hit = self.results.iter().find(|r| r.same_key(&key))?;
        if hit.is_fitted() && !request.is_defined() {
            return None;
        }
        let mut hit = hit.clone();
        if hit.is_fitted() {
            hit.set_flux(request.flux_per_event);
        }
        Some(hit)
    }

    /// Store a result, replacing any earlier one for the same key.
    ///
    /// Returns `false` (and stores nothing) for failed results and for
    /// undefined results with a finite spectral index, whose cause is the
    /// flux conversion rather than the hypothesis.
    pub fn insert(&mut self, result: SensitivityResult) -> bool {
        let keep = match result.status {
            SensitivityStatus::Fitted => true,
            SensitivityStatus::Undefined => !result.spectral_index.is_finite(),
            SensitivityStatus::Failed(_) => false,
        };
        if !keep {
            return false;
        }
        self.results.retain(|r| !r.same_key(&result));
        self.results.push(result);
        true
    }

    /// Cached result for `request`, or a fresh estimate that is then cached.
    pub fn get_or_estimate(
        &mut self,
        fitter: &SensitivityFitter,
        request: &SensitivityRequest,
        curve: &SensitivityCurve,
    ) -> SensitivityResult {
        if let Some(hit) = self.get(request) {
            debug!("{} {}: using cached result", request.hypothesis, request.criterion);
            return hit;
        }
        let result = fitter.estimate(request, curve);
        self.insert(result.clone());
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
