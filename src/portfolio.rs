use crate::returns::ReturnStatistics;
use anyhow::{Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp1};
use serde::{Deserialize, Serialize};
use tracing::info;

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// How random weight vectors are drawn before normalization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WeightScheme {
    /// Independent uniform(0,1) draws divided by their sum. Not uniform over
    /// the simplex: allocations cluster around equal weights.
    #[default]
    NormalizedUniform,
    /// Normalized Exp(1) draws, i.e. a flat Dirichlet, uniform over the simplex.
    Dirichlet,
}

/// One hypothetical portfolio and its risk/return figures over the sample window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortfolioSample {
    pub weights: Vec<f64>,
    pub expected_return: f64,
    pub volatility: f64,
    /// `expected_return / volatility`; infinite or NaN when volatility is 0.
    pub sharpe: f64,
}

impl PortfolioSample {
    /// Scores already-normalized `weights` against window-scaled statistics.
    pub fn evaluate(weights: Vec<f64>, scaled_mean: &[f64], scaled_cov: &[Vec<f64>]) -> Self {
        let expected_return = portfolio_return(&weights, scaled_mean);
        let variance = portfolio_variance(&weights, scaled_cov);
        // Rounding can push a PSD quadratic form slightly below zero.
        let volatility = if variance < 0.0 { 0.0 } else { variance.sqrt() };
        Self {
            weights,
            expected_return,
            volatility,
            sharpe: expected_return / volatility,
        }
    }

    /// Weights rounded to 3 decimals, e.g. `"0.25, 0.5, 0.25"`.
    pub fn weights_label(&self) -> String {
        self.weights
            .iter()
            .map(|&w| format_weight(w))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// All samples from one sampler run.
#[derive(Clone, Debug, Serialize)]
pub struct SampleSet {
    pub symbols: Vec<String>,
    pub scheme: WeightScheme,
    /// Seed that reproduces this run.
    pub seed: u64,
    pub periods: usize,
    pub samples: Vec<PortfolioSample>,
}

impl SampleSet {
    /// Sample with the highest finite Sharpe ratio.
    pub fn max_sharpe(&self) -> Option<&PortfolioSample> {
        self.samples
            .iter()
            .filter(|s| s.sharpe.is_finite())
            .max_by(|a, b| a.sharpe.total_cmp(&b.sharpe))
    }

    /// Sample with the lowest finite volatility.
    pub fn min_volatility(&self) -> Option<&PortfolioSample> {
        self.samples
            .iter()
            .filter(|s| s.volatility.is_finite())
            .min_by(|a, b| a.volatility.total_cmp(&b.volatility))
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio Helpers
// ──────────────────────────────────────────────────────────────────────────────

fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    weights.iter().zip(means.iter()).map(|(w, r)| w * r).sum()
}

fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let n = weights.len();
    let mut var = 0.0;
    for i in 0..n {
        for j in 0..n {
            var += weights[i] * weights[j] * cov[i][j];
        }
    }
    var
}

fn format_weight(w: f64) -> String {
    let rounded = (w * 1000.0).round() / 1000.0;
    let text = format!("{}", rounded);
    if text.contains('.') || !rounded.is_finite() {
        text
    } else {
        format!("{}.0", text)
    }
}

/// Draws a random weight vector that sums to 1.0.
fn generate_random_weights<R: Rng>(n: usize, scheme: WeightScheme, rng: &mut R) -> Vec<f64> {
    let raw: Vec<f64> = match scheme {
        WeightScheme::NormalizedUniform => (0..n).map(|_| rng.gen_range(0.0..1.0)).collect(),
        WeightScheme::Dirichlet => (0..n).map(|_| Exp1.sample(&mut *rng)).collect(),
    };
    normalize(raw)
}

fn normalize(raw: Vec<f64>) -> Vec<f64> {
    let sum: f64 = raw.iter().sum();
    if sum <= 0.0 {
        let n = raw.len() as f64;
        return vec![1.0 / n; raw.len()];
    }
    raw.into_iter().map(|v| v / sum).collect()
}

// ──────────────────────────────────────────────────────────────────────────────
// Sampler
// ──────────────────────────────────────────────────────────────────────────────

/// Draws `samples` random portfolios from `rng` and scores each one.
///
/// Mean and covariance are scaled by the number of periods before scoring, so
/// returns and volatilities refer to the whole sample window.
pub fn sample_with_rng<R: Rng>(
    stats: &ReturnStatistics,
    samples: usize,
    scheme: WeightScheme,
    rng: &mut R,
) -> Result<Vec<PortfolioSample>> {
    let n = stats.mean.len();
    if n < 2 {
        bail!("portfolio sampling needs at least 2 securities, got {}", n);
    }
    if samples < 1 {
        bail!("sample count must be at least 1");
    }
    if stats.covariance.len() != n || stats.covariance.iter().any(|row| row.len() != n) {
        bail!("covariance matrix must be {}x{}", n, n);
    }

    let scaled_mean = stats.scaled_mean();
    let scaled_cov = stats.scaled_covariance();

    let mut out = Vec::with_capacity(samples);
    for _ in 0..samples {
        let weights = generate_random_weights(n, scheme, rng);
        out.push(PortfolioSample::evaluate(weights, &scaled_mean, &scaled_cov));
    }
    Ok(out)
}

/// Runs the sampler with a seeded generator. Without a seed one is drawn and
/// recorded in the result.
pub fn sample_portfolios(
    stats: &ReturnStatistics,
    samples: usize,
    scheme: WeightScheme,
    seed: Option<u64>,
) -> Result<SampleSet> {
    let seed = seed.unwrap_or_else(|| rand::thread_rng().gen_range(0..u64::MAX));
    let mut rng = StdRng::seed_from_u64(seed);

    info!(
        "Sampling {} portfolios over {} assets ({} periods, scheme={:?}, seed={})",
        samples,
        stats.mean.len(),
        stats.periods,
        scheme,
        seed
    );
    let samples = sample_with_rng(stats, samples, scheme, &mut rng)?;

    Ok(SampleSet {
        symbols: stats.symbols.clone(),
        scheme,
        seed,
        periods: stats.periods,
        samples,
    })
}

/// Pretty-prints a sample set summary to stdout.
pub fn print_sample_set(set: &SampleSet) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║              Markowitz Portfolio Sampling                 ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Assets  : {:<47} ║", set.symbols.join(", "));
    println!("║  Samples : {:<47} ║", set.samples.len());
    println!("║  Periods : {:<47} ║", set.periods);
    println!("║  Seed    : {:<47} ║", set.seed);
    println!("╠════════════════════════════════════════════════════════════╣");

    let rows = [("Max Sharpe", set.max_sharpe()), ("Min Volatility", set.min_volatility())];
    for (label, sample) in rows {
        match sample {
            Some(s) => {
                println!("║  {:<56}  ║", label);
                println!(
                    "║    Return {:>+8.4}  Volatility {:>7.4}  Sharpe {:>7.3}    ║",
                    s.expected_return, s.volatility, s.sharpe
                );
                for (sym, w) in set.symbols.iter().zip(s.weights.iter()) {
                    println!("║    {:<10} {:>7.2}%                                   ║", sym, w * 100.0);
                }
            }
            None => println!("║  {:<20} n/a (no finite samples)                ║", label),
        }
    }

    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("Random scatter sampling, not an efficient-frontier solver.");
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn two_asset_stats() -> ReturnStatistics {
        ReturnStatistics::new(
            vec!["AAAA".into(), "BBBB".into()],
            vec![0.001, 0.0012],
            vec![vec![0.0004, 0.0001], vec![0.0001, 0.0005]],
            250,
        )
        .unwrap()
    }

    fn stats_n(n: usize) -> ReturnStatistics {
        let symbols = (0..n).map(|i| format!("S{}", i)).collect();
        let mean = (0..n).map(|i| 0.0005 * (i as f64 + 1.0)).collect();
        let covariance = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { 0.0004 + 0.0001 * i as f64 } else { 0.00005 })
                    .collect()
            })
            .collect();
        ReturnStatistics::new(symbols, mean, covariance, 120).unwrap()
    }

    #[test]
    fn test_end_to_end_two_assets() {
        let stats = two_asset_stats();
        let set = sample_portfolios(&stats, 3, WeightScheme::NormalizedUniform, Some(42)).unwrap();

        assert_eq!(set.samples.len(), 3);
        assert_eq!(set.seed, 42);
        for s in &set.samples {
            let (w0, w1) = (s.weights[0], s.weights[1]);
            assert!((w0 + w1 - 1.0).abs() < 1e-12);

            let expected_return = 250.0 * (w0 * 0.001 + w1 * 0.0012);
            let variance = 250.0 * (w0 * w0 * 0.0004 + 2.0 * w0 * w1 * 0.0001 + w1 * w1 * 0.0005);
            assert!((s.expected_return - expected_return).abs() < 1e-12);
            assert!((s.volatility - variance.sqrt()).abs() < 1e-12);
            assert!((s.sharpe - expected_return / variance.sqrt()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_weights_sum_to_one_and_non_negative() {
        let stats = stats_n(5);
        for scheme in [WeightScheme::NormalizedUniform, WeightScheme::Dirichlet] {
            let set = sample_portfolios(&stats, 500, scheme, Some(7)).unwrap();
            for s in &set.samples {
                let sum: f64 = s.weights.iter().sum();
                assert!((sum - 1.0).abs() < 1e-10, "Weights should sum to 1.0, got {}", sum);
                assert!(s.weights.iter().all(|&w| w >= 0.0), "Weights should be non-negative");
                assert!(s.volatility >= 0.0, "Volatility should be non-negative");
            }
        }
    }

    #[test]
    fn test_same_seed_same_samples() {
        let stats = stats_n(4);
        let a = sample_portfolios(&stats, 50, WeightScheme::NormalizedUniform, Some(1234)).unwrap();
        let b = sample_portfolios(&stats, 50, WeightScheme::NormalizedUniform, Some(1234)).unwrap();
        let c = sample_portfolios(&stats, 50, WeightScheme::NormalizedUniform, Some(4321)).unwrap();

        assert_eq!(a.samples, b.samples);
        assert_ne!(a.samples, c.samples);
    }

    #[test]
    fn test_unseeded_run_records_reproducible_seed() {
        let stats = stats_n(3);
        let first = sample_portfolios(&stats, 10, WeightScheme::Dirichlet, None).unwrap();
        let replay = sample_portfolios(&stats, 10, WeightScheme::Dirichlet, Some(first.seed)).unwrap();
        assert_eq!(first.samples, replay.samples);
    }

    #[test]
    fn test_boundaries() {
        let mut rng = StdRng::seed_from_u64(0);
        let two = two_asset_stats();
        assert_eq!(
            sample_with_rng(&two, 1, WeightScheme::NormalizedUniform, &mut rng).unwrap().len(),
            1
        );
        assert!(sample_with_rng(&two, 0, WeightScheme::NormalizedUniform, &mut rng).is_err());

        let one = ReturnStatistics::new(vec!["A".into()], vec![0.001], vec![vec![0.0004]], 10).unwrap();
        assert!(sample_with_rng(&one, 10, WeightScheme::NormalizedUniform, &mut rng).is_err());

        let none = ReturnStatistics::new(vec![], vec![], vec![], 0).unwrap();
        assert!(sample_with_rng(&none, 10, WeightScheme::NormalizedUniform, &mut rng).is_err());
    }

    #[test]
    fn test_bad_covariance_shape_rejected() {
        let mut stats = two_asset_stats();
        stats.covariance.pop();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_with_rng(&stats, 3, WeightScheme::NormalizedUniform, &mut rng).is_err());
    }

    #[test]
    fn test_scores_invariant_under_raw_weight_rescaling() {
        let stats = stats_n(3);
        let mean = stats.scaled_mean();
        let cov = stats.scaled_covariance();
        let raw = vec![0.2, 0.7, 0.4];

        let a = PortfolioSample::evaluate(normalize(raw.clone()), &mean, &cov);
        let b = PortfolioSample::evaluate(normalize(raw.iter().map(|w| w * 3.5).collect()), &mean, &cov);

        assert!((a.expected_return - b.expected_return).abs() < 1e-12);
        assert!((a.volatility - b.volatility).abs() < 1e-12);
        assert!((a.sharpe - b.sharpe).abs() < 1e-9);
    }

    #[test]
    fn test_zero_volatility_gives_infinite_sharpe() {
        let zero_cov = vec![vec![0.0, 0.0], vec![0.0, 0.0]];
        let s = PortfolioSample::evaluate(vec![0.5, 0.5], &[0.1, 0.2], &zero_cov);
        assert_eq!(s.volatility, 0.0);
        assert!(s.sharpe.is_infinite() && s.sharpe > 0.0);

        let flat = PortfolioSample::evaluate(vec![0.5, 0.5], &[0.0, 0.0], &zero_cov);
        assert!(flat.sharpe.is_nan());
    }

    #[test]
    fn test_nan_statistics_propagate() {
        let stats = ReturnStatistics::new(
            vec!["A".into(), "B".into()],
            vec![0.001, f64::NAN],
            vec![vec![0.0004, f64::NAN], vec![f64::NAN, f64::NAN]],
            20,
        )
        .unwrap();
        let set = sample_portfolios(&stats, 5, WeightScheme::NormalizedUniform, Some(3)).unwrap();
        assert_eq!(set.samples.len(), 5);
        assert!(set.samples.iter().all(|s| s.expected_return.is_nan() && s.volatility.is_nan()));
        assert!(set.max_sharpe().is_none());
    }

    #[test]
    fn test_summaries_pick_extremes() {
        let stats = stats_n(3);
        let set = sample_portfolios(&stats, 200, WeightScheme::NormalizedUniform, Some(11)).unwrap();
        let best = set.max_sharpe().unwrap();
        let safest = set.min_volatility().unwrap();
        assert!(set.samples.iter().all(|s| s.sharpe <= best.sharpe));
        assert!(set.samples.iter().all(|s| s.volatility >= safest.volatility));
    }

    #[test]
    fn test_weights_label() {
        let s = PortfolioSample {
            weights: vec![0.5, 0.33333, 0.16667, 0.0],
            expected_return: 0.0,
            volatility: 0.0,
            sharpe: f64::NAN,
        };
        assert_eq!(s.weights_label(), "0.5, 0.333, 0.167, 0.0");
    }
}
