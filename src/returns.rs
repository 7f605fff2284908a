use crate::data::PriceSeries;
use anyhow::{Result, bail};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

/// Daily log-returns for several securities aligned on date.
///
/// Rows are dates (ascending), columns follow `symbols`. A cell is NaN when
/// the security has no close on that date or on the previous joined date.
#[derive(Clone, Debug)]
pub struct LogReturnMatrix {
    pub symbols: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub values: Vec<Vec<f64>>,
}

impl LogReturnMatrix {
    /// Outer-joins the closes of `series` on date and takes `ln(p[t] / p[t-1])`.
    ///
    /// The first joined date has no predecessor and yields no row.
    pub fn from_series(series: &[PriceSeries]) -> Result<Self> {
        let mut symbols: Vec<String> = Vec::with_capacity(series.len());
        for s in series {
            if symbols.contains(&s.symbol) {
                bail!("duplicate symbol {} in return matrix", s.symbol);
            }
            symbols.push(s.symbol.clone());
        }

        let all_dates: BTreeSet<NaiveDate> = series
            .iter()
            .flat_map(|s| s.history.iter().map(|c| c.date))
            .collect();
        let closes: Vec<BTreeMap<NaiveDate, f64>> =
            series.iter().map(|s| s.closes().collect()).collect();

        let dates: Vec<NaiveDate> = all_dates.into_iter().collect();
        let prices: Vec<Vec<f64>> = dates
            .iter()
            .map(|date| {
                closes
                    .iter()
                    .map(|col| col.get(date).copied().unwrap_or(f64::NAN))
                    .collect()
            })
            .collect();

        let values = prices
            .windows(2)
            .map(|w| {
                w[1].iter()
                    .zip(w[0].iter())
                    .map(|(now, prev)| (now / prev).ln())
                    .collect()
            })
            .collect();

        Ok(Self {
            symbols,
            dates: dates.into_iter().skip(1).collect(),
            values,
        })
    }

    /// Number of joined dates, including the first one that yields no row.
    /// Zero when there are no returns at all.
    pub fn periods(&self) -> usize {
        if self.values.is_empty() { 0 } else { self.values.len() + 1 }
    }

    pub fn column(&self, j: usize) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().map(move |row| row[j])
    }
}

/// Per-period mean and covariance of log-returns, plus the number of periods
/// used to scale them to the sample window.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnStatistics {
    pub symbols: Vec<String>,
    pub mean: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    pub periods: usize,
}

impl ReturnStatistics {
    pub fn new(symbols: Vec<String>, mean: Vec<f64>, covariance: Vec<Vec<f64>>, periods: usize) -> Result<Self> {
        let n = mean.len();
        if symbols.len() != n {
            bail!("{} symbols but {} mean returns", symbols.len(), n);
        }
        if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            bail!("covariance matrix must be {}x{}", n, n);
        }
        Ok(Self {
            symbols,
            mean,
            covariance,
            periods,
        })
    }

    /// Means skip NaN cells; each covariance entry uses only the rows where
    /// both securities are observed (ddof = 1).
    pub fn from_matrix(matrix: &LogReturnMatrix) -> Self {
        let n = matrix.symbols.len();

        let mean = (0..n)
            .map(|j| {
                let observed: Vec<f64> = matrix.column(j).filter(|v| !v.is_nan()).collect();
                if observed.is_empty() {
                    f64::NAN
                } else {
                    observed.iter().sum::<f64>() / observed.len() as f64
                }
            })
            .collect();

        let mut covariance = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let value = pairwise_covariance(matrix, i, j);
                covariance[i][j] = value;
                covariance[j][i] = value;
            }
        }

        Self {
            symbols: matrix.symbols.clone(),
            mean,
            covariance,
            periods: matrix.periods(),
        }
    }

    pub fn scaled_mean(&self) -> Vec<f64> {
        let periods = self.periods as f64;
        self.mean.iter().map(|m| m * periods).collect()
    }

    pub fn scaled_covariance(&self) -> Vec<Vec<f64>> {
        let periods = self.periods as f64;
        self.covariance
            .iter()
            .map(|row| row.iter().map(|c| c * periods).collect())
            .collect()
    }
}

fn pairwise_covariance(matrix: &LogReturnMatrix, i: usize, j: usize) -> f64 {
    let pairs: Vec<(f64, f64)> = matrix
        .values
        .iter()
        .map(|row| (row[i], row[j]))
        .filter(|(a, b)| !a.is_nan() && !b.is_nan())
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }

    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    pairs
        .iter()
        .map(|(a, b)| (a - mean_a) * (b - mean_b))
        .sum::<f64>()
        / (n - 1.0)
}
