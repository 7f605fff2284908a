use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use tracing::{debug, warn};

/// Why one source in a fallback chain did not produce a value.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

/// Every source in a chain failed. Failures are kept in the order tried.
#[derive(Clone, Debug, Serialize)]
pub struct AllSourcesFailed {
    pub what: String,
    pub failures: Vec<SourceFailure>,
}

impl fmt::Display for AllSourcesFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return write!(f, "{}: no sources configured", self.what);
        }
        write!(f, "{}: all sources failed (", self.what)?;
        for (idx, failure) in self.failures.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", failure.source, failure.reason)?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for AllSourcesFailed {}

/// Tries `sources` in order and returns the first success along with the
/// source that produced it.
pub async fn first_success<S, T, F, Fut>(
    what: &str,
    sources: &[S],
    mut attempt: F,
) -> Result<(S, T), AllSourcesFailed>
where
    S: Copy + fmt::Display,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = Vec::with_capacity(sources.len());

    for &source in sources {
        match attempt(source).await {
            Ok(value) => {
                debug!("{} served by {}", what, source);
                return Ok((source, value));
            }
            Err(err) => {
                warn!("{} via {} failed: {:#}", what, source, err);
                failures.push(SourceFailure {
                    source: source.to_string(),
                    reason: format!("{:#}", err),
                });
            }
        }
    }

    Err(AllSourcesFailed {
        what: what.to_string(),
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Probe {
        Down,
        Up,
        AlsoUp,
    }

    impl fmt::Display for Probe {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    async fn call(probe: Probe) -> Result<u32> {
        match probe {
            Probe::Down => Err(anyhow::anyhow!("connection refused")),
            Probe::Up => Ok(1),
            Probe::AlsoUp => Ok(2),
        }
    }

    #[tokio::test]
    async fn test_first_success_skips_failures_in_order() {
        let mut tried = Vec::new();
        let (source, value) = first_success("quote", &[Probe::Down, Probe::Up, Probe::AlsoUp], |p| {
            tried.push(p);
            call(p)
        })
        .await
        .unwrap();

        assert_eq!(source, Probe::Up);
        assert_eq!(value, 1);
        assert_eq!(tried, vec![Probe::Down, Probe::Up]);
    }

    #[tokio::test]
    async fn test_all_failures_are_reported() {
        let err = first_success("rates", &[Probe::Down, Probe::Down], call)
            .await
            .unwrap_err();

        assert_eq!(err.failures.len(), 2);
        assert!(err.failures.iter().all(|f| f.reason == "connection refused"));
        let text = err.to_string();
        assert!(text.starts_with("rates: all sources failed"));
        assert!(text.contains("Down: connection refused; Down: connection refused"));
    }

    #[tokio::test]
    async fn test_empty_chain_fails() {
        let err = first_success::<Probe, u32, _, _>("history", &[], call)
            .await
            .unwrap_err();
        assert!(err.failures.is_empty());
        assert_eq!(err.to_string(), "history: no sources configured");
    }
}
