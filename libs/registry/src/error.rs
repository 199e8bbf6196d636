use std::time::Duration;

use crate::store::LeaseId;

/// Errors produced by the registration and discovery layer.
///
/// Configuration errors are raised at construction time; store errors are
/// returned from the operation that hit them and never deferred to a
/// background task.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("{op} timed out after {}ms", timeout.as_millis())]
    Timeout {
        op: &'static str,
        timeout: Duration,
    },

    #[error("lease {0} not found or already expired")]
    LeaseNotFound(LeaseId),

    #[error("revision {0} has been compacted")]
    Compacted(i64),

    #[error("watch stream fell behind by {0} events")]
    WatchLagged(u64),

    #[error("no live endpoints for service '{0}'")]
    NoEndpoints(String),

    #[error("failed to encode or decode endpoint: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("coordination store error: {0}")]
    Store(String),
}

impl RegistryError {
    /// Whether the caller may retry the operation later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_)
                | Self::Timeout { .. }
                | Self::NoEndpoints(_)
                | Self::Compacted(_)
                | Self::WatchLagged(_)
        )
    }
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// Run a store call under an explicit deadline.
pub(crate) async fn with_timeout<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_elapsed) => Err(RegistryError::Timeout { op, timeout }),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RegistryError::NoEndpoints("orders".to_owned()).is_retryable());
        assert!(RegistryError::Unavailable("down".to_owned()).is_retryable());
        assert!(!RegistryError::Config("bad".to_owned()).is_retryable());
        assert!(!RegistryError::LeaseNotFound(7).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_reports_operation() {
        let res: Result<()> = with_timeout("lease grant", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

        match res {
            Err(RegistryError::Timeout { op, timeout }) => {
                assert_eq!(op, "lease grant");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
