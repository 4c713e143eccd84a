use std::sync::Arc;

use log::{info, warn};

use crate::error::{ReloadError, UpdateError};
use crate::traits::ReloadStrategy;

/// Try each strategy in order and return the name of the first that
/// succeeds.
///
/// # Errors
/// Returns [`UpdateError::Reload`] with the last failure when every strategy
/// fails, or when none is configured.
pub async fn reload_with_fallbacks(
    strategies: &[Arc<dyn ReloadStrategy>],
) -> Result<&'static str, UpdateError> {
    let mut last = ReloadError::new("none", "no reload strategy configured");

    for (index, strategy) in strategies.iter().enumerate() {
        match strategy.reload().await {
            Ok(()) => {
                info!("Reload triggered via {}", strategy.name());
                return Ok(strategy.name());
            }
            Err(error) => {
                warn!(
                    "Reload strategy {} ({}/{}) failed: {error}",
                    strategy.name(),
                    index + 1,
                    strategies.len()
                );
                last = error;
            }
        }
    }

    Err(UpdateError::Reload {
        attempts: strategies.len(),
        last,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::reload_with_fallbacks;
    use crate::error::{ReloadError, UpdateError};
    use crate::test_support::CountingReload;
    use crate::traits::ReloadStrategy;

    #[tokio::test]
    async fn first_success_short_circuits() {
        let soft = Arc::new(CountingReload::failing("soft"));
        let hard = Arc::new(CountingReload::succeeding("hard"));
        let spare = Arc::new(CountingReload::succeeding("spare"));
        let strategies: Vec<Arc<dyn ReloadStrategy>> =
            vec![soft.clone(), hard.clone(), spare.clone()];

        let used = reload_with_fallbacks(&strategies)
            .await
            .expect("second strategy should succeed");

        assert_eq!(used, "hard");
        assert_eq!(soft.calls(), 1);
        assert_eq!(hard.calls(), 1);
        assert_eq!(spare.calls(), 0);
    }

    #[tokio::test]
    async fn all_failing_reports_last_error() {
        let strategies: Vec<Arc<dyn ReloadStrategy>> = vec![
            Arc::new(CountingReload::failing("soft")),
            Arc::new(CountingReload::failing("hard")),
        ];

        let error = reload_with_fallbacks(&strategies).await.unwrap_err();

        assert_eq!(
            error,
            UpdateError::Reload {
                attempts: 2,
                last: ReloadError::new("hard", "simulated failure"),
            }
        );
    }

    #[tokio::test]
    async fn empty_strategy_list_is_a_failure() {
        let error = reload_with_fallbacks(&[]).await.unwrap_err();
        assert!(matches!(error, UpdateError::Reload { attempts: 0, .. }));
    }
}
