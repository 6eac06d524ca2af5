// SPDX-License-Identifier: GPL-3.0-only

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{AgentError, Result};

/// Runs `fut` until it completes or `cancel` fires.
///
/// On cancellation the future is dropped, which aborts in-flight registry calls and kills
/// child processes spawned with `kill_on_drop`.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(AgentError::cancelled());
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::cancelled()),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn returns_result_when_not_cancelled() {
        let cancel = CancellationToken::new();
        let value = with_cancel(&cancel, async { Ok(7) }).await.expect("value");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_future() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<()> = with_cancel(&cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.map_err(|e| e.kind), Err(ErrorKind::Cancelled));
    }
}
