// SPDX-License-Identifier: GPL-3.0-only

//! Optimistic-concurrency retry

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use storage_contracts::{AgentError, ErrorKind, Registry, Result};
use storage_sys::Backoff;
use storage_types::RegistryObject;

pub const CONFLICT_RETRY_ATTEMPTS: u32 = 5;

fn conflict_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), 1.0, 0.1, 0)
}

/// Runs `op` until it returns anything other than `Conflict`, at most
/// [`CONFLICT_RETRY_ATTEMPTS`] times. `op` receives the zero-based attempt number.
pub async fn retry_on_conflict<T, F, Fut>(cancel: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = conflict_backoff();
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(AgentError::cancelled());
        }
        match op(attempt).await {
            Err(err) if retryable(&err, attempt) => {
                tracing::debug!(attempt, "retrying after conflict: {err}");
                attempt += 1;
                pause(&mut backoff, cancel).await?;
            }
            result => return result,
        }
    }
}

/// Re-reads `name`, applies `mutate` and writes the record back when `mutate` reports a
/// change. Conflicts restart from a fresh read.
pub async fn update_with_retry<T, F>(
    registry: &dyn Registry<T>,
    name: &str,
    cancel: &CancellationToken,
    mut mutate: F,
) -> Result<T>
where
    T: RegistryObject,
    F: FnMut(&mut T) -> Result<bool>,
{
    let mut backoff = conflict_backoff();
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(AgentError::cancelled());
        }
        let mut record = registry.get(name).await?;
        if !mutate(&mut record)? {
            return Ok(record);
        }
        match registry.update(record).await {
            Err(err) if retryable(&err, attempt) => {
                tracing::debug!(kind = T::KIND, name, attempt, "retrying after conflict: {err}");
                attempt += 1;
                pause(&mut backoff, cancel).await?;
            }
            result => return result,
        }
    }
}

fn retryable(err: &AgentError, attempt: u32) -> bool {
    err.is(ErrorKind::Conflict) && attempt + 1 < CONFLICT_RETRY_ATTEMPTS
}

async fn pause(backoff: &mut Backoff, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::cancelled()),
        _ = tokio::time::sleep(backoff.next_delay()) => Ok(()),
    }
}
