//! Optimistic local updates with rollback.

use std::future::Future;

/// Apply a local change, run the remote call, and undo the change if the
/// call fails.
///
/// `apply` returns whatever `revert` needs to restore the previous state
/// (usually the old value). The remote error is returned unchanged.
pub async fn with_optimistic_update<S, T, E, A, R, F>(
    apply: A,
    revert: R,
    remote: F,
) -> Result<T, E>
where
    A: FnOnce() -> S,
    R: FnOnce(S),
    F: Future<Output = Result<T, E>>,
{
    let snapshot = apply();
    match remote.await {
        Ok(value) => Ok(value),
        Err(e) => {
            revert(snapshot);
            Err(e)
        }
    }
}
