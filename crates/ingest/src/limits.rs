//! Process-wide bound on concurrent ingestions.

use crate::error::{IngestError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const CONCURRENCY_ENV: &str = "ATOMSTORE_INGEST_CONCURRENCY";
const MAX_INGEST_CONCURRENCY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConcurrencySnapshot {
    pub limit: usize,
    pub in_flight: usize,
    pub waiters: usize,
}

struct Limiter {
    limit: usize,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    running: AtomicUsize,
}

fn limiter() -> &'static Limiter {
    static LIMITER: OnceLock<Limiter> = OnceLock::new();
    LIMITER.get_or_init(|| {
        let raw = std::env::var(CONCURRENCY_ENV).ok();
        let limit = resolve_limit(raw.as_deref(), default_limit());
        log::debug!("Ingest concurrency limit: {limit}");
        Limiter {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            waiting: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
        }
    })
}

/// Half the cores, at most 8
fn default_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .div_ceil(2)
        .clamp(1, 8)
}

fn resolve_limit(raw: Option<&str>, fallback: usize) -> usize {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => match raw.parse::<usize>() {
            Ok(limit) => limit.clamp(1, MAX_INGEST_CONCURRENCY),
            Err(_) => {
                log::warn!("Ignoring {CONCURRENCY_ENV}={raw}: not a number");
                fallback
            }
        },
        None => fallback,
    }
}

pub fn ingest_concurrency_snapshot() -> IngestConcurrencySnapshot {
    let limiter = limiter();
    IngestConcurrencySnapshot {
        limit: limiter.limit,
        in_flight: limiter.running.load(Ordering::Relaxed),
        waiters: limiter.waiting.load(Ordering::Relaxed),
    }
}

/// Slot of one running ingestion
pub(crate) struct IngestPermit {
    _permit: OwnedSemaphorePermit,
}

impl Drop for IngestPermit {
    fn drop(&mut self) {
        limiter().running.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counts a caller as waiting until it gets a slot or gives up
struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) async fn acquire_ingest_permit() -> Result<IngestPermit> {
    let limiter = limiter();
    limiter.waiting.fetch_add(1, Ordering::Relaxed);
    let waiting = Waiting(&limiter.waiting);
    let permit = limiter
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| IngestError::internal("ingest concurrency limiter closed"))?;
    drop(waiting);

    limiter.running.fetch_add(1, Ordering::Relaxed);
    Ok(IngestPermit { _permit: permit })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_from_env_is_clamped() {
        let fallback = default_limit();
        assert!((1..=8).contains(&fallback));
        assert_eq!(resolve_limit(None, fallback), fallback);
        assert_eq!(resolve_limit(Some("   "), fallback), fallback);
        assert_eq!(resolve_limit(Some("abc"), fallback), fallback);
        assert_eq!(resolve_limit(Some(" 5 "), fallback), 5);
        assert_eq!(resolve_limit(Some("0"), fallback), 1);
        assert_eq!(resolve_limit(Some("999"), fallback), MAX_INGEST_CONCURRENCY);
    }

    #[tokio::test]
    async fn permits_count_as_in_flight() {
        let permit = acquire_ingest_permit().await.unwrap();
        let snapshot = ingest_concurrency_snapshot();
        assert!(snapshot.in_flight >= 1);
        assert!(snapshot.limit >= 1);
        drop(permit);
    }
}
