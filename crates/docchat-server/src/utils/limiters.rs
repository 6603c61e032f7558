use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LimitsConfig;

/// Bounds on blocking extraction work and upstream model calls
#[derive(Clone)]
pub struct Limiters {
    pub extraction: Arc<Semaphore>,
    pub completion: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &LimitsConfig) -> Self {
        Self {
            extraction: Arc::new(Semaphore::new(cfg.extraction_concurrency.max(1))),
            completion: Arc::new(Semaphore::new(cfg.completion_concurrency.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration)> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| anyhow::anyhow!("Limiter acquire timeout for op={}", op))??;

        Ok((permit, start.elapsed()))
    }

    pub async fn acquire_extraction(&self) -> Result<OwnedSemaphorePermit> {
        let (permit, waited) =
            Self::acquire_timed(self.extraction.clone(), self.acquire_timeout, "extract").await?;
        if waited > Duration::from_millis(100) {
            tracing::debug!("Waited {:?} for an extraction slot", waited);
        }
        Ok(permit)
    }

    pub async fn acquire_completion(&self) -> Result<OwnedSemaphorePermit> {
        let (permit, waited) =
            Self::acquire_timed(self.completion.clone(), self.acquire_timeout, "complete").await?;
        if waited > Duration::from_millis(100) {
            tracing::debug!("Waited {:?} for a completion slot", waited);
        }
        Ok(permit)
    }
}
