//! Resilience layer over the store backend.
//!
//! Every operation runs under a deadline picked by the caller:
//! interactive work gets 30 seconds, scheduled bulk work 120. Rate
//! limits are retried with exponential backoff (the store's Retry-After
//! hint wins when present) up to a fixed ceiling; any other transient
//! fault gets exactly one quick retry. The deadline is enforced
//! independently of backoff: a retry that could not finish in time is
//! not attempted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::model::{Provenance, TaskDraft, TaskRecord, TaskStatus};
use crate::store::backend::{StoreBackend, TaskQuery};

const RATE_LIMIT_RETRIES: u32 = 3;
const QUICK_RETRY_DELAY: Duration = Duration::from_millis(500);
const JITTER_MAX_MS: u64 = 250;

/// Bounded parallelism for page-body hydration.
const BODY_FETCH_CONCURRENCY: usize = 3;
/// Never hydrate more than this many result bodies.
const BODY_FETCH_MAX: usize = 10;

/// Operation deadline class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// A user is waiting on the reply.
    Interactive,
    /// Scheduled scans and sweeps.
    Bulk,
}

impl Deadline {
    pub fn duration(&self) -> Duration {
        match self {
            Deadline::Interactive => Duration::from_secs(30),
            Deadline::Bulk => Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct ResilientStore {
    backend: Arc<dyn StoreBackend>,
}

impl ResilientStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        ResilientStore { backend }
    }

    pub async fn create_task(
        &self,
        draft: &TaskDraft,
        provenance: Provenance,
        deadline: Deadline,
    ) -> Result<TaskRecord, StoreError> {
        self.run(deadline, "create_task", || {
            self.backend.create_task(draft, provenance)
        })
        .await
    }

    /// Idempotent by construction: setting a status the record already
    /// holds changes nothing on the store side.
    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        self.run(deadline, "update_status", || {
            self.backend.update_status(id, status)
        })
        .await
    }

    pub async fn fetch_task(&self, id: &str, deadline: Deadline) -> Result<TaskRecord, StoreError> {
        self.run(deadline, "fetch_task", || self.backend.fetch_task(id))
            .await
    }

    pub async fn fetch_body(&self, id: &str, deadline: Deadline) -> Result<String, StoreError> {
        self.run(deadline, "fetch_body", || self.backend.fetch_body(id))
            .await
    }

    pub async fn query_tasks(
        &self,
        query: &TaskQuery,
        deadline: Deadline,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.run(deadline, "query_tasks", || self.backend.query_tasks(query))
            .await
    }

    /// Best-effort body hydration for a result list: at most
    /// [`BODY_FETCH_MAX`] pages, [`BODY_FETCH_CONCURRENCY`] in flight.
    /// Failures drop the body, never the result.
    pub async fn fetch_bodies(&self, records: &[TaskRecord]) -> HashMap<String, String> {
        let semaphore = Arc::new(Semaphore::new(BODY_FETCH_CONCURRENCY));
        let mut handles = Vec::new();
        for record in records.iter().take(BODY_FETCH_MAX) {
            let store = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let id = record.id.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                match store.fetch_body(&id, Deadline::Interactive).await {
                    Ok(body) if !body.trim().is_empty() => Some((id, body)),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!(id = %id, error = %e, "body hydration skipped");
                        None
                    }
                }
            }));
        }

        let mut bodies = HashMap::new();
        for handle in handles {
            if let Ok(Some((id, body))) = handle.await {
                bodies.insert(id, body);
            }
        }
        bodies
    }

    async fn run<T, F, Fut>(
        &self,
        deadline: Deadline,
        op: &'static str,
        attempt: F,
    ) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let budget = deadline.duration();
        let started = Instant::now();
        let mut rate_limit_attempts: u32 = 0;
        let mut quick_retry_spent = false;

        loop {
            let Some(remaining) = budget.checked_sub(started.elapsed()) else {
                return Err(StoreError::Timeout(budget));
            };
            let outcome = tokio::time::timeout(remaining, attempt()).await;
            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => return Err(StoreError::Timeout(budget)),
            };

            match err {
                StoreError::RateLimited { retry_after } => {
                    if rate_limit_attempts >= RATE_LIMIT_RETRIES {
                        return Err(StoreError::Unavailable {
                            reason: format!("rate limited past {RATE_LIMIT_RETRIES} retries"),
                        });
                    }
                    let base = retry_after
                        .unwrap_or_else(|| Duration::from_secs(1u64 << rate_limit_attempts));
                    let wait = base + jitter();
                    rate_limit_attempts += 1;
                    if started.elapsed() + wait >= budget {
                        return Err(StoreError::Timeout(budget));
                    }
                    tracing::warn!(
                        op,
                        attempt = rate_limit_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "store rate limited, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                e if e.is_transient() && !quick_retry_spent => {
                    quick_retry_spent = true;
                    if started.elapsed() + QUICK_RETRY_DELAY >= budget {
                        return Err(StoreError::Timeout(budget));
                    }
                    tracing::warn!(op, error = %e, "transient store fault, one retry");
                    tokio::time::sleep(QUICK_RETRY_DELAY).await;
                }
                e if e.is_transient() => {
                    return Err(StoreError::Unavailable { reason: e.to_string() });
                }
                e => return Err(e),
            }
        }
    }
}

fn jitter() -> Duration {
    use rand::Rng;
    Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MAX_MS))
}
