// src/engine/workpool.rs
//! Two-level bounded scheduler.
//!
//! The standard and headless pools are independent. A host job first takes
//! a host token; inside it, each template takes a token from a per-host
//! template semaphore. Host count across the scan and template parallelism
//! within one host are therefore bounded separately.
//!
//! Cancellation fails every pending acquisition with `Cancelled`; running
//! jobs observe the handle at their next suspension point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::TemplarError;

/// Scan-wide cancellation signal. Cheap to clone and safe to flip from a
/// signal handler context: it only stores a flag and wakes waiters.
#[derive(Clone, Default)]
pub struct CancellationHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Standard,
    Headless,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkPoolConfig {
    pub host_concurrency: usize,
    pub template_concurrency: usize,
    pub headless_host_concurrency: usize,
    pub headless_template_concurrency: usize,
}

impl Default for WorkPoolConfig {
    fn default() -> Self {
        Self {
            host_concurrency: 25,
            template_concurrency: 25,
            headless_host_concurrency: 10,
            headless_template_concurrency: 10,
        }
    }
}

/// The scheduler: semaphores plus the join list of spawned host jobs
pub struct WorkPool {
    config: WorkPoolConfig,
    standard_hosts: Arc<Semaphore>,
    headless_hosts: Arc<Semaphore>,
    cancel: CancellationHandle,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkPool {
    pub fn new(config: WorkPoolConfig, cancel: CancellationHandle) -> Self {
        Self {
            standard_hosts: Arc::new(Semaphore::new(config.host_concurrency.max(1))),
            headless_hosts: Arc::new(Semaphore::new(config.headless_host_concurrency.max(1))),
            config,
            cancel,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    /// Take a host token, or fail with `Cancelled`
    pub async fn acquire_host(
        &self,
        kind: PoolKind,
    ) -> Result<OwnedSemaphorePermit, TemplarError> {
        let semaphore = match kind {
            PoolKind::Standard => self.standard_hosts.clone(),
            PoolKind::Headless => self.headless_hosts.clone(),
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TemplarError::Cancelled),
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| TemplarError::Cancelled)
            }
        }
    }

    /// Fresh per-host template semaphore for one host job
    pub fn template_tokens(&self, kind: PoolKind) -> Arc<Semaphore> {
        let size = match kind {
            PoolKind::Standard => self.config.template_concurrency,
            PoolKind::Headless => self.config.headless_template_concurrency,
        };
        Arc::new(Semaphore::new(size.max(1)))
    }

    /// Take a template token from a host job's semaphore, or fail with
    /// `Cancelled`
    pub async fn acquire_template(
        &self,
        tokens: &Arc<Semaphore>,
    ) -> Result<OwnedSemaphorePermit, TemplarError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TemplarError::Cancelled),
            permit = tokens.clone().acquire_owned() => {
                permit.map_err(|_| TemplarError::Cancelled)
            }
        }
    }

    /// Spawn a host job whose handle `wait()` will join
    pub async fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(fut);
        self.jobs.lock().await.push(handle);
    }

    /// Block until every spawned job has finished and every token is back
    pub async fn wait(&self) {
        loop {
            let drained = {
                let mut jobs = self.jobs.lock().await;
                std::mem::take(&mut *jobs)
            };
            if drained.is_empty() {
                return;
            }
            for job in drained {
                let _ = job.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_host_concurrency_ceiling() {
        let pool = Arc::new(WorkPool::new(
            WorkPoolConfig {
                host_concurrency: 2,
                template_concurrency: 1,
                ..Default::default()
            },
            CancellationHandle::new(),
        ));

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let permit = pool.acquire_host(PoolKind::Standard).await.unwrap();
            let active = active.clone();
            let peak = peak.clone();
            pool.spawn(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            })
            .await;
        }
        pool.wait().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_template_tokens_bound_within_host() {
        let pool = Arc::new(WorkPool::new(
            WorkPoolConfig {
                host_concurrency: 1,
                template_concurrency: 3,
                ..Default::default()
            },
            CancellationHandle::new(),
        ));

        let tokens = pool.template_tokens(PoolKind::Standard);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..12 {
            let permit = pool.acquire_template(&tokens).await.unwrap();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_cancellation_fails_pending_acquisitions() {
        let cancel = CancellationHandle::new();
        let pool = WorkPool::new(
            WorkPoolConfig {
                host_concurrency: 1,
                ..Default::default()
            },
            cancel.clone(),
        );

        let held = pool.acquire_host(PoolKind::Standard).await.unwrap();
        cancel.cancel();
        let result = pool.acquire_host(PoolKind::Standard).await;
        assert!(matches!(result, Err(TemplarError::Cancelled)));
        drop(held);
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let cancel = CancellationHandle::new();
        let waiter = cancel.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancellation must wake waiters")
            .unwrap();
    }

    #[tokio::test]
    async fn test_headless_pool_is_independent() {
        let pool = WorkPool::new(
            WorkPoolConfig {
                host_concurrency: 1,
                headless_host_concurrency: 1,
                ..Default::default()
            },
            CancellationHandle::new(),
        );
        // Exhaust standard; headless must still be available
        let _standard = pool.acquire_host(PoolKind::Standard).await.unwrap();
        let headless = tokio::time::timeout(
            Duration::from_millis(100),
            pool.acquire_host(PoolKind::Headless),
        )
        .await;
        assert!(headless.is_ok());
    }
}
