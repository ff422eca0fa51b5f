// src/runtime/admission.rs
//! Admission control for cold-spawn executions
//!
//! Pooled execution is bounded implicitly by pool size plus the wait
//! queue. The cold path spawns a fresh interpreter per call, so a
//! counting semaphore bounds how many of those can be in flight across
//! the whole process. Waiters are served in FIFO order (tokio's
//! semaphore is fair).

use crate::utils::errors::{Result, SandboxError};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct AdmissionSemaphore {
    inner: Arc<Semaphore>,
    max: usize,
}

impl AdmissionSemaphore {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Grant immediately if a permit is free, otherwise queue FIFO.
    /// The permit releases itself on drop, handing capacity straight to
    /// the oldest waiter.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.inner)
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::PoolShuttingDown)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.max - self.inner.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_grants_up_to_max() {
        let sem = AdmissionSemaphore::new(2);
        let p1 = sem.acquire().await.unwrap();
        let p2 = sem.acquire().await.unwrap();
        assert_eq!(sem.in_flight(), 2);
        drop(p1);
        drop(p2);
        assert_eq!(sem.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_excess_acquire_waits_for_release() {
        let sem = AdmissionSemaphore::new(1);
        let permit = sem.acquire().await.unwrap();

        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move {
                let _p = sem.acquire().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be served after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiters_served_in_fifo_order() {
        let sem = AdmissionSemaphore::new(1);
        let gate = sem.acquire().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for i in 0..3 {
            let sem = sem.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _p = sem.acquire().await.unwrap();
                tx.send(i).ok();
            }));
            // Queue in a deterministic order
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(gate);
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
        for h in handles {
            h.await.unwrap();
        }
    }
}
