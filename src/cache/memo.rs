//! Per-job memoization of derived results.
//!
//! Lets the inference retry loop re-enter without redoing aggregation.
//! Entries are keyed by `(job, computation)` and tagged with the dataset
//! they were computed from; they never outlive the job.

use dashmap::DashMap;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::JobId;

struct MemoEntry {
    dataset_key: String,
    value: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct MemoCache {
    entries: DashMap<(JobId, &'static str), MemoEntry>,
    computations: DashMap<&'static str, usize>,
}

impl MemoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized value or run `compute` and store it.
    ///
    /// Errors are passed through and not stored, so the next call
    /// computes again.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        job_id: JobId,
        name: &'static str,
        dataset_key: &str,
        compute: F,
    ) -> Result<Arc<T>, E>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.lookup(job_id, name, dataset_key) {
            return Ok(value);
        }

        let value = Arc::new(compute().await?);
        self.store(job_id, name, dataset_key, Arc::clone(&value));
        Ok(value)
    }

    /// Synchronous variant for infallible computations.
    pub fn get_or_compute_sync<T, F>(
        &self,
        job_id: JobId,
        name: &'static str,
        dataset_key: &str,
        compute: F,
    ) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.lookup(job_id, name, dataset_key) {
            return value;
        }

        let value = Arc::new(compute());
        self.store(job_id, name, dataset_key, Arc::clone(&value));
        value
    }

    /// Drop entries of `job_id` that were computed for another dataset.
    pub fn begin(&self, job_id: JobId, dataset_key: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(job, _), entry| *job != job_id || entry.dataset_key == dataset_key);
        before.saturating_sub(self.entries.len())
    }

    /// Drop every entry of `job_id`.
    pub fn release(&self, job_id: JobId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(job, _), _| *job != job_id);
        let released = before.saturating_sub(self.entries.len());
        if released > 0 {
            debug!(job_id = %job_id, released, "Released memoized results");
        }
        released
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Computations performed across all names since startup.
    pub fn total_computations(&self) -> usize {
        self.computations.iter().map(|c| *c.value()).sum()
    }

    /// How many times `name` has actually been computed.
    #[cfg(test)]
    pub fn compute_count(&self, name: &str) -> usize {
        self.computations.get(name).map(|c| *c).unwrap_or(0)
    }

    fn lookup<T>(&self, job_id: JobId, name: &'static str, dataset_key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.entries.get(&(job_id, name))?;

        if entry.dataset_key != dataset_key {
            warn!(
                job_id = %job_id,
                computation = name,
                stored = %entry.dataset_key,
                requested = dataset_key,
                "Memoized result belongs to another dataset, recomputing"
            );
            return None;
        }

        match Arc::clone(&entry.value).downcast::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    computation = name,
                    "Memoized result has an unexpected type, recomputing"
                );
                None
            }
        }
    }

    fn store<T>(&self, job_id: JobId, name: &'static str, dataset_key: &str, value: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        *self.computations.entry(name).or_insert(0) += 1;
        self.entries.insert(
            (job_id, name),
            MemoEntry {
                dataset_key: dataset_key.to_string(),
                value,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_second_call_reuses_value() {
        let memo = MemoCache::new();
        let job = JobId::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Arc<u32> = memo
                .get_or_compute(job, "performance", "p1", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::convert::Infallible>(42)
                })
                .await
                .unwrap();
            assert_eq!(*value, 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.compute_count("performance"), 1);
    }

    #[test]
    fn test_dataset_mismatch_recomputes() {
        let memo = MemoCache::new();
        let job = JobId::new();

        let first = memo.get_or_compute_sync(job, "playstyle", "p1", || "for p1".to_string());
        let second = memo.get_or_compute_sync(job, "playstyle", "p2", || "for p2".to_string());

        assert_eq!(*first, "for p1");
        assert_eq!(*second, "for p2");
        assert_eq!(memo.compute_count("playstyle"), 2);
    }

    #[test]
    fn test_jobs_are_isolated() {
        let memo = MemoCache::new();
        let (a, b) = (JobId::new(), JobId::new());

        memo.get_or_compute_sync(a, "performance", "p1", || 1u8);
        let other = memo.get_or_compute_sync(b, "performance", "p1", || 2u8);

        assert_eq!(*other, 2);
        assert_eq!(memo.entry_count(), 2);
    }

    #[test]
    fn test_release_drops_only_that_job() {
        let memo = MemoCache::new();
        let (a, b) = (JobId::new(), JobId::new());
        memo.get_or_compute_sync(a, "performance", "p1", || 1u8);
        memo.get_or_compute_sync(a, "champion_pool", "p1", || 1u8);
        memo.get_or_compute_sync(b, "performance", "p2", || 1u8);

        assert_eq!(memo.release(a), 2);
        assert_eq!(memo.entry_count(), 1);
        assert_eq!(memo.release(a), 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_memoized() {
        let memo = MemoCache::new();
        let job = JobId::new();

        let failed: Result<Arc<u32>, &str> = memo
            .get_or_compute(job, "performance", "p1", || async { Err("boom") })
            .await;
        assert!(failed.is_err());
        assert_eq!(memo.entry_count(), 0);

        let value: Result<Arc<u32>, &str> = memo
            .get_or_compute(job, "performance", "p1", || async { Ok(7) })
            .await;
        assert_eq!(*value.unwrap(), 7);
    }

    #[test]
    fn test_begin_discards_other_dataset() {
        let memo = MemoCache::new();
        let job = JobId::new();
        memo.get_or_compute_sync(job, "performance", "p1", || 1u8);

        assert_eq!(memo.begin(job, "p1"), 0);
        assert_eq!(memo.begin(job, "p2"), 1);
        assert_eq!(memo.entry_count(), 0);
    }
}
