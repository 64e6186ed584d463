//! Per-worker reusable clients
//!
//! Building an HTTP session or an extractor is expensive, so each worker builds
//! its pair once and keeps it for its whole lifetime. Pairs are keyed by worker
//! identity and never handed to another worker. There is no teardown: entries
//! live as long as the store, and workers are long-lived runtime threads.

use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use crate::extractor::{ExtractorFactory, FormatExtractor};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;
use tracing::debug;

/// Identity of a worker owning a resource pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerId {
    /// A runtime worker thread
    Thread(ThreadId),
    /// An explicitly numbered worker
    Numbered(u64),
}

impl WorkerId {
    /// The worker running the caller
    pub fn current() -> Self {
        WorkerId::Thread(std::thread::current().id())
    }
}

/// The session and extractor owned by one worker
pub struct WorkerResources {
    pub http: Client,
    pub extractor: Arc<dyn FormatExtractor>,
}

/// Worker-keyed pool of lazily built [`WorkerResources`]
pub struct ResourceStore {
    pool: Mutex<HashMap<WorkerId, Arc<WorkerResources>>>,
    extractor_factory: ExtractorFactory,
    timeout: Duration,
    pool_max_idle_per_host: usize,
}

impl ResourceStore {
    pub fn new(upstream: &UpstreamConfig, extractor_factory: ExtractorFactory) -> Self {
        ResourceStore {
            pool: Mutex::new(HashMap::new()),
            extractor_factory,
            timeout: upstream.timeout(),
            pool_max_idle_per_host: upstream.pool_max_idle_per_host,
        }
    }

    /// Resources for the calling worker
    pub fn for_current_worker(&self) -> Result<Arc<WorkerResources>> {
        self.for_worker(WorkerId::current())
    }

    /// Resources for `worker`, building them on first use
    ///
    /// Building happens outside the pool lock so other workers' lookups are not
    /// held up. If two builds for one worker race, the first stored pair wins and
    /// every caller gets it.
    pub fn for_worker(&self, worker: WorkerId) -> Result<Arc<WorkerResources>> {
        if let Some(resources) = self.lock_pool().get(&worker) {
            return Ok(Arc::clone(resources));
        }

        let built = Arc::new(self.build()?);

        let mut pool = self.lock_pool();
        let resources = Arc::clone(pool.entry(worker).or_insert(built));
        debug!("Built resources for worker {:?} (workers={})", worker, pool.len());
        Ok(resources)
    }

    /// Number of workers that own a resource pair
    pub fn worker_count(&self) -> usize {
        self.lock_pool().len()
    }

    fn lock_pool(&self) -> MutexGuard<'_, HashMap<WorkerId, Arc<WorkerResources>>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build(&self) -> Result<WorkerResources> {
        let http = Client::builder()
            .connect_timeout(self.timeout)
            .read_timeout(self.timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                RelayError::InternalError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(WorkerResources {
            http,
            extractor: (self.extractor_factory)(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractedInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullExtractor;

    #[async_trait]
    impl FormatExtractor for NullExtractor {
        async fn extract(&self, _watch_url: &str) -> Result<ExtractedInfo> {
            Ok(ExtractedInfo::default())
        }
    }

    fn counting_store() -> (ResourceStore, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let factory: ExtractorFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(NullExtractor) as Arc<dyn FormatExtractor>
        });
        (ResourceStore::new(&UpstreamConfig::default(), factory), builds)
    }

    #[test]
    fn test_same_worker_reuses_resources() {
        let (store, builds) = counting_store();

        let first = store.for_worker(WorkerId::Numbered(1)).unwrap();
        let second = store.for_worker(WorkerId::Numbered(1)).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_workers_never_share() {
        let (store, builds) = counting_store();

        let a = store.for_worker(WorkerId::Numbered(1)).unwrap();
        let b = store.for_worker(WorkerId::Numbered(2)).unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(store.worker_count(), 2);
    }

    #[test]
    fn test_threads_get_their_own_pair() {
        let (store, _) = counting_store();
        let store = Arc::new(store);

        let here = store.for_current_worker().unwrap();
        let there = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.for_current_worker().unwrap())
                .join()
                .unwrap()
        };

        assert!(!Arc::ptr_eq(&here, &there));
        assert!(Arc::ptr_eq(&here, &store.for_current_worker().unwrap()));
    }

    #[test]
    fn test_slow_build_does_not_block_other_workers() {
        let builds = Arc::new(AtomicUsize::new(0));
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let counter = Arc::clone(&builds);
        let factory: ExtractorFactory = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = gate
                    .lock()
                    .unwrap()
                    .recv_timeout(std::time::Duration::from_secs(5));
            }
            Arc::new(NullExtractor) as Arc<dyn FormatExtractor>
        });
        let store = Arc::new(ResourceStore::new(&UpstreamConfig::default(), factory));

        let slow = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.for_worker(WorkerId::Numbered(1)).unwrap())
        };
        while builds.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let started = std::time::Instant::now();
        store.for_worker(WorkerId::Numbered(2)).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(store.worker_count(), 1);

        release.send(()).unwrap();
        slow.join().unwrap();
        assert_eq!(store.worker_count(), 2);
    }
}
