//! Page fetching and speculative prefetch.
//!
//! Foreground requests decode on tokio's blocking pool right away. Prefetch
//! work goes through its own small rayon pool behind a semaphore, so a page
//! turn never queues behind speculative decodes.

use crate::error::{DecodeError, PagerError, Result};
use crate::image::access::AccessPolicy;
use crate::image::cache::{CacheWindow, SharedPageCache, lock_cache};
use crate::image::decoder::{DecodedImage, Decoder};
use crate::image::extract::MemberExtractor;
use crate::image::{ContentSource, PageReference};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Which worker pool a decode runs on.
#[derive(Clone)]
pub enum Lane {
    Foreground,
    Background(Arc<rayon::ThreadPool>),
}

/// Reads a page's bytes and decodes them.
pub struct PageFetcher {
    extractor: MemberExtractor,
    decoder: Arc<dyn Decoder>,
    access: Arc<dyn AccessPolicy>,
}

impl PageFetcher {
    pub fn new(
        extractor: MemberExtractor,
        decoder: Arc<dyn Decoder>,
        access: Arc<dyn AccessPolicy>,
    ) -> Self {
        Self {
            extractor,
            decoder,
            access,
        }
    }

    /// Archive members are extracted to memory first; if that fails for a
    /// reason a scratch file could avoid, the member is extracted to disk
    /// once and decoded from there.
    pub async fn fetch(&self, reference: &PageReference, lane: &Lane) -> Result<DecodedImage> {
        match reference {
            PageReference::File(path) => {
                self.access.reacquire(path)?;
                let data = tokio::fs::read(path)
                    .await
                    .map_err(|e| PagerError::from_io(e, path.clone()))?;
                Ok(self.decode_bytes(data, lane).await?)
            }
            PageReference::Member { archive, member } => {
                self.access.reacquire(archive)?;
                match self.extractor.extract(archive, member).await {
                    Ok(data) => Ok(self.decode_bytes(data, lane).await?),
                    Err(e) if e.allows_disk_fallback() => {
                        tracing::info!(
                            member,
                            error = %e,
                            "Memory extraction failed; retrying through scratch file"
                        );
                        self.fetch_from_disk(archive, member, lane).await
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn fetch_from_disk(
        &self,
        archive: &Path,
        member: &str,
        lane: &Lane,
    ) -> Result<DecodedImage> {
        let scratch = self.extractor.extract_to_disk(archive, member).await?;
        let decoder = self.decoder.clone();
        // The scratch file moves into the job and is removed when the job
        // finishes, whether the decode succeeded or not.
        let image = run_decode(lane, move || {
            let result = decoder.decode_file(scratch.path());
            drop(scratch);
            result
        })
        .await?;
        Ok(image)
    }

    async fn decode_bytes(
        &self,
        data: Vec<u8>,
        lane: &Lane,
    ) -> std::result::Result<DecodedImage, DecodeError> {
        let decoder = self.decoder.clone();
        run_decode(lane, move || decoder.decode(&data)).await
    }
}

async fn run_decode<F>(lane: &Lane, job: F) -> std::result::Result<DecodedImage, DecodeError>
where
    F: FnOnce() -> std::result::Result<DecodedImage, DecodeError> + Send + 'static,
{
    match lane {
        Lane::Foreground => tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| DecodeError::Task(e.to_string()))?,
        Lane::Background(pool) => {
            let (tx, rx) = oneshot::channel();
            pool.spawn(move || {
                let _ = tx.send(job());
            });
            rx.await
                .map_err(|_| DecodeError::Task("decode worker dropped the job".to_string()))?
        }
    }
}

/// Speculatively decodes the pages around a center index into the cache.
pub struct Prefetcher {
    fetcher: Arc<PageFetcher>,
    cache: SharedPageCache,
    pool: Arc<rayon::ThreadPool>,
    permits: Arc<Semaphore>,
    radius: usize,
    token: CancellationToken,
    tasks: JoinSet<()>,
}

impl Prefetcher {
    pub fn new(
        fetcher: Arc<PageFetcher>,
        cache: SharedPageCache,
        radius: usize,
        workers: usize,
    ) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("hayate-prefetch-{i}"))
            .build()
            .map_err(std::io::Error::other)?;
        Ok(Self {
            fetcher,
            cache,
            pool: Arc::new(pool),
            permits: Arc::new(Semaphore::new(workers)),
            radius,
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
        })
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Cancels the previous batch, then launches one task per page in the
    /// window around `center` that is not cached yet, nearest first.
    pub async fn schedule(&mut self, center: usize, source: Arc<ContentSource>) {
        self.cancel_all().await;
        let window = CacheWindow::new(center, self.radius, source.total_pages());
        let targets: Vec<usize> = {
            let cache = lock_cache(&self.cache);
            window
                .by_distance()
                .into_iter()
                .filter(|&i| !cache.contains(i))
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        tracing::debug!(center, ?targets, "Scheduling prefetch");

        for index in targets {
            let job = PrefetchJob {
                index,
                source: source.clone(),
                fetcher: self.fetcher.clone(),
                cache: self.cache.clone(),
                lane: Lane::Background(self.pool.clone()),
                permits: self.permits.clone(),
                token: self.token.clone(),
            };
            self.tasks.spawn(job.run());
        }
    }

    /// Cancels every in-flight task and waits until each has finished.
    /// Once this returns nothing from the cancelled batch touches the cache.
    pub async fn cancel_all(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        self.token.cancel();
        self.drain().await;
        self.token = CancellationToken::new();
    }

    /// Waits for the current batch to finish without cancelling it.
    pub async fn wait_idle(&mut self) {
        self.drain().await;
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!(error = %e, "Prefetch task panicked");
                }
            }
        }
    }
}

struct PrefetchJob {
    index: usize,
    source: Arc<ContentSource>,
    fetcher: Arc<PageFetcher>,
    cache: SharedPageCache,
    lane: Lane,
    permits: Arc<Semaphore>,
    token: CancellationToken,
}

impl PrefetchJob {
    async fn run(self) {
        let index = self.index;
        let work = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| PagerError::Io(std::io::Error::other(e)))?;
            let reference = self.source.reference(index)?;
            self.fetcher.fetch(&reference, &self.lane).await
        };

        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                tracing::trace!(index, "Prefetch cancelled");
                return;
            }
            result = work => result,
        };

        match result {
            Ok(image) => {
                let mut cache = lock_cache(&self.cache);
                if self.token.is_cancelled() {
                    return;
                }
                cache.put(index, Arc::new(image));
                tracing::trace!(index, "Prefetched page");
            }
            Err(e) => tracing::debug!(index, error = %e, "Prefetch failed; ignoring"),
        }
    }
}

/// Foreground page access: cache first, decode on miss, then refresh the
/// retention window and the prefetch batch around the new position.
pub struct PageLoader {
    fetcher: Arc<PageFetcher>,
    cache: SharedPageCache,
    prefetcher: Prefetcher,
}

impl PageLoader {
    pub fn new(
        fetcher: PageFetcher,
        cache: SharedPageCache,
        radius: usize,
        workers: usize,
    ) -> Result<Self> {
        let fetcher = Arc::new(fetcher);
        let prefetcher = Prefetcher::new(fetcher.clone(), cache.clone(), radius, workers)?;
        Ok(Self {
            fetcher,
            cache,
            prefetcher,
        })
    }

    pub fn cache(&self) -> &SharedPageCache {
        &self.cache
    }

    pub fn prefetcher(&mut self) -> &mut Prefetcher {
        &mut self.prefetcher
    }

    /// Returns the decoded page at `index`, decoding it on a miss.
    #[instrument(skip(self, source))]
    pub async fn load(&self, source: &ContentSource, index: usize) -> Result<Arc<DecodedImage>> {
        let cached = lock_cache(&self.cache).get(index);
        if let Some(image) = cached {
            return Ok(image);
        }
        let reference = source.reference(index)?;
        let image = Arc::new(self.fetcher.fetch(&reference, &Lane::Foreground).await?);
        lock_cache(&self.cache).put(index, image.clone());
        Ok(image)
    }

    /// Loads the pages shown at `center`. On success the cache is trimmed to
    /// the window around `center` and prefetch restarts there; on failure the
    /// caller decides where prefetch should resume.
    pub async fn show(
        &mut self,
        source: &Arc<ContentSource>,
        center: usize,
        pages: &[usize],
    ) -> Result<Vec<Arc<DecodedImage>>> {
        self.prefetcher.cancel_all().await;
        let mut images = Vec::with_capacity(pages.len());
        for &index in pages {
            images.push(self.load(source, index).await?);
        }
        let window = CacheWindow::new(center, self.prefetcher.radius(), source.total_pages());
        let mut keep: BTreeSet<usize> = window.to_set();
        keep.extend(pages.iter().copied());
        lock_cache(&self.cache).evict_outside(&keep);
        self.prefetcher.schedule(center, source.clone()).await;
        Ok(images)
    }

    /// Restarts prefetch around `center` without a foreground load.
    pub async fn refresh_prefetch(&mut self, source: &Arc<ContentSource>, center: usize) {
        self.prefetcher.schedule(center, source.clone()).await;
    }

    /// Stops prefetch (waiting for every task) and empties the cache.
    pub async fn reset(&mut self) {
        self.prefetcher.cancel_all().await;
        lock_cache(&self.cache).clear();
    }
}
