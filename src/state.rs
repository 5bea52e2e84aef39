use crate::config::Settings;
use crate::error::{PagerError, Result};
use crate::image::ContentSource;
use crate::image::access::{AccessPolicy, FilesystemAccess};
use crate::image::archive::ArchiveIndex;
use crate::image::cache::{CacheStats, create_shared_cache, lock_cache};
use crate::image::decoder::{DecodedImage, Decoder, RasterDecoder};
use crate::image::extract::MemberExtractor;
use crate::image::loader::{PageFetcher, PageLoader};
use crate::image::tool::ArchiveTool;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingDirection {
    LeftToRight,
    RightToLeft,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderPhase {
    Idle,
    Loading,
    Ready,
    /// Human readable description of the failure.
    Error(String),
}

/// Spread layout with the cover (page 0) always on its own and every
/// following pair starting on an odd index: `[0] [1 2] [3 4] ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spread {
    pub total_pages: usize,
    pub is_double_page: bool,
}

impl Spread {
    pub fn new(total_pages: usize, is_double_page: bool) -> Self {
        Self {
            total_pages,
            is_double_page,
        }
    }

    /// Moves `index` back to the first page of the spread containing it.
    pub fn snap(&self, index: usize) -> usize {
        if !self.is_double_page || index == 0 || index % 2 == 1 {
            index
        } else {
            index - 1
        }
    }

    /// Pages shown when the cursor is at `index`, in reading order.
    pub fn pages_at(&self, index: usize) -> Vec<usize> {
        if self.total_pages == 0 {
            return Vec::new();
        }
        let index = index.min(self.total_pages - 1);
        if !self.is_double_page || index == 0 || index + 1 >= self.total_pages {
            return vec![index];
        }
        vec![index, index + 1]
    }

    /// The cursor after moving `delta` spreads (or pages) from `current`.
    /// Stays put at either end.
    pub fn step(&self, current: usize, delta: isize) -> usize {
        if self.total_pages == 0 {
            return 0;
        }
        let last = self.total_pages - 1;
        let current = current.min(last);
        if !self.is_double_page {
            return current.saturating_add_signed(delta).min(last);
        }

        let mut index = self.snap(current);
        for _ in 0..delta.unsigned_abs() {
            let next = if delta > 0 {
                // Leaving the cover is a single step.
                let stride = if index == 0 { 1 } else { 2 };
                self.snap((index + stride).min(last))
            } else {
                // Entering the cover is a single step.
                let stride = if index <= 1 { 1 } else { 2 };
                index.saturating_sub(stride)
            };
            if next == index {
                break;
            }
            index = next;
        }
        index
    }
}

/// Services a reader session depends on, built by the host.
#[derive(Clone)]
pub struct ReaderServices {
    pub index: Arc<ArchiveIndex>,
    pub extractor: MemberExtractor,
    pub decoder: Arc<dyn Decoder>,
    pub access: Arc<dyn AccessPolicy>,
}

impl ReaderServices {
    /// Default services: the configured archive tool, the `image` crate
    /// decoder and plain filesystem access. Without a resolvable tool,
    /// folders and single images still open; archives fail when listed.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let tool = match settings.tool() {
            Ok(tool) => tool,
            Err(e) => {
                tracing::warn!(error = %e, "Archive tool not found; archives will not open");
                ArchiveTool::new("unzip").with_encrypted_exit_code(settings.encrypted_exit_code)
            }
        };
        Ok(Self {
            index: Arc::new(ArchiveIndex::new(tool.clone())),
            extractor: MemberExtractor::new(tool, settings.extract_limits())
                .with_scratch_dir(settings.scratch_dir.clone()),
            decoder: Arc::new(RasterDecoder),
            access: Arc::new(FilesystemAccess),
        })
    }
}

/// Upper bounds for values read from the settings file.
const MAX_CACHE_RADIUS: usize = 64;
const MAX_PREFETCH_WORKERS: usize = 32;

/// One reading session: the open document, the cursor and the pages on screen.
pub struct ReaderState {
    index: Arc<ArchiveIndex>,
    access: Arc<dyn AccessPolicy>,
    loader: PageLoader,
    source: Option<Arc<ContentSource>>,
    current_page_index: usize,
    current_images: Vec<(usize, Arc<DecodedImage>)>,
    is_double_page: bool,
    reading_direction: ReadingDirection,
    phase: watch::Sender<ReaderPhase>,
}

impl ReaderState {
    pub fn new(services: ReaderServices, settings: &Settings) -> Result<Self> {
        let radius = settings.cache_radius.min(MAX_CACHE_RADIUS);
        let workers = settings.prefetch_workers.min(MAX_PREFETCH_WORKERS);
        if radius != settings.cache_radius || workers != settings.prefetch_workers {
            tracing::warn!(radius, workers, "Clamped cache radius or prefetch workers");
        }
        let fetcher = PageFetcher::new(
            services.extractor,
            services.decoder,
            services.access.clone(),
        );
        // Window plus a spread partner on either side.
        let cache = create_shared_cache(radius.saturating_mul(2).saturating_add(3));
        let loader = PageLoader::new(fetcher, cache, radius, workers)?;
        let (phase, _) = watch::channel(ReaderPhase::Idle);
        Ok(Self {
            index: services.index,
            access: services.access,
            loader,
            source: None,
            current_page_index: 0,
            current_images: Vec::new(),
            is_double_page: settings.is_double_page,
            reading_direction: settings.reading_direction,
            phase,
        })
    }

    pub fn phase(&self) -> ReaderPhase {
        self.phase.borrow().clone()
    }

    /// Phase changes for the host, newest value only.
    pub fn subscribe(&self) -> watch::Receiver<ReaderPhase> {
        self.phase.subscribe()
    }

    pub fn source(&self) -> Option<&Arc<ContentSource>> {
        self.source.as_ref()
    }

    pub fn total_pages(&self) -> usize {
        self.source.as_ref().map_or(0, |s| s.total_pages())
    }

    pub fn current_page_index(&self) -> usize {
        self.current_page_index
    }

    pub fn is_double_page(&self) -> bool {
        self.is_double_page
    }

    pub fn reading_direction(&self) -> ReadingDirection {
        self.reading_direction
    }

    pub fn cache_stats(&self) -> CacheStats {
        lock_cache(self.loader.cache()).stats()
    }

    pub fn cached_pages(&self) -> Vec<usize> {
        lock_cache(self.loader.cache()).indices()
    }

    pub fn page_label(&self, index: usize) -> Result<String> {
        self.source.as_ref().ok_or(PagerError::NoContent)?.label(index)
    }

    fn spread(&self) -> Spread {
        Spread::new(self.total_pages(), self.is_double_page)
    }

    /// Indices on screen, left to right.
    pub fn displayed_pages(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.current_images.iter().map(|(i, _)| *i).collect();
        if self.reading_direction == ReadingDirection::RightToLeft {
            pages.reverse();
        }
        pages
    }

    /// Images on screen, left to right.
    pub fn current_images(&self) -> Vec<Arc<DecodedImage>> {
        let mut images: Vec<Arc<DecodedImage>> =
            self.current_images.iter().map(|(_, img)| img.clone()).collect();
        if self.reading_direction == ReadingDirection::RightToLeft {
            images.reverse();
        }
        images
    }

    pub fn set_reading_direction(&mut self, direction: ReadingDirection) {
        self.reading_direction = direction;
    }

    fn set_phase(&self, phase: ReaderPhase) {
        self.phase.send_replace(phase);
    }

    /// Publishes `err` as the error phase and hands it back to the caller.
    fn fail(&self, err: PagerError) -> PagerError {
        tracing::warn!(error = %err, page = self.current_page_index, "Reader error");
        self.set_phase(ReaderPhase::Error(err.to_string()));
        err
    }

    /// Opens `path` and shows its first page.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn load_content(&mut self, path: &Path) -> Result<()> {
        self.loader.reset().await;
        self.source = None;
        self.current_images.clear();
        self.current_page_index = 0;
        self.set_phase(ReaderPhase::Loading);

        let source = match ContentSource::open(path, &self.index, self.access.as_ref()).await {
            Ok(source) => Arc::new(source),
            Err(e) => return Err(self.fail(e)),
        };
        self.source = Some(source);
        self.show(0).await
    }

    /// Forgets the cached listing of the open archive and opens it again.
    pub async fn rescan(&mut self) -> Result<()> {
        let source = self.source.clone().ok_or(PagerError::NoContent)?;
        if let ContentSource::Archive { archive, .. } = source.as_ref() {
            self.index.invalidate(archive).await;
        }
        let path = source.path().to_path_buf();
        self.load_content(&path).await
    }

    /// Moves `delta` spreads (double page) or pages forward or back. A no-op
    /// at either end; on failure the cursor stays where it was.
    pub async fn navigate(&mut self, delta: isize) -> Result<()> {
        if self.source.is_none() {
            return Err(PagerError::NoContent);
        }
        let target = self.spread().step(self.current_page_index, delta);
        if target == self.current_page_index && self.phase() == ReaderPhase::Ready {
            return Ok(());
        }
        self.show(target).await
    }

    /// Lands exactly on `index`, even in the middle of a spread.
    pub async fn jump(&mut self, index: usize) -> Result<()> {
        let source = self.source.as_ref().ok_or(PagerError::NoContent)?;
        let total = source.total_pages();
        if index >= total {
            return Err(PagerError::IndexOutOfRange { index, total });
        }
        self.show(index).await
    }

    /// Flips double-page mode and re-shows the spread at the snapped cursor.
    /// The cursor moves to the snapped index even if decoding then fails.
    pub async fn toggle_double_page(&mut self) -> Result<()> {
        self.is_double_page = !self.is_double_page;
        if self.source.is_none() {
            return Ok(());
        }
        self.current_page_index = self.spread().snap(self.current_page_index);
        self.show(self.current_page_index).await
    }

    /// Shows the current pages again, typically after an error.
    pub async fn retry(&mut self) -> Result<()> {
        if self.source.is_none() {
            return Err(PagerError::NoContent);
        }
        self.show(self.current_page_index).await
    }

    /// Ends the session: prefetch is cancelled and awaited before the cache
    /// is dropped.
    pub async fn close(&mut self) {
        self.loader.reset().await;
        self.source = None;
        self.current_images.clear();
        self.current_page_index = 0;
        self.set_phase(ReaderPhase::Idle);
    }

    async fn show(&mut self, target: usize) -> Result<()> {
        let source = self.source.clone().ok_or(PagerError::NoContent)?;
        let pages = self.spread().pages_at(target);
        self.set_phase(ReaderPhase::Loading);

        match self.loader.show(&source, target, &pages).await {
            Ok(images) => {
                self.current_page_index = target;
                self.current_images = pages.into_iter().zip(images).collect();
                self.set_phase(ReaderPhase::Ready);
                Ok(())
            }
            Err(e) => {
                self.loader.refresh_prefetch(&source, self.current_page_index).await;
                Err(self.fail(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_double_page_forward_and_back() {
        let spread = Spread::new(10, true);
        let mut index = 0;
        let mut forward = Vec::new();
        for _ in 0..6 {
            index = spread.step(index, 1);
            forward.push(index);
        }
        assert_eq!(forward, vec![1, 3, 5, 7, 9, 9]);

        let mut back = Vec::new();
        for _ in 0..6 {
            index = spread.step(index, -1);
            back.push(index);
        }
        assert_eq!(back, vec![7, 5, 3, 1, 0, 0]);
    }

    #[rstest]
    #[case(10, true, 0, vec![0])]
    #[case(10, true, 1, vec![1, 2])]
    #[case(10, true, 9, vec![9])]
    #[case(10, true, 4, vec![4, 5])]
    #[case(9, true, 7, vec![7, 8])]
    #[case(10, false, 3, vec![3])]
    #[case(0, true, 0, vec![])]
    fn test_pages_at(
        #[case] total: usize,
        #[case] double: bool,
        #[case] index: usize,
        #[case] expected: Vec<usize>,
    ) {
        assert_eq!(Spread::new(total, double).pages_at(index), expected);
    }

    #[rstest]
    #[case(10, false, 0, 1, 1)]
    #[case(10, false, 9, 1, 9)]
    #[case(10, false, 0, -1, 0)]
    #[case(10, false, 2, 10, 9)]
    #[case(10, true, 0, 3, 5)]
    #[case(10, true, 9, -10, 0)]
    #[case(10, true, 4, 1, 5)]
    #[case(10, true, 4, -1, 1)]
    #[case(9, true, 7, 1, 7)]
    #[case(2, true, 0, 1, 1)]
    #[case(1, true, 0, 1, 0)]
    fn test_step(
        #[case] total: usize,
        #[case] double: bool,
        #[case] current: usize,
        #[case] delta: isize,
        #[case] expected: usize,
    ) {
        assert_eq!(Spread::new(total, double).step(current, delta), expected);
    }

    #[rstest]
    #[case(true, 0, 0)]
    #[case(true, 1, 1)]
    #[case(true, 4, 3)]
    #[case(false, 4, 4)]
    fn test_snap(#[case] double: bool, #[case] index: usize, #[case] expected: usize) {
        assert_eq!(Spread::new(10, double).snap(index), expected);
    }

    #[test]
    fn test_oversized_settings_are_clamped() {
        let settings = Settings {
            cache_radius: usize::MAX,
            prefetch_workers: usize::MAX,
            ..Settings::default()
        };
        let tool = ArchiveTool::new("unzip");
        let services = ReaderServices {
            index: Arc::new(ArchiveIndex::new(tool.clone())),
            extractor: MemberExtractor::new(tool, settings.extract_limits()),
            decoder: Arc::new(RasterDecoder),
            access: Arc::new(FilesystemAccess),
        };
        let mut reader = ReaderState::new(services, &settings).unwrap();
        assert_eq!(reader.loader.prefetcher().radius(), MAX_CACHE_RADIUS);
        assert_eq!(reader.total_pages(), 0);
    }

    #[cfg(unix)]
    mod session {
        use super::*;
        use crate::image::testing::{fake_tool, listing, png_bytes};
        use crate::image::tool::ExtractLimits;

        /// An archive of `pages` PNG members; members listed in `broken` fail to extract.
        fn services(
            dir: &Path,
            pages: usize,
            broken: &[usize],
        ) -> (ReaderServices, std::path::PathBuf) {
            let archive = dir.join("book.cbz");
            std::fs::write(&archive, b"zip").unwrap();
            let names: Vec<String> = (0..pages).map(|i| format!("p{i}.png")).collect();
            let rows: Vec<(u64, &str)> = names.iter().map(|n| (10, n.as_str())).collect();
            let listing_file = dir.join("listing.txt");
            std::fs::write(&listing_file, listing(&rows)).unwrap();
            let png = dir.join("page.png");
            std::fs::write(&png, png_bytes(2, 2)).unwrap();

            let broken_cases: String = broken
                .iter()
                .map(|i| format!("  p{i}.png) exit 11 ;;\n"))
                .collect();
            let body = format!(
                "if [ \"$1\" = \"-l\" ]; then cat '{listing}'; exit 0; fi\n\
                 case \"$3\" in\n{broken_cases}  *) cat '{png}' ;;\nesac",
                listing = listing_file.display(),
                png = png.display(),
            );
            let tool = fake_tool(dir, &body);
            let services = ReaderServices {
                index: Arc::new(ArchiveIndex::new(tool.clone())),
                extractor: MemberExtractor::new(tool, ExtractLimits::default()),
                decoder: Arc::new(RasterDecoder),
                access: Arc::new(FilesystemAccess),
            };
            (services, archive)
        }

        fn settings(double: bool) -> Settings {
            Settings {
                is_double_page: double,
                prefetch_workers: 2,
                ..Settings::default()
            }
        }

        #[tokio::test]
        async fn test_load_and_navigate() {
            let dir = tempfile::tempdir().unwrap();
            let (services, archive) = services(dir.path(), 10, &[]);
            let mut reader = ReaderState::new(services, &settings(true)).unwrap();
            let mut phases = reader.subscribe();
            assert_eq!(reader.phase(), ReaderPhase::Idle);

            reader.load_content(&archive).await.unwrap();
            assert_eq!(reader.phase(), ReaderPhase::Ready);
            assert!(phases.has_changed().unwrap());
            assert_eq!(*phases.borrow_and_update(), ReaderPhase::Ready);
            assert_eq!(reader.total_pages(), 10);
            assert_eq!(reader.displayed_pages(), vec![0]);
            assert_eq!(reader.page_label(0).unwrap(), "p0.png");

            reader.navigate(1).await.unwrap();
            assert_eq!(reader.current_page_index(), 1);
            assert_eq!(reader.displayed_pages(), vec![1, 2]);
            assert_eq!(reader.current_images().len(), 2);

            reader.set_reading_direction(ReadingDirection::RightToLeft);
            assert_eq!(reader.displayed_pages(), vec![2, 1]);

            reader.navigate(-1).await.unwrap();
            assert_eq!(reader.current_page_index(), 0);
            reader.navigate(-1).await.unwrap();
            assert_eq!(reader.current_page_index(), 0);

            reader.close().await;
            assert_eq!(reader.phase(), ReaderPhase::Idle);
            assert!(reader.cached_pages().is_empty());
            assert!(matches!(reader.navigate(1).await, Err(PagerError::NoContent)));
        }

        #[tokio::test]
        async fn test_failed_page_keeps_cursor() {
            let dir = tempfile::tempdir().unwrap();
            let (services, archive) = services(dir.path(), 5, &[2]);
            let mut reader = ReaderState::new(services, &settings(false)).unwrap();
            reader.load_content(&archive).await.unwrap();
            reader.navigate(1).await.unwrap();
            assert_eq!(reader.current_page_index(), 1);

            let err = reader.navigate(1).await.unwrap_err();
            assert!(err.is_page_local());
            assert_eq!(reader.current_page_index(), 1);
            assert!(matches!(
                reader.phase(),
                ReaderPhase::Error(message) if message.contains("code 11")
            ));
            assert_eq!(reader.displayed_pages(), vec![1]);

            // Jumping past the broken page recovers.
            reader.jump(3).await.unwrap();
            assert_eq!(reader.phase(), ReaderPhase::Ready);
            assert_eq!(reader.current_page_index(), 3);
        }

        #[tokio::test]
        async fn test_toggle_double_page_snaps_cursor() {
            let dir = tempfile::tempdir().unwrap();
            let (services, archive) = services(dir.path(), 10, &[]);
            let mut reader = ReaderState::new(services, &settings(false)).unwrap();
            reader.load_content(&archive).await.unwrap();
            reader.jump(4).await.unwrap();

            reader.toggle_double_page().await.unwrap();
            assert!(reader.is_double_page());
            assert_eq!(reader.current_page_index(), 3);
            assert_eq!(reader.displayed_pages(), vec![3, 4]);

            reader.toggle_double_page().await.unwrap();
            assert_eq!(reader.displayed_pages(), vec![3]);
        }

        #[tokio::test]
        async fn test_gallery_jump_lands_mid_spread() {
            let dir = tempfile::tempdir().unwrap();
            let (services, archive) = services(dir.path(), 10, &[]);
            let mut reader = ReaderState::new(services, &settings(true)).unwrap();
            reader.load_content(&archive).await.unwrap();

            reader.jump(4).await.unwrap();
            assert_eq!(reader.displayed_pages(), vec![4, 5]);
            reader.navigate(1).await.unwrap();
            assert_eq!(reader.current_page_index(), 5);
            assert!(matches!(reader.jump(10).await, Err(PagerError::IndexOutOfRange { .. })));
            assert_eq!(reader.phase(), ReaderPhase::Ready);
        }

        #[tokio::test]
        async fn test_load_failure_is_error_phase() {
            let dir = tempfile::tempdir().unwrap();
            let (services, _) = services(dir.path(), 3, &[]);
            let mut reader = ReaderState::new(services, &settings(false)).unwrap();
            let err = reader.load_content(&dir.path().join("missing")).await.unwrap_err();
            assert!(matches!(err, PagerError::NotFound(_)));
            assert!(matches!(reader.phase(), ReaderPhase::Error(_)));
            assert_eq!(reader.total_pages(), 0);
        }

        #[tokio::test]
        async fn test_first_page_failure_is_error_phase() {
            let dir = tempfile::tempdir().unwrap();
            let (services, archive) = services(dir.path(), 3, &[0]);
            let mut reader = ReaderState::new(services, &settings(false)).unwrap();
            assert!(reader.load_content(&archive).await.is_err());
            assert!(matches!(reader.phase(), ReaderPhase::Error(_)));
            // The source stays open; the reader can move past the broken cover.
            reader.navigate(1).await.unwrap();
            assert_eq!(reader.current_page_index(), 1);
        }

        #[tokio::test]
        async fn test_rescan_lists_again() {
            let dir = tempfile::tempdir().unwrap();
            let (services, archive) = services(dir.path(), 3, &[]);
            let index = services.index.clone();
            let mut reader = ReaderState::new(services, &settings(false)).unwrap();
            reader.load_content(&archive).await.unwrap();
            reader.navigate(2).await.unwrap();

            let names: Vec<String> = (0..5).map(|i| format!("p{i}.png")).collect();
            let rows: Vec<(u64, &str)> = names.iter().map(|n| (10, n.as_str())).collect();
            std::fs::write(dir.path().join("listing.txt"), listing(&rows)).unwrap();
            assert_eq!(index.list(&archive).await.unwrap().len(), 3);

            reader.rescan().await.unwrap();
            assert_eq!(reader.total_pages(), 5);
            assert_eq!(reader.current_page_index(), 0);
        }
    }
}
