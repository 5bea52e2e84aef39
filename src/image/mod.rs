pub mod access;
pub mod archive;
pub mod cache;
pub mod decoder;
pub mod extract;
pub mod loader;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::{PagerError, Result};
use crate::image::access::AccessPolicy;
use crate::image::archive::ArchiveIndex;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: [&str; 9] =
    ["jpg", "jpeg", "png", "webp", "heic", "tiff", "bmp", "gif", "avif"];
pub const ARCHIVE_EXTENSIONS: [&str; 2] = ["zip", "cbz"];
/// Archives recognised by name but not readable by the archive tool.
const FOREIGN_ARCHIVE_EXTENSIONS: [&str; 6] = ["rar", "cbr", "7z", "cb7", "tar", "cbt"];

fn extension_lower(path: &Path) -> Option<String> {
    path.extension().and_then(|s| s.to_str()).map(|s| s.to_lowercase())
}

pub fn is_supported_image(path: &Path) -> bool {
    extension_lower(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_supported_archive(path: &Path) -> bool {
    extension_lower(path).is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
}

/// Case-insensitive natural order ("page2" before "page10"), with a
/// byte-wise tie break so names differing only in case sort stably.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natord::compare_ignore_case(a, b).then_with(|| a.cmp(b))
}

pub fn sort_natural(names: &mut [String]) {
    names.sort_by(|a, b| natural_cmp(a, b));
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Where a page's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PageReference {
    File(PathBuf),
    Member { archive: PathBuf, member: String },
}

/// The pages of one opened document. Immutable once built; reopening a path
/// builds a new source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    SingleImage(PathBuf),
    Folder { root: PathBuf, pages: Arc<[PathBuf]> },
    Archive { archive: PathBuf, members: Arc<[String]> },
}

impl ContentSource {
    /// Classifies `path` and lists its pages.
    pub async fn open(
        path: &Path,
        index: &ArchiveIndex,
        access: &dyn AccessPolicy,
    ) -> Result<Self> {
        access.reacquire(path)?;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| PagerError::from_io(e, path.to_path_buf()))?;

        if meta.is_dir() {
            let root = path.to_path_buf();
            let pages = tokio::task::spawn_blocking(move || list_folder(&root))
                .await
                .map_err(|e| PagerError::Io(std::io::Error::other(e)))?;
            if pages.is_empty() {
                return Err(PagerError::NoImagesFound(path.to_path_buf()));
            }
            tracing::info!(path = %path.display(), pages = pages.len(), "Opened folder");
            return Ok(Self::Folder {
                root: path.to_path_buf(),
                pages: pages.into(),
            });
        }

        if is_supported_archive(path) {
            let members = index.list(path).await?;
            if members.is_empty() {
                return Err(PagerError::NoImagesFound(path.to_path_buf()));
            }
            tracing::info!(path = %path.display(), pages = members.len(), "Opened archive");
            return Ok(Self::from_members(path, members));
        }

        let foreign = extension_lower(path)
            .is_some_and(|ext| FOREIGN_ARCHIVE_EXTENSIONS.contains(&ext.as_str()));
        if foreign || !is_supported_image(path) {
            return Err(PagerError::UnsupportedFormat(path.to_path_buf()));
        }
        tracing::info!(path = %path.display(), "Opened single image");
        Ok(Self::SingleImage(path.to_path_buf()))
    }

    /// An archive source over an already listed, already sorted member set.
    pub fn from_members(archive: impl Into<PathBuf>, members: impl Into<Arc<[String]>>) -> Self {
        Self::Archive {
            archive: archive.into(),
            members: members.into(),
        }
    }

    /// The path that was opened.
    pub fn path(&self) -> &Path {
        match self {
            Self::SingleImage(path) => path,
            Self::Folder { root, .. } => root,
            Self::Archive { archive, .. } => archive,
        }
    }

    pub fn total_pages(&self) -> usize {
        match self {
            Self::SingleImage(_) => 1,
            Self::Folder { pages, .. } => pages.len(),
            Self::Archive { members, .. } => members.len(),
        }
    }

    fn check(&self, index: usize) -> Result<()> {
        let total = self.total_pages();
        if index >= total {
            return Err(PagerError::IndexOutOfRange { index, total });
        }
        Ok(())
    }

    pub fn reference(&self, index: usize) -> Result<PageReference> {
        self.check(index)?;
        Ok(match self {
            Self::SingleImage(path) => PageReference::File(path.clone()),
            Self::Folder { pages, .. } => PageReference::File(pages[index].clone()),
            Self::Archive { archive, members } => PageReference::Member {
                archive: archive.clone(),
                member: members[index].clone(),
            },
        })
    }

    /// Human readable page name: the file name, or the member name inside an archive.
    pub fn label(&self, index: usize) -> Result<String> {
        self.check(index)?;
        Ok(match self {
            Self::SingleImage(path) => file_name_of(path),
            Self::Folder { pages, .. } => file_name_of(&pages[index]),
            Self::Archive { members, .. } => members[index].clone(),
        })
    }

    pub fn labels(&self) -> Vec<String> {
        (0..self.total_pages()).filter_map(|i| self.label(i).ok()).collect()
    }
}

fn list_folder(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable folder entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_supported_image(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort_by(|a, b| natural_cmp(&file_name_of(a), &file_name_of(b)));
    files
}
