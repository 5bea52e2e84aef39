//! Archive member listing.
//!
//! Lists the image members of an archive through the archive tool and keeps
//! the sorted result until it is invalidated or the archive changes on disk.

use crate::error::IndexError;
use crate::image::tool::ArchiveTool;
use crate::image::{is_supported_image, sort_natural};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::instrument;

/// `   123456  03-14-2024 09:26   dir/page01.png`
static LISTING_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s+(\d{2}-\d{2}-\d{4}|\d{4}-\d{2}-\d{2})\s+(\d{2}:\d{2})\s+(.+?)\s*$")
        .expect("listing grammar is a valid regex")
});

/// One parsed row of a member listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub size: u64,
    pub date: String,
    pub time: String,
    pub name: String,
}

impl ListingRow {
    /// Parses a single line; anything that is not a member row (headers,
    /// separators, totals, blank lines) yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let captures = LISTING_ROW.captures(line)?;
        Some(Self {
            size: captures[1].parse().ok()?,
            date: captures[2].to_string(),
            time: captures[3].to_string(),
            name: captures[4].to_string(),
        })
    }

    fn is_image_member(&self) -> bool {
        if self.name.ends_with('/') || self.name.split('/').any(|part| part == "__MACOSX") {
            return false;
        }
        let file_name = self.name.rsplit('/').next().unwrap_or(&self.name);
        !file_name.starts_with("._") && is_supported_image(Path::new(file_name))
    }
}

/// Parses a full listing, skipping every line that does not match the row grammar.
pub fn parse_listing(text: &str) -> Vec<ListingRow> {
    text.lines().filter_map(ListingRow::parse).collect()
}

#[derive(Debug)]
struct CachedListing {
    modified: Option<SystemTime>,
    members: Arc<[String]>,
}

/// Cache of sorted image member names, keyed by archive path.
///
/// The map lock is held across a listing so an `invalidate` can never be
/// overtaken by a listing that started before it.
#[derive(Debug)]
pub struct ArchiveIndex {
    tool: ArchiveTool,
    entries: Mutex<HashMap<PathBuf, CachedListing>>,
}

impl ArchiveIndex {
    pub fn new(tool: ArchiveTool) -> Self {
        Self {
            tool,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the naturally sorted image members of `archive`. The list may
    /// be empty; deciding whether that is an error is up to the caller.
    #[instrument(skip(self, archive), fields(archive = %archive.display()))]
    pub async fn list(&self, archive: &Path) -> Result<Arc<[String]>, IndexError> {
        let modified = tokio::fs::metadata(archive)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok());

        let mut entries = self.entries.lock().await;
        if let Some(cached) = entries.get(archive) {
            if cached.modified == modified {
                return Ok(cached.members.clone());
            }
            tracing::info!("Archive changed on disk; listing again");
        }

        let members: Arc<[String]> = self.run_listing(archive).await?.into();
        tracing::debug!(members = members.len(), "Archive listed");
        entries.insert(
            archive.to_path_buf(),
            CachedListing {
                modified,
                members: members.clone(),
            },
        );
        Ok(members)
    }

    /// Drops the cached listing for `archive`; the next `list` runs the tool again.
    pub async fn invalidate(&self, archive: &Path) {
        if self.entries.lock().await.remove(archive).is_some() {
            tracing::debug!(archive = %archive.display(), "Archive listing invalidated");
        }
    }

    /// Drops every cached listing.
    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }

    async fn run_listing(&self, archive: &Path) -> Result<Vec<String>, IndexError> {
        let output = self
            .tool
            .command(self.tool.list_args(archive))
            .output()
            .await
            .map_err(|source| IndexError::Spawn {
                program: self.tool.program().to_owned(),
                source,
            })?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            tracing::warn!(
                code,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Archive listing failed"
            );
            return Err(IndexError::ListingFailed(code));
        }

        let text = String::from_utf8(output.stdout).map_err(|_| IndexError::InvalidArchive)?;
        let mut members: Vec<String> = parse_listing(&text)
            .into_iter()
            .filter(ListingRow::is_image_member)
            .map(|row| row.name)
            .collect();
        sort_natural(&mut members);
        Ok(members)
    }
}
