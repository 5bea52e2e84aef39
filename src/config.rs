use crate::error::{PagerError, Result};
use crate::image::tool::{ArchiveTool, ExtractLimits};
use crate::state::ReadingDirection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub is_double_page: bool,
    pub reading_direction: ReadingDirection,
    pub cache_radius: usize,
    pub prefetch_workers: usize,
    pub max_member_bytes: u64,
    pub extract_timeout_ms: u64,
    pub read_chunk_bytes: usize,
    pub encrypted_exit_code: i32,
    pub unzip_path: Option<PathBuf>,
    /// Where oversized members are spilled; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            is_double_page: false,
            reading_direction: ReadingDirection::LeftToRight,
            cache_radius: 2,
            prefetch_workers: 4,
            max_member_bytes: 200 * 1024 * 1024,
            extract_timeout_ms: 10_000,
            read_chunk_bytes: 128 * 1024,
            // Info-ZIP: "no files found due to bad decryption password"
            encrypted_exit_code: 82,
            unzip_path: None,
            scratch_dir: None,
        }
    }
}

impl Settings {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Malformed settings file; using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    "Settings file not readable; using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    pub fn extract_limits(&self) -> ExtractLimits {
        ExtractLimits {
            max_bytes: self.max_member_bytes,
            timeout: Duration::from_millis(self.extract_timeout_ms),
            chunk_size: self.read_chunk_bytes.max(1),
        }
    }

    /// Resolves the archive tool, searching `PATH` for `unzip` when no
    /// explicit program is configured.
    pub fn tool(&self) -> Result<ArchiveTool> {
        let program = match &self.unzip_path {
            Some(path) => path.clone(),
            None => {
                which::which("unzip").map_err(|e| PagerError::ToolUnavailable(e.to_string()))?
            }
        };
        Ok(ArchiveTool::new(program).with_encrypted_exit_code(self.encrypted_exit_code))
    }
}
