//! Single-member extraction through the archive tool.
//!
//! Every call spawns its own process and shares nothing with other calls,
//! so a failed extraction can simply be retried. Output is read in fixed
//! size chunks against a byte ceiling; a timer armed at launch kills the
//! process if it outlives the timeout.

use crate::error::ExtractError;
use crate::image::tool::{ArchiveTool, ExtractLimits};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::task::JoinHandle;
use tracing::instrument;

/// Upper bound on the diagnostic text kept from the tool's stderr.
const STDERR_KEEP_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct MemberExtractor {
    tool: ArchiveTool,
    limits: ExtractLimits,
    scratch_dir: Option<PathBuf>,
}

/// A member extracted to disk. The file is removed when this is dropped,
/// whichever way the caller leaves.
#[derive(Debug)]
pub struct ScratchFile {
    file: NamedTempFile,
    len: u64,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

enum Drained {
    Complete(ExitStatus, Vec<u8>),
    OverLimit(u64),
}

impl MemberExtractor {
    pub fn new(tool: ArchiveTool, limits: ExtractLimits) -> Self {
        Self {
            tool,
            limits,
            scratch_dir: None,
        }
    }

    /// Directory for disk-mode scratch files; the system temp dir when unset.
    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    /// Extracts `member` into memory using the configured limits.
    pub async fn extract(&self, archive: &Path, member: &str) -> Result<Vec<u8>, ExtractError> {
        self.extract_with(archive, member, self.limits.max_bytes, self.limits.timeout)
            .await
    }

    #[instrument(skip(self, archive), fields(archive = %archive.display()))]
    pub async fn extract_with(
        &self,
        archive: &Path,
        member: &str,
        max_bytes: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, ExtractError> {
        let mut child = self.spawn(archive, member)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractError::Io(std::io::Error::other("stdout not captured")))?;
        let stderr = spawn_stderr_reader(child.stderr.take());
        let chunk_size = self.limits.chunk_size.max(1);

        let drain = async {
            let mut buffer = Vec::new();
            let mut chunk = vec![0u8; chunk_size];
            loop {
                let read = stdout.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                let total = buffer.len() as u64 + read as u64;
                if total > max_bytes {
                    return Ok::<_, std::io::Error>(Drained::OverLimit(total));
                }
                buffer.extend_from_slice(&chunk[..read]);
            }
            let status = child.wait().await?;
            Ok(Drained::Complete(status, buffer))
        };

        let outcome = tokio::time::timeout(timeout, drain).await;
        let drained = match outcome {
            Ok(result) => result,
            Err(_) => {
                terminate(&mut child, stderr).await;
                tracing::warn!(member, ?timeout, "Extraction timed out; process killed");
                return Err(ExtractError::Timeout(timeout));
            }
        };

        match drained {
            Err(e) => {
                terminate(&mut child, stderr).await;
                Err(ExtractError::Io(e))
            }
            Ok(Drained::OverLimit(read)) => {
                terminate(&mut child, stderr).await;
                tracing::debug!(
                    member,
                    bytes = read,
                    max_bytes,
                    "Member exceeds memory limit; process killed"
                );
                Err(ExtractError::MemoryLimitExceeded(read))
            }
            Ok(Drained::Complete(status, buffer)) => {
                let stderr = stderr.await.unwrap_or_default();
                self.check_exit(status, stderr)?;
                if buffer.is_empty() {
                    return Err(ExtractError::EmptyMember);
                }
                tracing::trace!(member, bytes = buffer.len(), "Member extracted to memory");
                Ok(buffer)
            }
        }
    }

    /// Streams `member` into a scratch file with no byte ceiling; the
    /// timeout still applies. On any error the scratch file is already gone.
    #[instrument(skip(self, archive), fields(archive = %archive.display()))]
    pub async fn extract_to_disk(
        &self,
        archive: &Path,
        member: &str,
    ) -> Result<ScratchFile, ExtractError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("hayate-page-");
        let scratch = match &self.scratch_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let mut output = tokio::fs::File::from_std(scratch.reopen()?);
        let mut child = self.spawn(archive, member)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractError::Io(std::io::Error::other("stdout not captured")))?;
        let stderr = spawn_stderr_reader(child.stderr.take());
        let timeout = self.limits.timeout;
        let mut reader = BufReader::with_capacity(self.limits.chunk_size.max(1), stdout);

        let copy = async {
            let copied = tokio::io::copy_buf(&mut reader, &mut output).await?;
            output.flush().await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, copied))
        };

        let outcome = tokio::time::timeout(timeout, copy).await;
        let (status, copied) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                terminate(&mut child, stderr).await;
                return Err(ExtractError::Io(e));
            }
            Err(_) => {
                terminate(&mut child, stderr).await;
                tracing::warn!(member, ?timeout, "Disk extraction timed out; process killed");
                return Err(ExtractError::Timeout(timeout));
            }
        };

        let stderr = stderr.await.unwrap_or_default();
        self.check_exit(status, stderr)?;
        if copied == 0 {
            return Err(ExtractError::EmptyMember);
        }
        tracing::debug!(
            member,
            bytes = copied,
            scratch = %scratch.path().display(),
            "Member extracted to disk"
        );
        Ok(ScratchFile { file: scratch, len: copied })
    }

    fn spawn(&self, archive: &Path, member: &str) -> Result<Child, ExtractError> {
        self.tool
            .command(self.tool.extract_args(archive, member))
            .spawn()
            .map_err(|source| ExtractError::Spawn {
                program: self.tool.program().to_owned(),
                source,
            })
    }

    fn check_exit(&self, status: ExitStatus, stderr: String) -> Result<(), ExtractError> {
        match status.code() {
            Some(0) => Ok(()),
            Some(code) if code == self.tool.encrypted_exit_code() => {
                Err(ExtractError::EncryptedArchive)
            }
            Some(code) => Err(ExtractError::NonZeroExit { code, stderr }),
            // Terminated by a signal
            None => Err(ExtractError::NonZeroExit { code: -1, stderr }),
        }
    }
}

fn spawn_stderr_reader(stderr: Option<ChildStderr>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let Some(mut stderr) = stderr else {
            return String::new();
        };
        let mut kept = Vec::new();
        let mut chunk = [0u8; 4096];
        while let Ok(read) = stderr.read(&mut chunk).await {
            if read == 0 {
                break;
            }
            let room = STDERR_KEEP_BYTES.saturating_sub(kept.len());
            kept.extend_from_slice(&chunk[..read.min(room)]);
        }
        String::from_utf8_lossy(&kept).trim().to_string()
    })
}

async fn terminate(child: &mut Child, stderr: JoinHandle<String>) {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Archive tool already exited");
    }
    stderr.abort();
}
