//! External archive tool invocation.
//!
//! Listing and extraction shell out to an Info-ZIP compatible `unzip`.
//! Everything the core knows about the tool lives here: the program path,
//! the argv for each operation and the exit code reserved for encrypted
//! archives. A native archive library could stand in for the tool as long
//! as it honours the same list/extract contract.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTool {
    program: PathBuf,
    leading_args: Vec<OsString>,
    encrypted_exit_code: i32,
}

impl ArchiveTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            encrypted_exit_code: 82,
        }
    }

    /// Arguments placed before every operation's argv, for multi-call
    /// binaries such as `busybox unzip`.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_encrypted_exit_code(mut self, code: i32) -> Self {
        self.encrypted_exit_code = code;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn encrypted_exit_code(&self) -> i32 {
        self.encrypted_exit_code
    }

    /// `unzip -l <archive>`
    pub fn list_args(&self, archive: &Path) -> Vec<OsString> {
        vec!["-l".into(), archive.as_os_str().to_owned()]
    }

    /// `unzip -p <archive> <member>`, member escaped so it is matched literally.
    pub fn extract_args(&self, archive: &Path, member: &str) -> Vec<OsString> {
        vec![
            "-p".into(),
            archive.as_os_str().to_owned(),
            escape_member(member).into(),
        ]
    }

    /// Builds a command with piped output and no stdin. The child is killed
    /// if its handle is dropped before it exits.
    pub(crate) fn command(&self, args: Vec<OsString>) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Per-call bounds applied to every extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    pub max_bytes: u64,
    pub timeout: Duration,
    pub chunk_size: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_bytes: 200 * 1024 * 1024,
            timeout: Duration::from_secs(10),
            chunk_size: 128 * 1024,
        }
    }
}

/// `unzip` treats member arguments as wildcard patterns.
fn escape_member(member: &str) -> String {
    let mut escaped = String::with_capacity(member.len());
    for c in member.chars() {
        if matches!(c, '[' | ']' | '*' | '?' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("page01.png", "page01.png")]
    #[case("ch1/[scan] 01.jpg", "ch1/\\[scan\\] 01.jpg")]
    #[case("what?.png", "what\\?.png")]
    #[case("star*.png", "star\\*.png")]
    fn test_escape_member(#[case] member: &str, #[case] expected: &str) {
        assert_eq!(escape_member(member), expected);
    }

    #[test]
    fn test_argv() {
        let tool = ArchiveTool::new("/usr/bin/unzip");
        let archive = Path::new("/books/a.cbz");
        assert_eq!(
            tool.list_args(archive),
            vec![OsString::from("-l"), OsString::from("/books/a.cbz")]
        );
        assert_eq!(
            tool.extract_args(archive, "01.png"),
            vec![OsString::from("-p"), OsString::from("/books/a.cbz"), OsString::from("01.png")]
        );
        assert_eq!(tool.encrypted_exit_code(), 82);
        assert_eq!(tool.with_encrypted_exit_code(5).encrypted_exit_code(), 5);
    }

    #[test]
    fn test_leading_args_come_first() {
        let tool = ArchiveTool::new("busybox").with_leading_args(["unzip"]);
        let command = tool.command(tool.list_args(Path::new("a.zip")));
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["unzip", "-l", "a.zip"]);
    }
}
