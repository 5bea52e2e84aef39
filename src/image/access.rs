use crate::error::{PagerError, Result};
use std::path::Path;

/// Grants the core access to a path before it is read.
///
/// Hosts that hold sandbox grants (bookmarks, portals) re-acquire them
/// here and fail with [`PagerError::AccessDenied`] once a grant is gone.
pub trait AccessPolicy: Send + Sync + 'static {
    fn reacquire(&self, path: &Path) -> Result<()>;
}

/// Plain filesystem permissions; no grants to refresh.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemAccess;

impl AccessPolicy for FilesystemAccess {
    fn reacquire(&self, path: &Path) -> Result<()> {
        std::fs::metadata(path)
            .map(|_| ())
            .map_err(|e| PagerError::from_io(e, path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = FilesystemAccess.reacquire(&dir.path().join("gone.png")).unwrap_err();
        assert!(matches!(err, PagerError::NotFound(_)));
        assert!(FilesystemAccess.reacquire(dir.path()).is_ok());
    }
}
