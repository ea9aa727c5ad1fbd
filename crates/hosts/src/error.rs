use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Persistent until the process is re-launched with enough privilege;
    /// callers must not retry in a hot loop.
    #[error("permission denied updating {} (re-run with elevated privileges)", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("hosts table i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn from_io(source: std::io::Error, path: &Path) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// True when the failure will not clear without operator action.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
