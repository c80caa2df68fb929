// Error taxonomy shared by the installer, the process runner and the download orchestrator.
use std::io;
use std::path::PathBuf;

/// Failure while streaming a remote artifact or text document.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("refused download source {url}: {reason}")]
    Rejected { url: String, reason: String },

    #[error("HTTP {code} from {url}")]
    Status { code: u16, url: String },

    #[error("network error while fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("I/O error while fetching {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },
}

/// Failure while looking up a release. An empty lookup result is not an error.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("release listing request failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("failed to parse release listing from {url}: {message}")]
    Parse { url: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("no published build of {dependency} matches this platform")]
    NoMatchingAsset { dependency: String },

    #[error("managed {dependency} builds are not available on this platform")]
    Unsupported { dependency: String },

    #[error("failed to unpack archive: {0}")]
    Archive(String),

    #[error("unexpected archive layout: {0}")]
    Layout(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl InstallError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// The external executable could not be started.
#[derive(Debug, thiserror::Error)]
#[error("failed to start {}: {source}", program.display())]
pub struct LaunchError {
    pub program: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid link: {0}")]
    InvalidTarget(String),

    #[error("{0} is not available")]
    MissingTool(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Carries the downloader's stderr exactly as it was written.
    #[error("{stderr}")]
    RunFailure { code: Option<i32>, stderr: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Read(#[source] io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to save settings: {0}")]
    Write(#[source] io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
