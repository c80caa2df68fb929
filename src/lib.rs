//! Keeps yt-dlp, FFmpeg and a JavaScript runtime installed from their GitHub releases
//! and runs yt-dlp downloads with parsed progress reporting.

pub mod error;
pub mod tooling;

pub use error::{
    DownloadError, InstallError, LaunchError, ResolutionError, SettingsError, TransferError,
};
pub use tooling::download::{
    normalize_target, ContainerFormat, ContentType, DownloadEvent, DownloadOptions,
    DownloadOrchestrator, DownloadState, Quality, RunArguments, StatusSink,
};
pub use tooling::install::{
    Dependency, DependencyInstaller, InstallOutcome, InstallResult, InstallStage, PayloadLayout,
};
pub use tooling::process::{OutputStream, ProcessExit, ProcessRunner, RunningProcess};
pub use tooling::progress::{parse_progress_line, project_line, LineProjection, ProgressSample};
pub use tooling::releases::{
    Asset, AssetMatcher, ChecksumSource, GithubReleases, Release, ReleaseQuery, ReleaseSource,
    ResolvedRelease,
};
pub use tooling::runtime::{
    load_settings, save_settings, AppPaths, ArtifactSource, HttpFetcher, Settings, UrlPolicy,
};
pub use tooling::toolchain::{
    Catalogue, DependencyReport, Platform, RuntimeKind, RuntimeLocator, ScriptRuntime,
    ToolSource, ToolStatus, Toolchain,
};
