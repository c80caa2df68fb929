// Concrete dependency catalogue, script runtime lookup and the bootstrap/update workflows.
use super::*;
use std::ffi::{OsStr, OsString};

pub const YTDLP_LATEST_URL: &str = "https://api.github.com/repos/yt-dlp/yt-dlp/releases/latest";
pub const DENO_LATEST_URL: &str = "https://api.github.com/repos/denoland/deno/releases/latest";
pub const FFMPEG_RELEASES_URL: &str = "https://api.github.com/repos/BtbN/FFmpeg-Builds/releases";
const FFMPEG_TAG_PREFIX: &str = "autobuild-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    pub fn executable(&self, name: &str) -> String {
        if self.os == "windows" {
            format!("{name}.exe")
        } else {
            name.to_string()
        }
    }

    pub fn ytdlp_asset(&self) -> Option<&'static str> {
        match (self.os, self.arch) {
            ("windows", "x86_64") => Some("yt-dlp.exe"),
            ("macos", _) => Some("yt-dlp_macos"),
            ("linux", "x86_64") => Some("yt-dlp_linux"),
            ("linux", "aarch64") => Some("yt-dlp_linux_aarch64"),
            _ => None,
        }
    }

    pub fn deno_target(&self) -> Option<&'static str> {
        match (self.os, self.arch) {
            ("windows", "x86_64") => Some("x86_64-pc-windows-msvc"),
            ("macos", "x86_64") => Some("x86_64-apple-darwin"),
            ("macos", "aarch64") => Some("aarch64-apple-darwin"),
            ("linux", "x86_64") => Some("x86_64-unknown-linux-gnu"),
            ("linux", "aarch64") => Some("aarch64-unknown-linux-gnu"),
            _ => None,
        }
    }

    /// Managed FFmpeg is only published as a zip for 64-bit Windows.
    pub fn ffmpeg_asset_needle(&self) -> Option<&'static str> {
        match (self.os, self.arch) {
            ("windows", "x86_64") => Some("win64-gpl-shared"),
            _ => None,
        }
    }
}

/// The managed dependencies for one tools directory.
#[derive(Debug, Clone)]
pub struct Catalogue {
    pub ytdlp: Dependency,
    pub deno: Dependency,
    pub ffmpeg: Dependency,
}

impl Catalogue {
    pub fn new(tools_dir: &Path, platform: Platform) -> Self {
        let ytdlp = Dependency {
            name: "yt-dlp".to_string(),
            install_path: tools_dir.join(platform.executable("yt-dlp")),
            layout: PayloadLayout::RawBinary,
            release: platform.ytdlp_asset().map(|asset| ReleaseQuery {
                listing_url: YTDLP_LATEST_URL.to_string(),
                tag_prefix: String::new(),
                asset: AssetMatcher::exact(asset),
                checksum: ChecksumSource::Manifest("SHA2-256SUMS".to_string()),
            }),
        };
        let deno = Dependency {
            name: "deno".to_string(),
            install_path: tools_dir.join(platform.executable("deno")),
            layout: PayloadLayout::ZippedBinary {
                entry: platform.executable("deno"),
            },
            release: platform.deno_target().map(|target| ReleaseQuery {
                listing_url: DENO_LATEST_URL.to_string(),
                tag_prefix: String::new(),
                asset: AssetMatcher::exact(format!("deno-{target}.zip")),
                checksum: ChecksumSource::Sidecar(".sha256sum".to_string()),
            }),
        };
        let ffmpeg = Dependency {
            name: "ffmpeg".to_string(),
            install_path: tools_dir.join("ffmpeg_bin"),
            layout: PayloadLayout::ZippedDirectory {
                entry: "bin".to_string(),
            },
            release: platform.ffmpeg_asset_needle().map(|needle| ReleaseQuery {
                listing_url: FFMPEG_RELEASES_URL.to_string(),
                tag_prefix: FFMPEG_TAG_PREFIX.to_string(),
                asset: AssetMatcher::contains(needle, Some(".zip")),
                checksum: ChecksumSource::Manifest("checksums.sha256".to_string()),
            }),
        };
        Self { ytdlp, deno, ffmpeg }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Deno,
    Node,
}

impl RuntimeKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Deno => "deno",
            Self::Node => "node",
        }
    }
}

/// A JavaScript runtime yt-dlp can use for challenge solving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRuntime {
    pub kind: RuntimeKind,
    pub path: PathBuf,
}

impl ScriptRuntime {
    /// Value for yt-dlp's `--js-runtimes` option.
    pub fn runtime_flag(&self) -> String {
        format!("{}:{}", self.kind.name(), self.path.display())
    }
}

pub trait RuntimeLocator: Send + Sync {
    fn kind(&self) -> RuntimeKind;
    fn locate(&self) -> Option<ScriptRuntime>;
    fn describe(&self) -> String;
}

/// A runtime binary shipped inside the tools directory.
pub struct VendoredRuntime {
    pub kind: RuntimeKind,
    pub path: PathBuf,
}

impl RuntimeLocator for VendoredRuntime {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn locate(&self) -> Option<ScriptRuntime> {
        self.path.is_file().then(|| ScriptRuntime {
            kind: self.kind,
            path: self.path.clone(),
        })
    }

    fn describe(&self) -> String {
        format!("vendored {} at {}", self.kind.name(), self.path.display())
    }
}

/// Looks `name` up on `search_path`, or on the process `PATH` when it is `None`.
pub fn find_executable(name: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    match search_path {
        None => which::which(name).ok(),
        Some(paths) => which::which_in(name, Some(paths), Path::new(".")).ok(),
    }
}

/// A runtime found on `PATH`.
pub struct SearchPathRuntime {
    pub kind: RuntimeKind,
    pub search_path: Option<OsString>,
}

impl RuntimeLocator for SearchPathRuntime {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn locate(&self) -> Option<ScriptRuntime> {
        find_executable(self.kind.name(), self.search_path.as_deref()).map(|path| ScriptRuntime {
            kind: self.kind,
            path,
        })
    }

    fn describe(&self) -> String {
        format!("{} on PATH", self.kind.name())
    }
}

/// Vendored runtimes first, then the search path. `preference` is `auto`, `deno` or `node`.
pub fn default_locators(
    tools_dir: &Path,
    platform: Platform,
    preference: &str,
    search_path: Option<&OsStr>,
) -> Vec<Box<dyn RuntimeLocator>> {
    let locators: Vec<Box<dyn RuntimeLocator>> = vec![
        Box::new(VendoredRuntime {
            kind: RuntimeKind::Deno,
            path: tools_dir.join(platform.executable("deno")),
        }),
        Box::new(VendoredRuntime {
            kind: RuntimeKind::Node,
            path: tools_dir.join(platform.executable("node")),
        }),
        Box::new(SearchPathRuntime {
            kind: RuntimeKind::Deno,
            search_path: search_path.map(OsStr::to_os_string),
        }),
        Box::new(SearchPathRuntime {
            kind: RuntimeKind::Node,
            search_path: search_path.map(OsStr::to_os_string),
        }),
    ];
    locators
        .into_iter()
        .filter(|locator| match preference {
            "deno" => locator.kind() == RuntimeKind::Deno,
            "node" => locator.kind() == RuntimeKind::Node,
            _ => true,
        })
        .collect()
}

pub fn locate_runtime(locators: &[Box<dyn RuntimeLocator>]) -> Option<ScriptRuntime> {
    locators.iter().find_map(|locator| {
        let found = locator.locate();
        if found.is_some() {
            log::debug!("using {}", locator.describe());
        }
        found
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    Managed,
    System,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub name: String,
    pub source: ToolSource,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

#[derive(Debug)]
pub struct DependencyReport {
    pub name: String,
    pub result: InstallResult,
}

impl DependencyReport {
    pub fn summary(&self) -> String {
        match &self.result {
            Ok(InstallOutcome::AlreadyPresent) => format!("{} is ready", self.name),
            Ok(InstallOutcome::Installed { version }) => {
                format!("{} {version} installed", self.name)
            }
            Ok(InstallOutcome::UpToDate { version }) => {
                format!("{} is up to date ({version})", self.name)
            }
            Err(error) => format!("{} failed: {error}", self.name),
        }
    }
}

fn stage_reporter<'a>(name: &'a str, sink: &'a dyn StatusSink) -> impl FnMut(InstallStage) + 'a {
    let mut last_percent = None;
    move |stage| match stage {
        InstallStage::Resolving => sink.status(&format!("Checking the latest {name} release...")),
        InstallStage::Downloading { done, total } => {
            if total == 0 {
                if done == 0 {
                    sink.status(&format!("Downloading {name}..."));
                }
                return;
            }
            let percent = ((done as f64 / total as f64) * 100.0).clamp(0.0, 100.0) as u8;
            if last_percent == Some(percent) {
                return;
            }
            last_percent = Some(percent);
            sink.status(&format!("Downloading {name}: {percent}%"));
            sink.progress(percent);
        }
        InstallStage::Verifying => sink.status(&format!("Verifying {name}...")),
        InstallStage::Unpacking => sink.status(&format!("Unpacking {name}...")),
        InstallStage::Applying => sink.status(&format!("Installing {name}...")),
    }
}

pub struct Toolchain {
    paths: AppPaths,
    platform: Platform,
    catalogue: Catalogue,
    installer: DependencyInstaller,
    runtime_preference: String,
    search_path: Option<OsString>,
}

impl Toolchain {
    /// Toolchain backed by the GitHub release API.
    pub fn new(paths: AppPaths, settings: &Settings) -> Self {
        let fetcher: Arc<dyn ArtifactSource> = Arc::new(HttpFetcher::new(
            &settings.user_agent,
            UrlPolicy::trusted_defaults(),
        ));
        let releases = Arc::new(GithubReleases::new(Arc::clone(&fetcher)));
        let installer =
            DependencyInstaller::new(releases, fetcher).with_checksums(settings.verify_checksums);
        Self::with_installer(
            paths,
            Platform::current(),
            installer,
            &settings.runtime_preference,
        )
    }

    pub fn with_installer(
        paths: AppPaths,
        platform: Platform,
        installer: DependencyInstaller,
        runtime_preference: &str,
    ) -> Self {
        let catalogue = Catalogue::new(&paths.tools_dir, platform);
        Self {
            paths,
            platform,
            catalogue,
            installer,
            runtime_preference: runtime_preference.to_string(),
            search_path: None,
        }
    }

    /// Replaces the process `PATH` for every system tool lookup.
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    fn find_on_path(&self, name: &str) -> Option<PathBuf> {
        find_executable(name, self.search_path.as_deref())
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    pub fn locators(&self) -> Vec<Box<dyn RuntimeLocator>> {
        default_locators(
            &self.paths.tools_dir,
            self.platform,
            &self.runtime_preference,
            self.search_path.as_deref(),
        )
    }

    pub fn locate_runtime(&self) -> Option<ScriptRuntime> {
        locate_runtime(&self.locators())
    }

    pub fn ytdlp_path(&self) -> Option<PathBuf> {
        if self.catalogue.ytdlp.is_present() {
            return Some(self.catalogue.ytdlp.install_path.clone());
        }
        self.find_on_path("yt-dlp")
    }

    /// Directory holding the FFmpeg binaries: the managed install, else the one on `PATH`.
    pub fn ffmpeg_location(&self) -> Option<PathBuf> {
        if self.catalogue.ffmpeg.is_present() {
            return Some(self.catalogue.ffmpeg.install_path.clone());
        }
        self.find_on_path("ffmpeg")
            .and_then(|binary| binary.parent().map(Path::to_path_buf))
    }

    fn install(
        &self,
        dependency: &Dependency,
        refresh: bool,
        sink: &dyn StatusSink,
    ) -> DependencyReport {
        let mut reporter = stage_reporter(&dependency.name, sink);
        let result = if refresh {
            self.installer.refresh(dependency, &mut reporter)
        } else {
            self.installer.ensure(dependency, false, &mut reporter)
        };
        let report = DependencyReport {
            name: dependency.name.clone(),
            result,
        };
        match &report.result {
            Ok(_) => log::info!("{}", report.summary()),
            Err(_) => log::warn!("{}", report.summary()),
        }
        sink.status(&report.summary());
        report
    }

    fn system_only_ffmpeg(&self, sink: &dyn StatusSink) -> DependencyReport {
        let result = match self.find_on_path("ffmpeg") {
            Some(path) => {
                log::info!("using system ffmpeg at {}", path.display());
                Ok(InstallOutcome::AlreadyPresent)
            }
            None => Err(InstallError::Unsupported {
                dependency: "ffmpeg".to_string(),
            }),
        };
        let report = DependencyReport {
            name: "ffmpeg".to_string(),
            result,
        };
        sink.status(&report.summary());
        report
    }

    /// Makes every dependency available. Each one is handled independently; a failure
    /// is reported and the remaining ones are still attempted.
    pub fn bootstrap(&self, sink: &dyn StatusSink) -> Vec<DependencyReport> {
        let mut reports = Vec::with_capacity(3);
        if let Err(error) = self.paths.ensure_tools_dir() {
            sink.status(&error.to_string());
        }

        match self.locate_runtime() {
            Some(runtime) => reports.push(DependencyReport {
                name: runtime.kind.name().to_string(),
                result: Ok(InstallOutcome::AlreadyPresent),
            }),
            None if self.runtime_preference == "node" => {
                let report = DependencyReport {
                    name: "node".to_string(),
                    result: Err(InstallError::Unsupported {
                        dependency: "node".to_string(),
                    }),
                };
                sink.status(&report.summary());
                reports.push(report);
            }
            None => reports.push(self.install(&self.catalogue.deno, false, sink)),
        }

        reports.push(self.install(&self.catalogue.ytdlp, false, sink));

        if self.catalogue.ffmpeg.release.is_some() {
            reports.push(self.install(&self.catalogue.ffmpeg, false, sink));
        } else {
            reports.push(self.system_only_ffmpeg(sink));
        }
        sink.progress(0);
        reports
    }

    /// Refreshes managed dependencies whose installed version differs from the latest release.
    pub fn update(&self, sink: &dyn StatusSink) -> Vec<DependencyReport> {
        let mut reports = vec![self.install(&self.catalogue.ytdlp, true, sink)];
        if self.catalogue.ffmpeg.release.is_some() {
            reports.push(self.install(&self.catalogue.ffmpeg, true, sink));
        } else {
            log::info!("ffmpeg is provided by the system; skipping update");
        }
        if self.catalogue.deno.is_present() {
            reports.push(self.install(&self.catalogue.deno, true, sink));
        }
        sink.progress(0);
        reports
    }

    pub fn status(&self) -> Vec<ToolStatus> {
        let managed_or_system = |dependency: &Dependency, system: Option<PathBuf>, version_arg: &str| {
            if dependency.is_present() {
                ToolStatus {
                    name: dependency.name.clone(),
                    source: ToolSource::Managed,
                    path: Some(dependency.install_path.clone()),
                    version: dependency.installed_version(),
                }
            } else {
                ToolStatus {
                    name: dependency.name.clone(),
                    source: if system.is_some() {
                        ToolSource::System
                    } else {
                        ToolSource::Missing
                    },
                    version: system
                        .as_deref()
                        .and_then(|path| run_version(path, version_arg)),
                    path: system,
                }
            }
        };

        let mut statuses = vec![
            managed_or_system(&self.catalogue.ytdlp, self.find_on_path("yt-dlp"), "--version"),
            managed_or_system(&self.catalogue.ffmpeg, self.find_on_path("ffmpeg"), "-version"),
        ];
        let runtime = self.locate_runtime();
        statuses.push(match runtime {
            Some(runtime) if runtime.path.starts_with(&self.paths.tools_dir) => ToolStatus {
                name: runtime.kind.name().to_string(),
                source: ToolSource::Managed,
                version: (runtime.kind == RuntimeKind::Deno)
                    .then(|| self.catalogue.deno.installed_version())
                    .flatten(),
                path: Some(runtime.path),
            },
            Some(runtime) => ToolStatus {
                name: runtime.kind.name().to_string(),
                source: ToolSource::System,
                version: run_version(&runtime.path, "--version"),
                path: Some(runtime.path),
            },
            None => ToolStatus {
                name: "runtime".to_string(),
                source: ToolSource::Missing,
                path: None,
                version: None,
            },
        });
        statuses
    }
}
