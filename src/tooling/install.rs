// Managed dependency installation: resolve, fetch, verify, unpack and swap into place.
use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::PoisonError;

static SCRATCH_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// What the downloaded release asset contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadLayout {
    /// The asset is the executable itself.
    RawBinary,
    /// A zip holding an executable named `entry` somewhere inside.
    ZippedBinary { entry: String },
    /// A zip holding a directory named `entry`; the whole directory is installed.
    ZippedDirectory { entry: String },
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub install_path: PathBuf,
    pub layout: PayloadLayout,
    /// `None` when no managed build exists for this platform.
    pub release: Option<ReleaseQuery>,
}

impl Dependency {
    pub fn is_present(&self) -> bool {
        match self.layout {
            PayloadLayout::ZippedDirectory { .. } => self.install_path.is_dir(),
            _ => self.install_path.is_file(),
        }
    }

    /// Sidecar file holding the installed release tag, next to the install path.
    pub fn marker_path(&self) -> PathBuf {
        let parent = self
            .install_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        parent.join(format!("{}_version.txt", self.name))
    }

    pub fn installed_version(&self) -> Option<String> {
        let raw = fs::read_to_string(self.marker_path()).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyPresent,
    Installed { version: String },
    UpToDate { version: String },
}

impl InstallOutcome {
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::AlreadyPresent => None,
            Self::Installed { version } | Self::UpToDate { version } => Some(version),
        }
    }
}

pub type InstallResult = Result<InstallOutcome, InstallError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Resolving,
    Downloading { done: u64, total: u64 },
    Verifying,
    Unpacking,
    Applying,
}

/// Temporary files of one install attempt, removed when the attempt ends.
struct Scratch {
    archive: PathBuf,
    extract_dir: PathBuf,
    staged: PathBuf,
}

impl Scratch {
    /// Names are unique per process and per attempt.
    fn new(parent: &Path, name: &str) -> Self {
        let pid = std::process::id();
        let attempt = SCRATCH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let stem = format!(".{name}-{pid}-{attempt}");
        Self {
            archive: parent.join(format!("{stem}.download")),
            extract_dir: parent.join(format!("{stem}.extract")),
            staged: parent.join(format!("{stem}.staged")),
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for path in [&self.archive, &self.extract_dir, &self.staged] {
            if let Err(error) = remove_path_if_exists(path) {
                log::warn!("failed to clean up {}: {error}", path.display());
            }
        }
    }
}

pub(super) fn remove_path_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

pub fn unpack_zip(archive_path: &Path, destination: &Path) -> Result<(), InstallError> {
    let file = fs::File::open(archive_path)
        .map_err(|error| InstallError::io("failed to open downloaded archive", error))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|error| InstallError::Archive(format!("failed to read archive: {error}")))?;
    fs::create_dir_all(destination)
        .map_err(|error| InstallError::io("failed to create extraction dir", error))?;
    archive
        .extract(destination)
        .map_err(|error| InstallError::Archive(format!("failed to extract archive: {error}")))
}

/// Breadth-first search for an entry named `name` (case-insensitive) under `root`.
pub fn locate_payload(root: &Path, name: &str, want_dir: bool) -> Result<PathBuf, InstallError> {
    let mut queue = std::collections::VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        let mut entries = fs::read_dir(&dir)
            .map_err(|error| InstallError::io("failed to scan extracted files", error))?
            .flatten()
            .map(|entry| entry.path())
            .collect::<Vec<_>>();
        entries.sort();
        for path in entries {
            let is_dir = path.is_dir();
            let name_matches = path
                .file_name()
                .and_then(|value| value.to_str())
                .is_some_and(|value| value.eq_ignore_ascii_case(name));
            if name_matches && is_dir == want_dir {
                return Ok(path);
            }
            if is_dir {
                queue.push_back(path);
            }
        }
    }
    let kind = if want_dir { "directory" } else { "file" };
    Err(InstallError::Layout(format!(
        "{kind} `{name}` was not found in the archive"
    )))
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;
    let targets = if path.is_dir() {
        fs::read_dir(path)
            .map_err(|error| InstallError::io("failed to list installed files", error))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|candidate| candidate.is_file())
            .collect::<Vec<_>>()
    } else {
        vec![path.to_path_buf()]
    };
    for target in targets {
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
            .map_err(|error| InstallError::io("failed to set executable permissions", error))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<(), InstallError> {
    Ok(())
}

/// Moves `staged` to `target`. A file is replaced with one rename. A directory
/// install is renamed aside first and only deleted once the new one is in place;
/// it is restored if the final rename fails.
pub fn replace_atomically(staged: &Path, target: &Path) -> Result<(), InstallError> {
    if !target.is_dir() {
        return fs::rename(staged, target)
            .map_err(|error| InstallError::io("failed to move new install into place", error));
    }

    let retired = target.with_file_name(format!(
        ".{}.retired",
        target
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("install")
    ));
    remove_path_if_exists(&retired)
        .map_err(|error| InstallError::io("failed to clear previous retired install", error))?;
    fs::rename(target, &retired)
        .map_err(|error| InstallError::io("failed to retire previous install", error))?;
    if let Err(error) = fs::rename(staged, target) {
        if let Err(restore_error) = fs::rename(&retired, target) {
            log::error!(
                "failed to restore {} after aborted replace: {restore_error}",
                target.display()
            );
        }
        return Err(InstallError::io("failed to move new install into place", error));
    }
    if let Err(error) = remove_path_if_exists(&retired) {
        log::warn!("failed to remove retired install {}: {error}", retired.display());
    }
    Ok(())
}

/// Installs and refreshes dependencies. Calls for the same dependency name are
/// serialized; a waiting `ensure` sees the finished install and returns without
/// touching the network.
pub struct DependencyInstaller {
    releases: Arc<dyn ReleaseSource>,
    artifacts: Arc<dyn ArtifactSource>,
    verify_checksums: bool,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DependencyInstaller {
    pub fn new(releases: Arc<dyn ReleaseSource>, artifacts: Arc<dyn ArtifactSource>) -> Self {
        Self {
            releases,
            artifacts,
            verify_checksums: true,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    fn gate_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Makes sure the dependency exists locally. Without `force`, an existing install
    /// is accepted as-is and no request is made.
    pub fn ensure(
        &self,
        dependency: &Dependency,
        force: bool,
        on_stage: &mut dyn FnMut(InstallStage),
    ) -> InstallResult {
        let gate = self.gate_for(&dependency.name);
        let _guard = gate.lock().unwrap_or_else(PoisonError::into_inner);

        if !force && dependency.is_present() {
            log::debug!("{} already present at {}", dependency.name, dependency.install_path.display());
            return Ok(InstallOutcome::AlreadyPresent);
        }
        let resolved = self.resolve(dependency, on_stage)?;
        self.install_resolved(dependency, &resolved, on_stage)?;
        Ok(InstallOutcome::Installed {
            version: resolved.tag,
        })
    }

    /// Reinstalls only when the latest release tag differs from the persisted marker.
    pub fn refresh(
        &self,
        dependency: &Dependency,
        on_stage: &mut dyn FnMut(InstallStage),
    ) -> InstallResult {
        let gate = self.gate_for(&dependency.name);
        let _guard = gate.lock().unwrap_or_else(PoisonError::into_inner);

        let resolved = self.resolve(dependency, on_stage)?;
        let current = dependency.installed_version();
        if dependency.is_present() && current.as_deref() == Some(resolved.tag.as_str()) {
            log::info!("{} is current ({})", dependency.name, resolved.tag);
            return Ok(InstallOutcome::UpToDate {
                version: resolved.tag,
            });
        }
        log::info!(
            "{} update available: {} -> {}",
            dependency.name,
            current.as_deref().unwrap_or("none"),
            resolved.tag
        );
        self.install_resolved(dependency, &resolved, on_stage)?;
        Ok(InstallOutcome::Installed {
            version: resolved.tag,
        })
    }

    fn resolve(
        &self,
        dependency: &Dependency,
        on_stage: &mut dyn FnMut(InstallStage),
    ) -> Result<ResolvedRelease, InstallError> {
        let query = dependency
            .release
            .as_ref()
            .ok_or_else(|| InstallError::Unsupported {
                dependency: dependency.name.clone(),
            })?;
        on_stage(InstallStage::Resolving);
        self.releases
            .resolve(query)?
            .ok_or_else(|| InstallError::NoMatchingAsset {
                dependency: dependency.name.clone(),
            })
    }

    fn verify(
        &self,
        dependency: &Dependency,
        resolved: &ResolvedRelease,
        archive: &Path,
    ) -> Result<(), InstallError> {
        let Some(source) = dependency.release.as_ref().map(|query| &query.checksum) else {
            return Ok(());
        };
        if !self.verify_checksums || *source == ChecksumSource::None {
            return Ok(());
        }
        let Some(checksum_asset) = resolved.checksum_asset.as_ref() else {
            log::warn!("{} {} publishes no checksum; skipping verification", dependency.name, resolved.tag);
            return Ok(());
        };
        let payload = self.artifacts.fetch_text(&checksum_asset.download_url)?;
        let expected = match source {
            ChecksumSource::Manifest(_) => parse_sha256_for_asset(&payload, &resolved.asset.name),
            _ => parse_sha256_token(&payload),
        };
        match expected {
            Some(expected) => verify_download_checksum(archive, &expected),
            None => {
                log::warn!("no checksum listed for {}; skipping verification", resolved.asset.name);
                Ok(())
            }
        }
    }

    fn install_resolved(
        &self,
        dependency: &Dependency,
        resolved: &ResolvedRelease,
        on_stage: &mut dyn FnMut(InstallStage),
    ) -> Result<(), InstallError> {
        let parent = dependency
            .install_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        fs::create_dir_all(&parent)
            .map_err(|error| InstallError::io("failed to create install dir", error))?;
        let scratch = Scratch::new(&parent, &dependency.name);

        log::info!(
            "installing {} {} from {}",
            dependency.name,
            resolved.tag,
            resolved.download_url()
        );
        on_stage(InstallStage::Downloading { done: 0, total: 0 });
        self.artifacts.fetch_to_file(
            resolved.download_url(),
            &scratch.archive,
            &mut |done, total| on_stage(InstallStage::Downloading { done, total }),
        )?;

        on_stage(InstallStage::Verifying);
        self.verify(dependency, resolved, &scratch.archive)?;

        match &dependency.layout {
            PayloadLayout::RawBinary => {
                fs::rename(&scratch.archive, &scratch.staged)
                    .map_err(|error| InstallError::io("failed to stage download", error))?;
            }
            PayloadLayout::ZippedBinary { entry } | PayloadLayout::ZippedDirectory { entry } => {
                on_stage(InstallStage::Unpacking);
                unpack_zip(&scratch.archive, &scratch.extract_dir)?;
                let want_dir = matches!(dependency.layout, PayloadLayout::ZippedDirectory { .. });
                let payload = locate_payload(&scratch.extract_dir, entry, want_dir)?;
                fs::rename(&payload, &scratch.staged)
                    .map_err(|error| InstallError::io("failed to stage extracted payload", error))?;
            }
        }
        mark_executable(&scratch.staged)?;

        on_stage(InstallStage::Applying);
        replace_atomically(&scratch.staged, &dependency.install_path)?;
        fs::write(dependency.marker_path(), &resolved.tag)
            .map_err(|error| InstallError::io("failed to write version marker", error))?;

        if !dependency.is_present() {
            return Err(InstallError::Layout(format!(
                "{} is still missing after install",
                dependency.install_path.display()
            )));
        }
        log::info!("{} {} installed", dependency.name, resolved.tag);
        Ok(())
    }
}
