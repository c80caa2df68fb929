// Settings, application paths, trusted transfer helpers and common process primitives.
use super::*;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
use std::process::Command;

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const APP_DIR_NAME: &str = "tubefetch";
pub const TRUSTED_DOWNLOAD_HOSTS: [&str; 4] = [
    "github.com",
    "api.github.com",
    "objects.githubusercontent.com",
    "release-assets.githubusercontent.com",
];
pub(super) const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;
#[cfg(target_os = "windows")]
pub(super) const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub fn hidden_command(program: impl AsRef<OsStr>) -> Command {
    let mut command = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(CREATE_NO_WINDOW);
    }
    command
}

pub(super) fn default_user_agent() -> String {
    format!("{APP_DIR_NAME}/{}", env!("CARGO_PKG_VERSION"))
}

pub(super) fn default_runtime_preference() -> String {
    "auto".to_string()
}

pub(super) fn default_quality_label() -> String {
    "best".to_string()
}

pub(super) fn default_format_label() -> String {
    "mp4".to_string()
}

pub(super) fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub tools_dir: Option<String>,
    pub downloads_dir: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_runtime_preference")]
    pub runtime_preference: String,
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
    #[serde(default = "default_quality_label")]
    pub default_quality: String,
    #[serde(default = "default_format_label")]
    pub default_format: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tools_dir: None,
            downloads_dir: None,
            user_agent: default_user_agent(),
            runtime_preference: default_runtime_preference(),
            verify_checksums: true,
            default_quality: default_quality_label(),
            default_format: default_format_label(),
        }
    }
}

pub(super) fn sanitize_optional_path(value: Option<String>) -> Result<Option<String>, SettingsError> {
    match value {
        None => Ok(None),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if trimmed.len() > 512 {
                return Err(SettingsError::InvalidPath("path is too long".to_string()));
            }
            if trimmed.chars().any(|ch| ch.is_control()) {
                return Err(SettingsError::InvalidPath(
                    "path contains control characters".to_string(),
                ));
            }
            Ok(Some(trimmed.to_string()))
        }
    }
}

pub fn normalize_settings(mut settings: Settings) -> Result<Settings, SettingsError> {
    settings.tools_dir = sanitize_optional_path(settings.tools_dir)?;
    settings.downloads_dir = sanitize_optional_path(settings.downloads_dir)?;
    settings.runtime_preference = settings.runtime_preference.trim().to_lowercase();
    if !matches!(settings.runtime_preference.as_str(), "auto" | "deno" | "node") {
        settings.runtime_preference = default_runtime_preference();
    }
    settings.user_agent = settings.user_agent.trim().to_string();
    if settings.user_agent.is_empty() {
        settings.user_agent = default_user_agent();
    }
    if Quality::parse(&settings.default_quality).is_none() {
        settings.default_quality = default_quality_label();
    }
    if ContainerFormat::parse(&settings.default_format).is_none() {
        settings.default_format = default_format_label();
    }
    Ok(settings)
}

pub fn load_settings(root: &Path) -> Result<Settings, SettingsError> {
    let path = root.join(SETTINGS_FILE_NAME);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let raw = fs::read_to_string(&path).map_err(SettingsError::Read)?;
    let parsed: Settings = serde_json::from_str(&raw)?;
    normalize_settings(parsed)
}

pub fn save_settings(root: &Path, settings: Settings) -> Result<Settings, SettingsError> {
    let normalized = normalize_settings(settings)?;
    fs::create_dir_all(root).map_err(SettingsError::Write)?;
    let payload = serde_json::to_string_pretty(&normalized)?;
    fs::write(root.join(SETTINGS_FILE_NAME), payload).map_err(SettingsError::Write)?;
    Ok(normalized)
}

/// Directories the application reads from and writes to.
#[derive(Debug, Clone, PartialEq)]
pub struct AppPaths {
    pub root: PathBuf,
    pub tools_dir: PathBuf,
    pub downloads_dir: PathBuf,
}

impl AppPaths {
    /// Picks the application root: explicit override, the platform data dir, then the
    /// current directory.
    pub fn default_root(root_override: Option<PathBuf>) -> PathBuf {
        if let Some(root) = root_override {
            return root;
        }
        if let Some(data_dir) = dirs::data_local_dir() {
            return data_dir.join(APP_DIR_NAME);
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    pub fn new(root: PathBuf, settings: &Settings) -> Self {
        let tools_dir = settings
            .tools_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("tools"));
        let downloads_dir = settings
            .downloads_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("downloads"));
        Self {
            root,
            tools_dir,
            downloads_dir,
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE_NAME)
    }

    pub fn ensure_tools_dir(&self) -> Result<&Path, InstallError> {
        fs::create_dir_all(&self.tools_dir)
            .map_err(|error| InstallError::io("failed to create tools dir", error))?;
        Ok(&self.tools_dir)
    }
}

/// Rules a remote URL must satisfy before any request is made to it.
#[derive(Debug, Clone)]
pub struct UrlPolicy {
    pub require_https: bool,
    pub trusted_hosts: Option<Vec<String>>,
}

impl UrlPolicy {
    pub fn trusted_defaults() -> Self {
        Self {
            require_https: true,
            trusted_hosts: Some(
                TRUSTED_DOWNLOAD_HOSTS
                    .iter()
                    .map(|host| host.to_string())
                    .collect(),
            ),
        }
    }

    /// Accepts any http(s) URL. Meant for loopback servers and tests.
    pub fn permissive() -> Self {
        Self {
            require_https: false,
            trusted_hosts: None,
        }
    }

    pub fn check(&self, url: &str) -> Result<Url, TransferError> {
        let reject = |reason: &str| TransferError::Rejected {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let parsed = Url::parse(url).map_err(|_| reject("invalid URL"))?;
        match parsed.scheme() {
            "https" => {}
            "http" if !self.require_https => {}
            _ => return Err(reject("only HTTPS sources are allowed")),
        }
        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(reject("URL must not include credentials"));
        }
        let Some(trusted_hosts) = self.trusted_hosts.as_ref() else {
            return Ok(parsed);
        };
        if parsed.port().is_some() {
            return Err(reject("URL must not include a custom port"));
        }
        let host = parsed.host_str().ok_or_else(|| reject("missing host"))?;
        if trusted_hosts
            .iter()
            .any(|allowed| trusted_host_match(host, allowed))
        {
            return Ok(parsed);
        }
        Err(reject("untrusted host"))
    }
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self::trusted_defaults()
    }
}

pub(super) fn trusted_host_match(host: &str, allowed_host: &str) -> bool {
    host.eq_ignore_ascii_case(allowed_host)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", allowed_host.to_ascii_lowercase()))
}

/// Byte-level transfer seam used by the release resolver and the installer.
pub trait ArtifactSource: Send + Sync {
    /// Streams `url` into `destination`, overwriting it. `on_progress` receives
    /// `(bytes_done, bytes_total)` and is only called when the server reports a length.
    /// The destination is undefined unless this returns `Ok`.
    fn fetch_to_file(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, TransferError>;

    fn fetch_text(&self, url: &str) -> Result<String, TransferError>;
}

/// `ArtifactSource` over a shared ureq agent.
#[derive(Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
    policy: UrlPolicy,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, policy: UrlPolicy) -> Self {
        let agent = ureq::AgentBuilder::new()
            .user_agent(user_agent)
            .timeout_connect(Duration::from_secs(20))
            .timeout_read(Duration::from_secs(60))
            .build();
        Self { agent, policy }
    }

    fn get(&self, url: &str) -> Result<ureq::Response, TransferError> {
        let parsed = self.policy.check(url)?;
        self.agent
            .get(parsed.as_str())
            .set("Accept", "application/vnd.github+json, application/octet-stream, */*")
            .call()
            .map_err(|error| match error {
                ureq::Error::Status(code, _) => TransferError::Status {
                    code,
                    url: url.to_string(),
                },
                ureq::Error::Transport(transport) => TransferError::Network {
                    url: url.to_string(),
                    message: transport.to_string(),
                },
            })
    }
}

impl ArtifactSource for HttpFetcher {
    fn fetch_to_file(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<u64, TransferError> {
        let io_error = |source| TransferError::Io {
            url: url.to_string(),
            source,
        };
        let response = self.get(url)?;
        let total_size = response
            .header("content-length")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|total| *total > 0);

        let mut reader = response.into_reader();
        let mut file = fs::File::create(destination).map_err(io_error)?;
        let mut downloaded = 0_u64;
        let mut buffer = vec![0_u8; TRANSFER_CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buffer).map_err(io_error)?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read]).map_err(io_error)?;
            downloaded += read as u64;
            if let Some(total) = total_size {
                on_progress(downloaded, total);
            }
        }
        file.flush().map_err(io_error)?;
        log::debug!("fetched {downloaded} bytes from {url}");
        Ok(downloaded)
    }

    fn fetch_text(&self, url: &str) -> Result<String, TransferError> {
        let response = self.get(url)?;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|source| TransferError::Io {
                url: url.to_string(),
                source,
            })?;
        String::from_utf8(body).map_err(|error| TransferError::Io {
            url: url.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, error),
        })
    }
}

pub fn parse_sha256_token(value: &str) -> Option<String> {
    value
        .split_whitespace()
        .find(|token| token.len() == 64 && token.chars().all(|ch| ch.is_ascii_hexdigit()))
        .map(|token| token.to_ascii_lowercase())
}

pub fn parse_sha256_for_asset(manifest: &str, asset_name: &str) -> Option<String> {
    for line in manifest.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let normalized = trimmed.replace('*', " ");
        let mut parts = normalized.split_whitespace();
        let Some(hash) = parts.next() else {
            continue;
        };
        let Some(filename) = parts.next_back() else {
            continue;
        };
        let candidate_name = filename.trim().trim_start_matches("./");
        if candidate_name.eq_ignore_ascii_case(asset_name)
            && hash.len() == 64
            && hash.chars().all(|ch| ch.is_ascii_hexdigit())
        {
            return Some(hash.to_ascii_lowercase());
        }
    }
    None
}

pub fn sha256_of_file(path: &Path) -> Result<String, InstallError> {
    let mut file = fs::File::open(path)
        .map_err(|error| InstallError::io("failed to open file for checksum", error))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; TRANSFER_CHUNK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|error| InstallError::io("failed to read file for checksum", error))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_download_checksum(path: &Path, expected_sha256: &str) -> Result<(), InstallError> {
    let expected = expected_sha256.trim().to_ascii_lowercase();
    let actual = sha256_of_file(path)?;
    if actual != expected {
        return Err(InstallError::Integrity { expected, actual });
    }
    Ok(())
}

/// First non-empty stdout line of `<binary> <arg>`, if the binary runs successfully.
pub fn run_version(binary: &Path, arg: &str) -> Option<String> {
    let output = hidden_command(binary)
        .arg(arg)
        .stdin(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
}
