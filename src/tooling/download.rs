// Download orchestration: target validation, yt-dlp arguments and status projection.
use super::*;

const YOUTUBE_HOSTS: [&str; 4] = ["www.youtube.com", "youtube.com", "youtu.be", "m.youtube.com"];
const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    VideoAudio,
    AudioOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    #[default]
    Best,
    /// Ceiling on the video height in pixels.
    MaxHeight(u32),
}

impl Quality {
    /// Accepts `best`, `4k`, `8k` and `<height>p` (the `p` is optional).
    pub fn parse(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "best" => return Some(Self::Best),
            "4k" => return Some(Self::MaxHeight(2160)),
            "8k" => return Some(Self::MaxHeight(4320)),
            _ => {}
        }
        let digits = normalized.strip_suffix('p').unwrap_or(&normalized);
        match digits.parse::<u32>() {
            Ok(height) if height > 0 => Some(Self::MaxHeight(height)),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Best => "best".to_string(),
            Self::MaxHeight(height) => format!("{height}p"),
        }
    }
}

impl std::str::FromStr for Quality {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| format!("unknown quality `{value}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Webm,
    Mkv,
}

impl ContainerFormat {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "webm" => Some(Self::Webm),
            "mkv" => Some(Self::Mkv),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mkv => "mkv",
        }
    }
}

impl std::str::FromStr for ContainerFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| format!("unknown format `{value}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadOptions {
    pub content: ContentType,
    pub quality: Quality,
    pub format: ContainerFormat,
}

/// Ordered yt-dlp argument list. Each token is passed to the process as one argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArguments {
    tokens: Vec<String>,
}

impl RunArguments {
    pub fn build(
        url: &str,
        options: &DownloadOptions,
        runtime: Option<&ScriptRuntime>,
        ffmpeg_location: &Path,
        downloads_dir: &Path,
    ) -> Self {
        let mut tokens = Vec::with_capacity(16);
        match options.content {
            ContentType::AudioOnly => {
                tokens.extend(
                    [
                        "-f",
                        "bestaudio",
                        "--extract-audio",
                        "--audio-format",
                        "mp3",
                        "--audio-quality",
                        "192",
                    ]
                    .map(String::from),
                );
            }
            ContentType::VideoAudio => {
                tokens.push("-f".to_string());
                tokens.push(match options.quality {
                    Quality::Best => "bestvideo+bestaudio/best".to_string(),
                    Quality::MaxHeight(height) => format!(
                        "bestvideo[height<={height}]+bestaudio/best[height<={height}]"
                    ),
                });
                match options.format {
                    ContainerFormat::Mkv => {
                        tokens.push("--merge-output-format".to_string());
                        tokens.push("mkv".to_string());
                    }
                    format => {
                        tokens.push("--remux-video".to_string());
                        tokens.push(format.as_str().to_string());
                    }
                }
            }
        }
        if let Some(runtime) = runtime {
            tokens.push("--js-runtimes".to_string());
            tokens.push(runtime.runtime_flag());
        }
        tokens.push("--ffmpeg-location".to_string());
        tokens.push(ffmpeg_location.to_string_lossy().to_string());
        tokens.push("--progress".to_string());
        tokens.push("--newline".to_string());
        tokens.push("-o".to_string());
        tokens.push(downloads_dir.join(OUTPUT_TEMPLATE).to_string_lossy().to_string());
        tokens.push(url.to_string());
        Self { tokens }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Shell-style rendering for logs.
    pub fn to_command_line(&self, program: &Path) -> String {
        std::iter::once(program.to_string_lossy().to_string())
            .chain(self.tokens.iter().cloned())
            .map(|token| quote_token(&token))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_token(token: &str) -> String {
    if !token.is_empty() && !token.chars().any(|ch| ch.is_whitespace() || ch == '"') {
        return token.to_string();
    }
    format!("\"{}\"", token.replace('"', "\\\""))
}

fn is_video_id(value: &str) -> bool {
    value.len() == 11
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

fn is_youtube_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "youtu.be" || host == "youtube.com" || host.ends_with(".youtube.com")
}

/// Turns a full URL, a scheme-less or protocol-relative host, or a bare video id into a
/// YouTube URL. Anything that does not end up on a YouTube host is rejected.
pub fn normalize_target(input: &str) -> Result<String, DownloadError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DownloadError::InvalidTarget("no link given".to_string()));
    }
    let lowered = trimmed.to_ascii_lowercase();
    let candidate = if lowered.starts_with("http://") || lowered.starts_with("https://") {
        trimmed.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        format!("https://{rest}")
    } else if YOUTUBE_HOSTS.iter().any(|host| lowered.starts_with(host)) {
        format!("https://{trimmed}")
    } else if is_video_id(trimmed) {
        format!("https://www.youtube.com/watch?v={trimmed}")
    } else {
        format!("https://{trimmed}")
    };

    let parsed = Url::parse(&candidate)
        .map_err(|_| DownloadError::InvalidTarget(format!("`{trimmed}` is not a valid link")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DownloadError::InvalidTarget(format!(
            "unsupported scheme `{}`",
            parsed.scheme()
        )));
    }
    match parsed.host_str() {
        Some(host) if is_youtube_host(host) => Ok(candidate),
        _ => Err(DownloadError::InvalidTarget(format!(
            "`{trimmed}` is not a YouTube link"
        ))),
    }
}

/// Receiver of user-facing progress. Implementations own all display state.
pub trait StatusSink {
    fn status(&self, text: &str);
    fn progress(&self, percent: u8);
    fn terminal(&self, success: bool, detail: &str);
    /// The trigger control may be re-enabled.
    fn ready(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Status(String),
    Progress(u8),
    Terminal { success: bool, detail: String },
    Ready,
}

impl StatusSink for mpsc::Sender<DownloadEvent> {
    fn status(&self, text: &str) {
        let _ = self.send(DownloadEvent::Status(text.to_string()));
    }

    fn progress(&self, percent: u8) {
        let _ = self.send(DownloadEvent::Progress(percent));
    }

    fn terminal(&self, success: bool, detail: &str) {
        let _ = self.send(DownloadEvent::Terminal {
            success,
            detail: detail.to_string(),
        });
    }

    fn ready(&self) {
        let _ = self.send(DownloadEvent::Ready);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Preparing,
    Running,
    Succeeded,
    Failed,
}

/// Runs one download at a time against a toolchain. Callers keep their trigger
/// disabled between starting `run` and receiving `ready`.
pub struct DownloadOrchestrator<'a> {
    toolchain: &'a Toolchain,
    state: DownloadState,
}

impl<'a> DownloadOrchestrator<'a> {
    pub fn new(toolchain: &'a Toolchain) -> Self {
        Self {
            toolchain,
            state: DownloadState::Idle,
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    fn transition(&mut self, next: DownloadState) {
        log::debug!("download state {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Downloads `target` into the downloads directory and returns that directory.
    /// The sink always receives a terminal event followed by a progress reset and `ready`.
    pub fn run(
        &mut self,
        target: &str,
        options: &DownloadOptions,
        sink: &dyn StatusSink,
    ) -> Result<PathBuf, DownloadError> {
        self.transition(DownloadState::Preparing);
        let result = self.execute(target, options, sink);
        match &result {
            Ok(directory) => {
                self.transition(DownloadState::Succeeded);
                log::info!("download finished into {}", directory.display());
                sink.terminal(true, &format!("Saved to {}", directory.display()));
            }
            Err(error) => {
                self.transition(DownloadState::Failed);
                log::warn!("download failed: {error}");
                sink.terminal(false, &error.to_string());
            }
        }
        sink.progress(0);
        sink.ready();
        self.transition(DownloadState::Idle);
        result
    }

    fn execute(
        &mut self,
        target: &str,
        options: &DownloadOptions,
        sink: &dyn StatusSink,
    ) -> Result<PathBuf, DownloadError> {
        let url = normalize_target(target)?;
        let ytdlp = self
            .toolchain
            .ytdlp_path()
            .ok_or_else(|| DownloadError::MissingTool("yt-dlp".to_string()))?;
        let ffmpeg = self
            .toolchain
            .ffmpeg_location()
            .ok_or_else(|| DownloadError::MissingTool("ffmpeg".to_string()))?;
        let runtime = self.toolchain.locate_runtime().ok_or_else(|| {
            log::warn!("no JavaScript runtime found; refusing to start yt-dlp");
            DownloadError::MissingTool("JavaScript runtime".to_string())
        })?;
        let downloads_dir = self.toolchain.paths().downloads_dir.clone();
        fs::create_dir_all(&downloads_dir).map_err(|source| DownloadError::Io {
            context: "failed to create downloads dir".to_string(),
            source,
        })?;

        let arguments =
            RunArguments::build(&url, options, Some(&runtime), &ffmpeg, &downloads_dir);
        log::debug!("running {}", arguments.to_command_line(&ytdlp));
        sink.status("Starting download...");

        let (line_tx, line_rx) = mpsc::channel::<(OutputStream, String)>();
        let running = ProcessRunner::spawn(&ytdlp, arguments.tokens(), move |stream, line| {
            let _ = line_tx.send((stream, line.to_string()));
        })?;
        self.transition(DownloadState::Running);

        // Ends once both reader threads have dropped their sender.
        for (stream, line) in line_rx {
            if stream == OutputStream::Stderr {
                log::warn!("yt-dlp: {line}");
                continue;
            }
            match project_line(&line) {
                Some(LineProjection::Progress(sample)) => {
                    sink.progress(sample.whole_percent());
                    sink.status(&sample.status_line());
                }
                Some(LineProjection::Status(text)) => sink.status(&text),
                None => log::debug!("yt-dlp: {line}"),
            }
        }

        let exit = running.wait().map_err(|source| DownloadError::Io {
            context: "failed to wait for yt-dlp".to_string(),
            source,
        })?;
        if exit.success() {
            Ok(downloads_dir)
        } else {
            Err(DownloadError::RunFailure {
                code: exit.code,
                stderr: exit.stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(quality: Quality, format: ContainerFormat) -> DownloadOptions {
        DownloadOptions {
            content: ContentType::VideoAudio,
            quality,
            format,
        }
    }

    fn build(options: &DownloadOptions) -> Vec<String> {
        RunArguments::build(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            options,
            None,
            Path::new("/tools/ffmpeg_bin"),
            Path::new("/data/downloads"),
        )
        .tokens()
        .to_vec()
    }

    #[test]
    fn test_audio_only_suppresses_video_tokens() {
        for quality in [Quality::Best, Quality::MaxHeight(720), Quality::MaxHeight(2160)] {
            for format in [ContainerFormat::Mp4, ContainerFormat::Webm, ContainerFormat::Mkv] {
                let tokens = build(&DownloadOptions {
                    content: ContentType::AudioOnly,
                    quality,
                    format,
                });
                assert!(tokens.iter().all(|token| !token.contains("height<=")));
                assert!(!tokens.contains(&"--remux-video".to_string()));
                assert!(!tokens.contains(&"--merge-output-format".to_string()));
                assert_eq!(&tokens[..2], &["-f".to_string(), "bestaudio".to_string()]);
            }
        }
    }

    #[test]
    fn test_height_ceiling_and_remux() {
        let tokens = build(&video(Quality::MaxHeight(720), ContainerFormat::Mp4));
        assert_eq!(tokens[1], "bestvideo[height<=720]+bestaudio/best[height<=720]");
        assert_eq!(&tokens[2..4], &["--remux-video".to_string(), "mp4".to_string()]);
    }

    #[test]
    fn test_full_argument_order() {
        let runtime = ScriptRuntime {
            kind: RuntimeKind::Deno,
            path: PathBuf::from("/tools/deno"),
        };
        let arguments = RunArguments::build(
            "https://youtu.be/dQw4w9WgXcQ",
            &video(Quality::Best, ContainerFormat::Mkv),
            Some(&runtime),
            Path::new("/tools/ffmpeg_bin"),
            Path::new("/data/downloads"),
        );
        let expected = [
            "-f",
            "bestvideo+bestaudio/best",
            "--merge-output-format",
            "mkv",
            "--js-runtimes",
            "deno:/tools/deno",
            "--ffmpeg-location",
            "/tools/ffmpeg_bin",
            "--progress",
            "--newline",
            "-o",
            "/data/downloads/%(title)s.%(ext)s",
            "https://youtu.be/dQw4w9WgXcQ",
        ];
        assert_eq!(arguments.tokens(), &expected.map(String::from));
    }

    #[test]
    fn test_command_line_quotes_tokens_with_spaces() {
        let arguments = RunArguments::build(
            "https://youtu.be/dQw4w9WgXcQ",
            &video(Quality::Best, ContainerFormat::Webm),
            None,
            Path::new("/opt/my tools/ffmpeg"),
            Path::new("/data"),
        );
        let rendered = arguments.to_command_line(Path::new("/bin/yt-dlp"));
        assert!(rendered.starts_with("/bin/yt-dlp -f bestvideo+bestaudio/best --remux-video webm"));
        assert!(rendered.contains("--ffmpeg-location \"/opt/my tools/ffmpeg\""));
        assert_eq!(quote_token(""), "\"\"");
        assert_eq!(quote_token("say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn test_normalize_target_accepts_known_shapes() {
        let cases = [
            ("dQw4w9WgXcQ", "https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            ("youtu.be/dQw4w9WgXcQ", "https://youtu.be/dQw4w9WgXcQ"),
            ("www.youtube.com/watch?v=abc", "https://www.youtube.com/watch?v=abc"),
            ("m.youtube.com/watch?v=abc", "https://m.youtube.com/watch?v=abc"),
            ("//youtube.com/shorts/abc", "https://youtube.com/shorts/abc"),
            ("  https://music.youtube.com/watch?v=abc ", "https://music.youtube.com/watch?v=abc"),
            ("http://youtube.com/watch?v=abc", "http://youtube.com/watch?v=abc"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_target(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_normalize_target_rejects_other_hosts() {
        for input in [
            "",
            "   ",
            "https://vimeo.com/12345",
            "https://notyoutube.com/watch?v=abc",
            "https://youtube.com.evil.example/watch",
            "ftp://youtube.com/file",
            "short",
        ] {
            assert!(
                matches!(normalize_target(input), Err(DownloadError::InvalidTarget(_))),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_quality_and_format_labels() {
        assert_eq!(Quality::parse("Best"), Some(Quality::Best));
        assert_eq!(Quality::parse("4K"), Some(Quality::MaxHeight(2160)));
        assert_eq!(Quality::parse("1080p"), Some(Quality::MaxHeight(1080)));
        assert_eq!(Quality::parse("360"), Some(Quality::MaxHeight(360)));
        assert_eq!(Quality::parse("0p"), None);
        assert_eq!(Quality::parse("ultra"), None);
        assert_eq!(Quality::MaxHeight(480).label(), "480p");
        assert_eq!("mkv".parse::<ContainerFormat>(), Ok(ContainerFormat::Mkv));
        assert!("avi".parse::<ContainerFormat>().is_err());
    }

    #[test]
    fn test_channel_sink_delivers_events() {
        let (tx, rx) = mpsc::channel();
        tx.status("hello");
        tx.progress(42);
        tx.terminal(false, "boom");
        tx.ready();
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![
                DownloadEvent::Status("hello".to_string()),
                DownloadEvent::Progress(42),
                DownloadEvent::Terminal {
                    success: false,
                    detail: "boom".to_string()
                },
                DownloadEvent::Ready,
            ]
        );
    }

    struct UnusedReleases;

    impl ReleaseSource for UnusedReleases {
        fn resolve(&self, _query: &ReleaseQuery) -> Result<Option<ResolvedRelease>, ResolutionError> {
            Ok(None)
        }
    }

    struct UnusedArtifacts;

    impl ArtifactSource for UnusedArtifacts {
        fn fetch_to_file(
            &self,
            url: &str,
            _destination: &Path,
            _on_progress: &mut dyn FnMut(u64, u64),
        ) -> Result<u64, TransferError> {
            Err(TransferError::Network {
                url: url.to_string(),
                message: "offline".to_string(),
            })
        }

        fn fetch_text(&self, url: &str) -> Result<String, TransferError> {
            Err(TransferError::Network {
                url: url.to_string(),
                message: "offline".to_string(),
            })
        }
    }

    /// Sees only what the test places under `root`. The search path is an empty directory.
    fn offline_toolchain(root: &Path, runtime_preference: &str) -> Toolchain {
        let installer = DependencyInstaller::new(Arc::new(UnusedReleases), Arc::new(UnusedArtifacts));
        let paths = AppPaths::new(root.to_path_buf(), &Settings::default());
        let empty_path = root.join("empty_path");
        fs::create_dir_all(&empty_path).unwrap();
        Toolchain::with_installer(paths, Platform::current(), installer, runtime_preference)
            .with_search_path(empty_path)
    }

    #[cfg(unix)]
    fn install_fake_ytdlp(toolchain: &Toolchain, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let tools = &toolchain.paths().tools_dir;
        fs::create_dir_all(tools.join("ffmpeg_bin")).unwrap();
        let path = &toolchain.catalogue().ytdlp.install_path;
        fs::write(path, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn install_vendored_deno(toolchain: &Toolchain) -> PathBuf {
        let path = toolchain
            .paths()
            .tools_dir
            .join(Platform::current().executable("deno"));
        fs::write(&path, b"").unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_run_projects_progress_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = offline_toolchain(dir.path(), "auto");
        install_fake_ytdlp(
            &toolchain,
            r#"printf '%s\n' "$@" > "$(dirname "$0")/args.txt"
echo "[youtube] dQw4w9WgXcQ: Extracting URL"
echo "[info] dQw4w9WgXcQ: Downloading 1 format(s): 18"
echo "[download]  45.2% of 120.5MiB at 3.1MiB/s ETA 00:02:15"
echo "[download] 100% of 120.5MiB in 00:00:31 at 3.8MiB/s"
exit 0"#,
        );
        let deno = install_vendored_deno(&toolchain);
        let (tx, rx) = mpsc::channel();
        let mut orchestrator = DownloadOrchestrator::new(&toolchain);

        let saved = orchestrator
            .run(
                "dQw4w9WgXcQ",
                &video(Quality::MaxHeight(720), ContainerFormat::Mp4),
                &tx,
            )
            .unwrap();

        assert_eq!(saved, toolchain.paths().downloads_dir);
        assert!(saved.is_dir());
        assert_eq!(orchestrator.state(), DownloadState::Idle);
        let events = rx.try_iter().collect::<Vec<_>>();
        assert!(events.contains(&DownloadEvent::Status(
            "[info] dQw4w9WgXcQ: Downloading 1 format(s): 18".to_string()
        )));
        assert!(events.contains(&DownloadEvent::Progress(45)));
        assert!(events.contains(&DownloadEvent::Status(
            "Downloading: 45.2% of 120.5MiB at 3.1MiB/s, ETA 00:02:15".to_string()
        )));
        assert!(events.contains(&DownloadEvent::Progress(100)));
        let tail = &events[events.len() - 3..];
        assert!(matches!(tail[0], DownloadEvent::Terminal { success: true, .. }));
        assert_eq!(tail[1], DownloadEvent::Progress(0));
        assert_eq!(tail[2], DownloadEvent::Ready);

        let recorded = fs::read_to_string(toolchain.paths().tools_dir.join("args.txt")).unwrap();
        let recorded = recorded.lines().collect::<Vec<_>>();
        assert_eq!(recorded.last(), Some(&"https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(recorded.contains(&"bestvideo[height<=720]+bestaudio/best[height<=720]"));
        let runtime_flag = format!("deno:{}", deno.display());
        assert!(recorded.contains(&runtime_flag.as_str()));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_run_surfaces_stderr_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = offline_toolchain(dir.path(), "auto");
        install_fake_ytdlp(
            &toolchain,
            "echo 'ERROR: [youtube] dQw4w9WgXcQ: Video unavailable' >&2\nexit 1",
        );
        install_vendored_deno(&toolchain);
        let (tx, rx) = mpsc::channel();
        let mut orchestrator = DownloadOrchestrator::new(&toolchain);

        let result = orchestrator.run(
            "https://youtu.be/dQw4w9WgXcQ",
            &DownloadOptions::default(),
            &tx,
        );

        let expected = "ERROR: [youtube] dQw4w9WgXcQ: Video unavailable\n";
        match result {
            Err(DownloadError::RunFailure { code, stderr }) => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, expected);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(orchestrator.state(), DownloadState::Idle);
        let events = rx.try_iter().collect::<Vec<_>>();
        assert!(events.contains(&DownloadEvent::Terminal {
            success: false,
            detail: expected.to_string()
        }));
        assert_eq!(events.last(), Some(&DownloadEvent::Ready));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_runtime_blocks_launch() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = offline_toolchain(dir.path(), "deno");
        install_fake_ytdlp(&toolchain, r#"touch "$(dirname "$0")/launched""#);
        // Only node is vendored, which a deno preference filters out.
        fs::write(
            toolchain
                .paths()
                .tools_dir
                .join(Platform::current().executable("node")),
            b"",
        )
        .unwrap();
        let (tx, rx) = mpsc::channel();
        let mut orchestrator = DownloadOrchestrator::new(&toolchain);

        let result = orchestrator.run("dQw4w9WgXcQ", &DownloadOptions::default(), &tx);

        match result {
            Err(DownloadError::MissingTool(tool)) => assert_eq!(tool, "JavaScript runtime"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!toolchain.paths().tools_dir.join("launched").exists());
        let events = rx.try_iter().collect::<Vec<_>>();
        assert_eq!(
            events,
            vec![
                DownloadEvent::Terminal {
                    success: false,
                    detail: "JavaScript runtime is not available".to_string()
                },
                DownloadEvent::Progress(0),
                DownloadEvent::Ready,
            ]
        );
        assert_eq!(orchestrator.state(), DownloadState::Idle);
    }

    #[test]
    fn test_missing_ytdlp_fails_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = offline_toolchain(dir.path(), "auto");
        let (tx, rx) = mpsc::channel();
        let mut orchestrator = DownloadOrchestrator::new(&toolchain);

        let result = orchestrator.run("dQw4w9WgXcQ", &DownloadOptions::default(), &tx);

        match result {
            Err(DownloadError::MissingTool(tool)) => assert_eq!(tool, "yt-dlp"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!toolchain.paths().downloads_dir.exists());
        let events = rx.try_iter().collect::<Vec<_>>();
        assert_eq!(
            events,
            vec![
                DownloadEvent::Terminal {
                    success: false,
                    detail: "yt-dlp is not available".to_string()
                },
                DownloadEvent::Progress(0),
                DownloadEvent::Ready,
            ]
        );
    }

    #[test]
    fn test_invalid_target_still_resets_controls() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = offline_toolchain(dir.path(), "auto");
        let (tx, rx) = mpsc::channel();
        let mut orchestrator = DownloadOrchestrator::new(&toolchain);

        let result = orchestrator.run("https://vimeo.com/1", &DownloadOptions::default(), &tx);

        assert!(matches!(result, Err(DownloadError::InvalidTarget(_))));
        let events = rx.try_iter().collect::<Vec<_>>();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], DownloadEvent::Terminal { success: false, .. }));
        assert_eq!(events[1], DownloadEvent::Progress(0));
        assert_eq!(events[2], DownloadEvent::Ready);
        assert_eq!(orchestrator.state(), DownloadState::Idle);
    }
}
