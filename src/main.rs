use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use tubefetch::{
    load_settings, save_settings, AppPaths, ContainerFormat, ContentType, DependencyReport, DownloadError,
    DownloadEvent, DownloadOptions, DownloadOrchestrator, Quality, Settings, SettingsError, StatusSink,
    ToolSource, Toolchain,
};

#[derive(Parser)]
#[command(name = "tubefetch", version, about = "Download YouTube media with a managed yt-dlp")]
struct Cli {
    /// Application directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install any missing dependencies
    Setup,
    /// Update managed dependencies to their latest releases
    Update,
    /// Show where each tool comes from
    Status,
    /// Download a video or its audio track
    Download {
        /// Video URL or 11-character video id
        target: String,
        #[arg(long)]
        audio_only: bool,
        /// best, 4k, 1080p, 720p, 480p, 360p, 240p
        #[arg(short, long)]
        quality: Option<Quality>,
        /// mp4, webm or mkv
        #[arg(short, long)]
        format: Option<ContainerFormat>,
    },
    /// Show the saved settings, or change them
    Config {
        /// Directory for managed tools (empty resets to the default)
        #[arg(long)]
        tools_dir: Option<String>,
        /// Directory for finished downloads (empty resets to the default)
        #[arg(long)]
        downloads_dir: Option<String>,
        #[arg(long, value_parser = ["auto", "deno", "node"])]
        runtime: Option<String>,
        /// Default quality for `download`
        #[arg(long)]
        quality: Option<Quality>,
        /// Default container for `download`
        #[arg(long)]
        format: Option<ContainerFormat>,
        #[arg(long)]
        verify_checksums: Option<bool>,
    },
}

#[derive(Default)]
struct SettingsChanges {
    tools_dir: Option<String>,
    downloads_dir: Option<String>,
    runtime: Option<String>,
    quality: Option<Quality>,
    format: Option<ContainerFormat>,
    verify_checksums: Option<bool>,
}

impl SettingsChanges {
    fn is_empty(&self) -> bool {
        self.tools_dir.is_none()
            && self.downloads_dir.is_none()
            && self.runtime.is_none()
            && self.quality.is_none()
            && self.format.is_none()
            && self.verify_checksums.is_none()
    }

    fn apply(self, mut settings: Settings) -> Settings {
        if let Some(dir) = self.tools_dir {
            settings.tools_dir = Some(dir);
        }
        if let Some(dir) = self.downloads_dir {
            settings.downloads_dir = Some(dir);
        }
        if let Some(runtime) = self.runtime {
            settings.runtime_preference = runtime;
        }
        if let Some(quality) = self.quality {
            settings.default_quality = quality.label();
        }
        if let Some(format) = self.format {
            settings.default_format = format.as_str().to_string();
        }
        if let Some(verify) = self.verify_checksums {
            settings.verify_checksums = verify;
        }
        settings
    }
}

struct ConsoleSink;

impl StatusSink for ConsoleSink {
    fn status(&self, text: &str) {
        eprintln!("{text}");
    }

    fn progress(&self, _percent: u8) {}

    fn terminal(&self, success: bool, detail: &str) {
        if success {
            println!("{detail}");
        } else {
            eprintln!("{detail}");
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug,ureq=info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ureq=warn"))
    };
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn report_all(reports: &[DependencyReport]) -> ExitCode {
    let failed = reports.iter().filter(|report| report.result.is_err()).count();
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        eprintln!("{failed} dependency step(s) failed");
        ExitCode::FAILURE
    }
}

fn print_status(toolchain: &Toolchain) {
    println!("tools:     {}", toolchain.paths().tools_dir.display());
    println!("downloads: {}", toolchain.paths().downloads_dir.display());
    for status in toolchain.status() {
        let source = match status.source {
            ToolSource::Managed => "managed",
            ToolSource::System => "system",
            ToolSource::Missing => "missing",
        };
        let path = status
            .path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        let version = status.version.unwrap_or_else(|| "-".to_string());
        println!("{:<8} {:<8} {:<14} {path}", status.name, source, version);
    }
}

fn download(toolchain: &Toolchain, target: &str, options: DownloadOptions) -> ExitCode {
    let (tx, rx) = mpsc::channel::<DownloadEvent>();
    let console = ConsoleSink;
    let result = thread::scope(|scope| {
        let worker = scope.spawn(move || {
            let mut orchestrator = DownloadOrchestrator::new(toolchain);
            orchestrator.run(target, &options, &tx)
        });
        let mut last_status = String::new();
        for event in rx {
            match event {
                DownloadEvent::Status(text) => {
                    if text != last_status {
                        console.status(&text);
                        last_status = text;
                    }
                }
                DownloadEvent::Progress(percent) => console.progress(percent),
                DownloadEvent::Terminal { success, detail } => console.terminal(success, &detail),
                DownloadEvent::Ready => break,
            }
        }
        worker.join()
    });
    match result {
        Ok(Ok(_)) => ExitCode::SUCCESS,
        Ok(Err(DownloadError::RunFailure { code, .. })) => {
            eprintln!("yt-dlp exited with {}", code.map_or("a signal".to_string(), |c| c.to_string()));
            ExitCode::FAILURE
        }
        Ok(Err(_)) => ExitCode::FAILURE,
        Err(_) => {
            eprintln!("download worker panicked");
            ExitCode::FAILURE
        }
    }
}

/// Saves `changes` over `settings` when there are any. Returns what is now in effect.
fn configure(
    root: &Path,
    settings: Settings,
    changes: SettingsChanges,
) -> Result<Settings, SettingsError> {
    if changes.is_empty() {
        return Ok(settings);
    }
    let saved = save_settings(root, changes.apply(settings))?;
    log::info!("settings saved under {}", root.display());
    Ok(saved)
}

fn print_settings(result: Result<Settings, SettingsError>) -> ExitCode {
    let printed = result.and_then(|settings| Ok(serde_json::to_string_pretty(&settings)?));
    match printed {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let root = AppPaths::default_root(cli.home);
    let settings = match load_settings(&root) {
        Ok(settings) => settings,
        Err(error) => {
            log::warn!("{error}; using default settings");
            Settings::default()
        }
    };
    let paths = AppPaths::new(root.clone(), &settings);
    let toolchain = Toolchain::new(paths, &settings);

    match cli.command {
        Commands::Setup => report_all(&toolchain.bootstrap(&ConsoleSink)),
        Commands::Update => report_all(&toolchain.update(&ConsoleSink)),
        Commands::Status => {
            print_status(&toolchain);
            ExitCode::SUCCESS
        }
        Commands::Download {
            target,
            audio_only,
            quality,
            format,
        } => {
            let options = DownloadOptions {
                content: if audio_only {
                    ContentType::AudioOnly
                } else {
                    ContentType::VideoAudio
                },
                quality: quality
                    .or_else(|| Quality::parse(&settings.default_quality))
                    .unwrap_or_default(),
                format: format
                    .or_else(|| ContainerFormat::parse(&settings.default_format))
                    .unwrap_or_default(),
            };
            download(&toolchain, &target, options)
        }
        Commands::Config {
            tools_dir,
            downloads_dir,
            runtime,
            quality,
            format,
            verify_checksums,
        } => {
            let changes = SettingsChanges {
                tools_dir,
                downloads_dir,
                runtime,
                quality,
                format,
                verify_checksums,
            };
            print_settings(configure(&root, settings, changes))
        }
    }
}
