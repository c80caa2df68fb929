// Progress extraction from the downloader's `--progress --newline` output.
use regex::Regex;
use std::sync::OnceLock;

pub const PROGRESS_MARKER: &str = "[download]";
const INFO_MARKER: &str = "[info]";
const DOWNLOADING_HINT: &str = "Downloading";

fn percent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(-?[0-9]+(?:\.[0-9]+)?)%").expect("percent pattern"))
}

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"of\s+~?\s*([0-9.]+)(GiB|MiB|KiB|B)\b").expect("size pattern")
    })
}

fn speed_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"at\s+([0-9.]+)(GiB|MiB|KiB|B)/s").expect("speed pattern"))
}

fn eta_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"ETA\s+([0-9]{2}:[0-9]{2}:[0-9]{2}|[0-9]{2}:[0-9]{2})").expect("eta pattern")
    })
}

/// One parsed progress line. Absent fields stay `None`; they are never filled with
/// placeholder values.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    /// Always within `0.0..=100.0`.
    pub percent: f64,
    pub size: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

impl ProgressSample {
    /// Whole-number percentage for progress bars. Truncates, so 100 means finished.
    pub fn whole_percent(&self) -> u8 {
        self.percent.floor().clamp(0.0, 100.0) as u8
    }

    pub fn status_line(&self) -> String {
        let mut text = format!("Downloading: {:.1}%", self.percent);
        if let Some(size) = &self.size {
            text.push_str(&format!(" of {size}"));
        }
        if let Some(speed) = &self.speed {
            text.push_str(&format!(" at {speed}"));
        }
        if let Some(eta) = &self.eta {
            text.push_str(&format!(", ETA {eta}"));
        }
        text
    }
}

fn clamp_percent(raw: &str) -> f64 {
    let value = raw.parse::<f64>().unwrap_or(0.0);
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Parses a progress line. Lines without the `[download]` marker, and marker lines
/// where no field could be extracted, yield `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    if !line.contains(PROGRESS_MARKER) {
        return None;
    }
    let percent = percent_pattern()
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str());
    let size = size_pattern()
        .captures(line)
        .map(|captures| format!("{}{}", &captures[1], &captures[2]));
    let speed = speed_pattern()
        .captures(line)
        .map(|captures| format!("{}{}/s", &captures[1], &captures[2]));
    let eta = eta_pattern()
        .captures(line)
        .map(|captures| captures[1].to_string());

    if percent.is_none() && size.is_none() && speed.is_none() && eta.is_none() {
        return None;
    }
    Some(ProgressSample {
        percent: percent.map(clamp_percent).unwrap_or(0.0),
        size,
        speed,
        eta,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineProjection {
    Progress(ProgressSample),
    Status(String),
}

/// Maps one output line to what the status sink should show, if anything.
pub fn project_line(line: &str) -> Option<LineProjection> {
    if let Some(sample) = parse_progress_line(line) {
        return Some(LineProjection::Progress(sample));
    }
    let trimmed = line.trim();
    if trimmed.contains(INFO_MARKER) || trimmed.contains(DOWNLOADING_HINT) {
        return Some(LineProjection::Status(trimmed.to_string()));
    }
    None
}
