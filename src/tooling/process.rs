// External process execution with line-by-line output streaming.
use super::*;
use std::process::Child;
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Everything the process wrote to stderr.
    pub stderr: String,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Reads one `\n`-terminated line. `raw_buffer` keeps the bytes as read; the returned
/// text has trailing line breaks removed and invalid UTF-8 replaced.
pub(super) fn read_lossy_process_line<R: BufRead>(
    reader: &mut R,
    raw_buffer: &mut Vec<u8>,
) -> Result<Option<String>, std::io::Error> {
    raw_buffer.clear();
    let bytes_read = reader.read_until(b'\n', raw_buffer)?;
    if bytes_read == 0 {
        return Ok(None);
    }
    let mut end = raw_buffer.len();
    while end > 0 && matches!(raw_buffer[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    Ok(Some(String::from_utf8_lossy(&raw_buffer[..end]).to_string()))
}

type LineHandler = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    stream: OutputStream,
    on_line: LineHandler,
    capture: Option<Arc<Mutex<Vec<u8>>>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut raw_buffer = Vec::new();
        loop {
            match read_lossy_process_line(&mut reader, &mut raw_buffer) {
                Ok(Some(line)) => {
                    if let Some(capture) = capture.as_ref() {
                        if let Ok(mut captured) = capture.lock() {
                            captured.extend_from_slice(&raw_buffer);
                        }
                    }
                    on_line(stream, &line);
                }
                Ok(None) => break,
                Err(error) => {
                    log::warn!("failed to read process {stream:?}: {error}");
                    break;
                }
            }
        }
    })
}

/// A started child process whose output is being read on background threads.
pub struct RunningProcess {
    program: PathBuf,
    child: Child,
    readers: Vec<JoinHandle<()>>,
    stderr_capture: Arc<Mutex<Vec<u8>>>,
}

impl RunningProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Blocks until the process exits and every output line has been delivered.
    pub fn wait(mut self) -> Result<ProcessExit, std::io::Error> {
        let status = self.child.wait()?;
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                log::warn!("output reader for {} panicked", self.program.display());
            }
        }
        let stderr = self
            .stderr_capture
            .lock()
            .map(|captured| String::from_utf8_lossy(&captured).to_string())
            .unwrap_or_default();
        log::debug!("{} exited with {status}", self.program.display());
        Ok(ProcessExit {
            code: status.code(),
            stderr,
        })
    }
}

pub struct ProcessRunner;

impl ProcessRunner {
    /// Starts `program` with stdout and stderr piped. `on_line` runs on reader threads;
    /// lines of one stream arrive in write order, with no ordering across streams.
    pub fn spawn<F>(program: &Path, args: &[String], on_line: F) -> Result<RunningProcess, LaunchError>
    where
        F: Fn(OutputStream, &str) + Send + Sync + 'static,
    {
        let mut child = hidden_command(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError {
                program: program.to_path_buf(),
                source,
            })?;
        log::info!("started {} (pid {})", program.display(), child.id());

        let on_line: LineHandler = Arc::new(on_line);
        let stderr_capture = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, Arc::clone(&on_line), None));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                OutputStream::Stderr,
                on_line,
                Some(Arc::clone(&stderr_capture)),
            ));
        }

        Ok(RunningProcess {
            program: program.to_path_buf(),
            child,
            readers,
            stderr_capture,
        })
    }

    pub fn run<F>(program: &Path, args: &[String], on_line: F) -> Result<ProcessExit, DownloadError>
    where
        F: Fn(OutputStream, &str) + Send + Sync + 'static,
    {
        Self::spawn(program, args, on_line)?
            .wait()
            .map_err(|source| DownloadError::Io {
                context: format!("failed to wait for {}", program.display()),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_read_lossy_line_strips_line_endings() {
        let mut reader = BufReader::new(&b"first\r\nsecond\n\xffthird"[..]);
        let mut raw = Vec::new();
        assert_eq!(
            read_lossy_process_line(&mut reader, &mut raw).unwrap().as_deref(),
            Some("first")
        );
        assert_eq!(raw, b"first\r\n");
        assert_eq!(
            read_lossy_process_line(&mut reader, &mut raw).unwrap().as_deref(),
            Some("second")
        );
        assert_eq!(
            read_lossy_process_line(&mut reader, &mut raw).unwrap().as_deref(),
            Some("\u{fffd}third")
        );
        assert_eq!(read_lossy_process_line(&mut reader, &mut raw).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_stdout_lines_arrive_in_order() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let exit = ProcessRunner::run(
            Path::new("/bin/sh"),
            &shell("for i in 1 2 3 4 5; do echo line-$i; done"),
            move |stream, line| sink.lock().unwrap().push((stream, line.to_string())),
        )
        .unwrap();

        assert!(exit.success());
        let collected = lines.lock().unwrap().clone();
        let expected = (1..=5)
            .map(|i| (OutputStream::Stdout, format!("line-{i}")))
            .collect::<Vec<_>>();
        assert_eq!(collected, expected);
    }

    #[cfg(unix)]
    #[test]
    fn test_stderr_is_captured_verbatim_on_failure() {
        let exit = ProcessRunner::run(
            Path::new("/bin/sh"),
            &shell("echo progress; printf 'ERROR: boom\\n  detail line\\n' >&2; exit 3"),
            |_, _| {},
        )
        .unwrap();

        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        assert_eq!(exit.stderr, "ERROR: boom\n  detail line\n");
    }

    #[test]
    fn test_missing_executable_is_launch_error() {
        let result = ProcessRunner::spawn(
            Path::new("/definitely/not/here/yt-dlp"),
            &[],
            |_, _| {},
        );
        let Err(error) = result else {
            panic!("spawn should fail");
        };
        assert_eq!(error.program, PathBuf::from("/definitely/not/here/yt-dlp"));
    }
}
