use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use directories::BaseDirs;
use regex::Regex;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::backend::{Backend, Payload, Readiness};
use crate::config::{Credentials, ENV_ANNAS_BASE_URL, ENV_ANNAS_DOWNLOAD_PATH, ENV_ANNAS_KEY};
use crate::domain::{BookRecord, DownloadRequest, InfoResult, SearchQuery, Source};
use crate::error::BookError;
use crate::normalize;

pub const BINARY_NAME: &str = "annas-mcp";
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

static QUOTA_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(quota|rate[- ]limit(ed)?|limit (reached|exceeded)|too many requests|429)\b",
    )
    .expect("valid regex")
});

static AUTH_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(invalid (secret )?key|unauthori[sz]ed|forbidden|401|403)\b")
        .expect("valid regex")
});

/// One search hit as printed by `annas-mcp search`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnasListing {
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub format: Option<String>,
    pub size: Option<String>,
    pub url: Option<String>,
    pub hash: Option<String>,
}

impl AnnasListing {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    Launch(String),
    Timeout(Duration),
}

/// The `annas-mcp` executable, or a stand-in for it.
pub trait AnnasTool {
    fn binary(&self) -> Option<PathBuf>;
    fn run(
        &self,
        args: &[String],
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<ToolOutput, ToolFailure>;
}

#[derive(Debug, Clone)]
pub struct SystemAnnasTool {
    binary: Option<PathBuf>,
}

impl SystemAnnasTool {
    pub fn new(configured: Option<&str>) -> Self {
        Self {
            binary: find_binary(configured),
        }
    }
}

impl AnnasTool for SystemAnnasTool {
    fn binary(&self) -> Option<PathBuf> {
        self.binary.clone()
    }

    fn run(
        &self,
        args: &[String],
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<ToolOutput, ToolFailure> {
        let program = self
            .binary
            .as_ref()
            .ok_or_else(|| ToolFailure::Launch(format!("{BINARY_NAME} not found")))?;
        run_with_timeout(program, args, env, timeout)
    }
}

fn run_with_timeout(
    program: &Path,
    args: &[String],
    env: &[(String, String)],
    timeout: Duration,
) -> Result<ToolOutput, ToolFailure> {
    let mut child = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| ToolFailure::Launch(err.to_string()))?;

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                terminate(&mut child);
                return Err(ToolFailure::Timeout(timeout));
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(err) => {
                terminate(&mut child);
                return Err(ToolFailure::Launch(err.to_string()));
            }
        }
    };

    let collect = |handle: Option<thread::JoinHandle<String>>| {
        handle
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };
    Ok(ToolOutput {
        success: status.success(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

/// Kills and reaps `child` so no process outlives a failed run.
fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// Configured path first, then `PATH`, then the usual install locations.
pub fn find_binary(configured: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = configured.map(PathBuf::from) {
        if path.is_file() {
            return Some(path);
        }
        debug!(path = %path.display(), "configured annas binary does not exist");
    }
    if let Some(path) = find_in_path(BINARY_NAME) {
        return Some(path);
    }
    let mut fallbacks = Vec::new();
    if let Some(dirs) = BaseDirs::new() {
        fallbacks.push(dirs.home_dir().join(".local").join("bin").join(BINARY_NAME));
    }
    fallbacks.push(PathBuf::from("/usr/local/bin").join(BINARY_NAME));
    fallbacks.into_iter().find(|path| path.is_file())
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

/// Parses the plain-text block format of `annas-mcp search`.
///
/// A `Title:` line opens a record and a blank line closes it. Lines that carry
/// no known prefix are ignored.
pub fn parse_search_output(text: &str) -> Vec<AnnasListing> {
    let mut listings = Vec::new();
    let mut current = AnnasListing::default();

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !current.is_empty() {
                listings.push(std::mem::take(&mut current));
            }
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = Some(value.trim().to_string());
        match key.trim() {
            "Title" => {
                if !current.is_empty() {
                    listings.push(std::mem::take(&mut current));
                }
                current.title = value;
            }
            "Authors" | "Author" => current.author = value,
            "Publisher" => current.publisher = value,
            "Language" => current.language = value,
            "Format" => current.format = value,
            "Size" => current.size = value,
            "URL" => current.url = value,
            "Hash" | "MD5" => current.hash = value,
            _ => {}
        }
    }
    if !current.is_empty() {
        listings.push(current);
    }
    listings
}

/// Picks the line of tool stderr that best explains a failure.
pub fn extract_error(stderr: &str) -> String {
    for line in stderr.lines().rev().map(str::trim) {
        if line.starts_with("Failed to") {
            return line.to_string();
        }
        if line.contains("ERROR") && line.contains("environment variables must be set") {
            return format!("{ENV_ANNAS_KEY} and {ENV_ANNAS_DOWNLOAD_PATH} must be set");
        }
    }
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("unknown error")
        .to_string()
}

pub fn default_filename(hash: &str) -> String {
    let prefix: String = hash.chars().take(8).collect();
    format!("book_{prefix}.pdf")
}

/// Reads a file out of a staging directory that is removed once dropped.
struct StagedFile {
    file: File,
    _dir: TempDir,
}

impl Read for StagedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

pub struct AnnasBackend<T: AnnasTool> {
    tool: T,
    credentials: Credentials,
}

impl<T: AnnasTool> AnnasBackend<T> {
    pub fn new(tool: T, credentials: Credentials) -> Self {
        Self { tool, credentials }
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    fn environment(&self, download_path: &Path) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(key) = &self.credentials.api_key {
            env.push((ENV_ANNAS_KEY.to_string(), key.clone()));
        }
        env.push((
            ENV_ANNAS_DOWNLOAD_PATH.to_string(),
            download_path.to_string_lossy().into_owned(),
        ));
        if let Some(mirror) = &self.credentials.mirror_url {
            env.push((ENV_ANNAS_BASE_URL.to_string(), mirror.clone()));
        }
        env
    }

    fn invoke(
        &self,
        args: Vec<String>,
        download_path: &Path,
        timeout: Duration,
    ) -> Result<ToolOutput, BookError> {
        info!(command = %args[0], "running {BINARY_NAME}");
        let output = self
            .tool
            .run(&args, &self.environment(download_path), timeout)
            .map_err(|failure| match failure {
                ToolFailure::Launch(detail) => BookError::Unavailable {
                    backend: Source::Annas,
                    message: format!("could not start {BINARY_NAME}"),
                    detail: Some(detail),
                },
                ToolFailure::Timeout(limit) => BookError::Unavailable {
                    backend: Source::Annas,
                    message: format!("{BINARY_NAME} {} timed out after {}s", args[0], limit.as_secs()),
                    detail: None,
                },
            })?;
        if output.success {
            return Ok(output);
        }
        Err(classify_failure(&args[0], extract_error(&output.stderr)))
    }
}

fn classify_failure(command: &str, detail: String) -> BookError {
    if QUOTA_FAILURE.is_match(&detail) {
        BookError::QuotaExceeded {
            backend: Source::Annas,
            detail: Some(detail),
        }
    } else if AUTH_FAILURE.is_match(&detail) {
        BookError::AuthFailed {
            backend: Source::Annas,
            detail: Some(detail),
        }
    } else {
        BookError::Unavailable {
            backend: Source::Annas,
            message: format!("{BINARY_NAME} {command} failed"),
            detail: Some(detail),
        }
    }
}

fn locate_download(dir: &Path, filename: &str) -> Option<PathBuf> {
    let expected = dir.join(filename);
    if expected.is_file() {
        return Some(expected);
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    if files.len() == 1 { files.pop() } else { None }
}

impl<T: AnnasTool> Backend for AnnasBackend<T> {
    fn source(&self) -> Source {
        Source::Annas
    }

    fn readiness(&self) -> Readiness {
        let binary = self.tool.binary();
        let api_key_configured = self.credentials.api_key.is_some();
        let mut readiness = Readiness::new(binary.is_some() && api_key_configured)
            .flag("binary_found", binary.is_some())
            .flag("api_key_configured", api_key_configured);
        if let Some(path) = binary {
            readiness = readiness.flag("binary_path", path.to_string_lossy().into_owned());
        }
        readiness
    }

    fn ensure_configured(&self) -> Result<(), BookError> {
        if self.tool.binary().is_none() {
            return Err(BookError::NotConfigured {
                backend: Source::Annas,
                message: format!("{BINARY_NAME} binary not found"),
                hint: [
                    "install it from https://github.com/iosifache/annas-mcp/releases",
                    "into ~/.local/bin/annas-mcp, or run:",
                    "  book config set --annas-binary /path/to/annas-mcp",
                ]
                .join("\n"),
            });
        }
        if self.credentials.api_key.is_none() {
            return Err(BookError::NotConfigured {
                backend: Source::Annas,
                message: "API key is not set".to_string(),
                hint: "book config set --annas-key <key> (keys are issued to donors)".to_string(),
            });
        }
        Ok(())
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<BookRecord>, BookError> {
        query.validate()?;
        self.ensure_configured()?;
        let workdir = std::env::temp_dir();
        let output = self.invoke(
            vec!["search".to_string(), query.text.clone()],
            &workdir,
            SEARCH_TIMEOUT,
        )?;
        if output.stdout.contains("No books found") {
            return Ok(Vec::new());
        }
        let mut records = normalize::annas_records(parse_search_output(&output.stdout));
        if let Some(limit) = query.limit {
            records.truncate(limit as usize);
        }
        debug!(count = records.len(), "annas search returned");
        Ok(records)
    }

    fn info(&self, _id: &str, _hash: &str) -> Result<InfoResult, BookError> {
        Err(BookError::Invalid(
            "info is only available with --source zlib".to_string(),
        ))
    }

    fn fetch(&self, request: &DownloadRequest) -> Result<Payload, BookError> {
        request.validate(Source::Annas)?;
        self.ensure_configured()?;
        let filename = request
            .filename
            .clone()
            .unwrap_or_else(|| default_filename(&request.hash));
        let staging = tempfile::Builder::new()
            .prefix("book-tools-annas")
            .tempdir()
            .map_err(|err| BookError::Filesystem(err.to_string()))?;

        self.invoke(
            vec!["download".to_string(), request.hash.clone(), filename.clone()],
            staging.path(),
            DOWNLOAD_TIMEOUT,
        )?;

        let path = locate_download(staging.path(), &filename).ok_or_else(|| {
            BookError::unavailable(Source::Annas, format!("{BINARY_NAME} produced no file"))
        })?;
        let file = File::open(&path).map_err(|err| BookError::Filesystem(err.to_string()))?;
        let expected_len = file.metadata().ok().map(|meta| meta.len());
        Ok(Payload::new(StagedFile {
            file,
            _dir: staging,
        })
        .with_filename(filename)
        .with_expected_len(expected_len))
    }
}
