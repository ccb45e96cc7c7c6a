//! Append-only deployment log files.
//!
//! Every deployment owns one log file, addressed by an opaque path stored on
//! the deployment record. The executor is the single writer; any number of
//! readers may read or follow a file while it grows. Each line carries an
//! RFC 3339 timestamp prefix so readers can apply a relative time window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

pub type LogLines = Pin<Box<dyn Stream<Item = String> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log path is outside the log directory: {0}")]
    InvalidPath(String),
    #[error("log file not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Relative time window applied to log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SinceFilter {
    #[default]
    All,
    Hour,
    SixHours,
    Day,
    Week,
    Month,
}

impl SinceFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Hour => "1h",
            Self::SixHours => "6h",
            Self::Day => "24h",
            Self::Week => "168h",
            Self::Month => "720h",
        }
    }

    fn window(&self) -> Option<ChronoDuration> {
        let hours = match self {
            Self::All => return None,
            Self::Hour => 1,
            Self::SixHours => 6,
            Self::Day => 24,
            Self::Week => 168,
            Self::Month => 720,
        };
        Some(ChronoDuration::hours(hours))
    }

    /// Earliest timestamp admitted by this window, `None` for `all`
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window().map(|w| now - w)
    }
}

impl std::str::FromStr for SinceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "1h" => Ok(Self::Hour),
            "6h" => Ok(Self::SixHours),
            "24h" => Ok(Self::Day),
            "168h" => Ok(Self::Week),
            "720h" => Ok(Self::Month),
            other => Err(format!(
                "invalid since filter '{}', expected one of all, 1h, 6h, 24h, 168h, 720h",
                other
            )),
        }
    }
}

impl TryFrom<String> for SinceFilter {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SinceFilter> for String {
    fn from(value: SinceFilter) -> Self {
        value.as_str().to_string()
    }
}

/// How a read shapes and filters lines
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub since: SinceFilter,
    pub with_timestamps: bool,
    /// Plain-text substring a line must contain
    pub search: Option<String>,
}

/// A log line split into its timestamp prefix and text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry<'a> {
    pub timestamp: Option<DateTime<Utc>>,
    pub text: &'a str,
}

pub fn parse_line(raw: &str) -> LogEntry<'_> {
    if let Some((head, rest)) = raw.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(head) {
            return LogEntry {
                timestamp: Some(ts.with_timezone(&Utc)),
                text: rest,
            };
        }
    }
    LogEntry {
        timestamp: None,
        text: raw,
    }
}

/// Apply the window and shaping rules to one raw line
fn select_line(raw: &str, cutoff: Option<DateTime<Utc>>, opts: &ReadOptions) -> Option<String> {
    let entry = parse_line(raw);
    if let Some(cutoff) = cutoff {
        match entry.timestamp {
            Some(ts) if ts >= cutoff => {}
            _ => return None,
        }
    }
    if let Some(needle) = opts.search.as_deref() {
        if !needle.is_empty() && !entry.text.contains(needle) {
            return None;
        }
    }
    if opts.with_timestamps {
        Some(raw.to_string())
    } else {
        Some(entry.text.to_string())
    }
}

/// File-backed log sink rooted at a single directory
#[derive(Debug, Clone)]
pub struct LogSink {
    root: PathBuf,
}

impl LogSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate the path for a new deployment's log
    pub fn path_for(&self, app_name: &str, deployment_id: &str) -> String {
        let stamp = Utc::now().format("%Y-%m-%d-%H-%M-%S");
        let short = deployment_id.split('-').next().unwrap_or(deployment_id);
        self.root
            .join(app_name)
            .join(format!("{}-{}-{}.log", app_name, stamp, short))
            .to_string_lossy()
            .to_string()
    }

    /// Resolve an opaque log path, rejecting anything outside the root
    pub fn resolve(&self, log_path: &str) -> Result<PathBuf, LogError> {
        let candidate = Path::new(log_path);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(LogError::InvalidPath(log_path.to_string()));
        }
        let resolved = if candidate.is_absolute() || candidate.starts_with(&self.root) {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        if !resolved.starts_with(&self.root) {
            return Err(LogError::InvalidPath(log_path.to_string()));
        }
        Ok(resolved)
    }

    /// The form a log path is stored in on its deployment record
    pub fn canonical_path(&self, log_path: &str) -> Result<String, LogError> {
        Ok(self.resolve(log_path)?.to_string_lossy().into_owned())
    }

    /// Append a line, stamping it with the current time
    pub async fn append(&self, log_path: &str, line: &str) -> Result<(), LogError> {
        self.append_at(log_path, Utc::now(), line).await
    }

    pub async fn append_at(
        &self,
        log_path: &str,
        at: DateTime<Utc>,
        line: &str,
    ) -> Result<(), LogError> {
        let path = self.resolve(log_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stamp = at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let mut buf = String::new();
        for part in line.lines() {
            buf.push_str(&stamp);
            buf.push(' ');
            buf.push_str(part);
            buf.push('\n');
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        // One write per call so concurrent readers only ever see whole lines
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Lazily read the lines currently in the file
    pub async fn read(&self, log_path: &str, opts: ReadOptions) -> Result<LogLines, LogError> {
        let path = self.resolve(log_path)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LogError::NotFound(log_path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let cutoff = opts.since.cutoff(Utc::now());
        let log_path = log_path.to_string();
        let stream = async_stream::stream! {
            let mut reader = BufReader::new(file);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = decode_line(&buf);
                        if let Some(out) = select_line(&line, cutoff, &opts) {
                            yield out;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(log_path = %log_path, error = %e, "Log read stopped early");
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Collect a read into memory
    pub async fn read_to_vec(&self, log_path: &str, opts: ReadOptions) -> Result<Vec<String>, LogError> {
        use futures::StreamExt;
        let lines = self.read(log_path, opts).await?;
        Ok(lines.collect().await)
    }

    /// Tail a log until `is_active` reports the owner finished.
    ///
    /// Existing lines are replayed first, then the file is polled for growth.
    /// A missing file is treated as empty until the writer creates it.
    pub fn follow<F, Fut>(
        &self,
        log_path: &str,
        opts: ReadOptions,
        poll: Duration,
        is_active: F,
    ) -> Result<LogLines, LogError>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let path = self.resolve(log_path)?;
        let cutoff = opts.since.cutoff(Utc::now());

        let stream = async_stream::stream! {
            let mut offset: u64 = 0;
            let mut pending: Vec<u8> = Vec::new();
            loop {
                // Sample liveness before draining so the final lines are not lost
                let active = is_active().await;

                match read_from(&path, offset).await {
                    Ok(chunk) => {
                        offset += chunk.len() as u64;
                        pending.extend_from_slice(&chunk);
                        // Split on raw bytes so a character cut across polls stays intact
                        while let Some(idx) = pending.iter().position(|b| *b == b'\n') {
                            let raw: Vec<u8> = pending.drain(..=idx).collect();
                            let line = decode_line(&raw);
                            if let Some(out) = select_line(&line, cutoff, &opts) {
                                yield out;
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Log tail read failed");
                    }
                }

                if !active {
                    break;
                }
                tokio::time::sleep(poll).await;
            }
        };
        Ok(Box::pin(stream))
    }

    /// Remove every log belonging to a service
    pub async fn remove_service_logs(&self, app_name: &str) -> Result<(), LogError> {
        let dir = self.resolve(app_name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One raw line without its terminator; invalid UTF-8 is replaced, not fatal
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sink() -> (LogSink, TempDir) {
        let dir = TempDir::new().unwrap();
        (LogSink::new(dir.path()), dir)
    }

    #[test]
    fn test_since_filter_parsing() {
        assert_eq!("all".parse::<SinceFilter>().unwrap(), SinceFilter::All);
        assert_eq!("168h".parse::<SinceFilter>().unwrap(), SinceFilter::Week);
        assert!("2h".parse::<SinceFilter>().is_err());
        assert_eq!(SinceFilter::Month.as_str(), "720h");
    }

    #[test]
    fn test_parse_line_with_and_without_timestamp() {
        let entry = parse_line("2026-01-02T03:04:05.000Z Building image");
        assert!(entry.timestamp.is_some());
        assert_eq!(entry.text, "Building image");

        let bare = parse_line("no timestamp here");
        assert!(bare.timestamp.is_none());
        assert_eq!(bare.text, "no timestamp here");
    }

    #[test]
    fn test_resolve_rejects_escaping_paths() {
        let (sink, _dir) = sink();
        assert!(sink.resolve("../etc/passwd").is_err());
        assert!(sink.resolve("/etc/passwd").is_err());
        assert!(sink.resolve("web/web.log").is_ok());
    }

    #[test]
    fn test_canonical_path_matches_allocated_path() {
        let (sink, _dir) = sink();
        let stored = sink.path_for("web", "abc-123");
        let relative = Path::new(&stored)
            .strip_prefix(sink.root())
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert_eq!(sink.canonical_path(&relative).unwrap(), stored);
        assert_eq!(sink.canonical_path(&stored).unwrap(), stored);
        assert!(sink.canonical_path("../web/x.log").is_err());
    }

    #[tokio::test]
    async fn test_append_then_read_with_and_without_timestamps() {
        let (sink, _dir) = sink();
        let path = sink.path_for("web", "abc-123");
        sink.append(&path, "fetching source").await.unwrap();
        sink.append(&path, "build ok\nimage tagged").await.unwrap();

        let plain = sink.read_to_vec(&path, ReadOptions::default()).await.unwrap();
        assert_eq!(plain, vec!["fetching source", "build ok", "image tagged"]);

        let stamped = sink
            .read_to_vec(
                &path,
                ReadOptions {
                    with_timestamps: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(stamped.len(), 3);
        assert!(parse_line(&stamped[0]).timestamp.is_some());
    }

    #[tokio::test]
    async fn test_windowed_read_is_subset_of_all() {
        let (sink, _dir) = sink();
        let path = sink.path_for("api", "dep-1");
        let now = Utc::now();
        sink.append_at(&path, now - ChronoDuration::hours(30), "old line")
            .await
            .unwrap();
        sink.append_at(&path, now - ChronoDuration::hours(3), "recent line")
            .await
            .unwrap();
        sink.append_at(&path, now, "fresh line").await.unwrap();

        // A line written by something other than the sink
        let resolved = sink.resolve(&path).unwrap();
        let mut raw = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&resolved)
            .await
            .unwrap();
        raw.write_all(b"untimestamped line\n").await.unwrap();

        let all = sink.read_to_vec(&path, ReadOptions::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        for since in [SinceFilter::Hour, SinceFilter::SixHours, SinceFilter::Day, SinceFilter::Week] {
            let windowed = sink
                .read_to_vec(
                    &path,
                    ReadOptions {
                        since,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert!(windowed.iter().all(|l| all.contains(l)));
            assert!(!windowed.contains(&"untimestamped line".to_string()));
        }

        let hour = sink
            .read_to_vec(
                &path,
                ReadOptions {
                    since: SinceFilter::Hour,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hour, vec!["fresh line"]);

        let six = sink
            .read_to_vec(
                &path,
                ReadOptions {
                    since: SinceFilter::SixHours,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(six, vec!["recent line", "fresh line"]);
    }

    #[tokio::test]
    async fn test_search_filters_by_text() {
        let (sink, _dir) = sink();
        let path = sink.path_for("web", "dep-2");
        sink.append(&path, "[build] step 1/3").await.unwrap();
        sink.append(&path, "[build] failed: exit 1").await.unwrap();
        sink.append(&path, "[start_new] skipped").await.unwrap();

        let hits = sink
            .read_to_vec(
                &path,
                ReadOptions {
                    search: Some("failed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits, vec!["[build] failed: exit 1"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_read() {
        let (sink, _dir) = sink();
        let path = sink.path_for("web", "dep-5");
        sink.append(&path, "before").await.unwrap();
        let resolved = sink.resolve(&path).unwrap();
        let mut raw = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&resolved)
            .await
            .unwrap();
        raw.write_all(b"shipped \xff\xfe bytes\r\n").await.unwrap();
        sink.append(&path, "after").await.unwrap();

        let lines = sink.read_to_vec(&path, ReadOptions::default()).await.unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "before");
        assert!(lines[1].starts_with("shipped "));
        assert!(lines[1].contains('\u{FFFD}'));
        assert!(!lines[1].ends_with('\r'));
        assert_eq!(lines[2], "after");

        // The tail decodes the same file the same way
        let mut tail = sink
            .follow(&path, ReadOptions::default(), Duration::from_millis(10), || async { false })
            .unwrap();
        let mut followed = Vec::new();
        while let Some(line) = tail.next().await {
            followed.push(line);
        }
        assert_eq!(followed, lines);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let (sink, _dir) = sink();
        let err = sink.read("ghost/ghost.log", ReadOptions::default()).await;
        assert!(matches!(err, Err(LogError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_follow_sees_appends_until_inactive() {
        let (sink, _dir) = sink();
        let path = sink.path_for("web", "dep-3");
        sink.append(&path, "first").await.unwrap();

        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let mut lines = sink
            .follow(&path, ReadOptions::default(), Duration::from_millis(20), move || {
                let flag = flag.clone();
                async move { flag.load(Ordering::SeqCst) }
            })
            .unwrap();

        assert_eq!(lines.next().await.as_deref(), Some("first"));

        sink.append(&path, "second").await.unwrap();
        assert_eq!(lines.next().await.as_deref(), Some("second"));

        sink.append(&path, "last").await.unwrap();
        active.store(false, Ordering::SeqCst);
        assert_eq!(lines.next().await.as_deref(), Some("last"));
        assert_eq!(lines.next().await, None);
    }

    #[tokio::test]
    async fn test_remove_service_logs() {
        let (sink, _dir) = sink();
        let path = sink.path_for("gone", "dep-4");
        sink.append(&path, "hello").await.unwrap();
        sink.remove_service_logs("gone").await.unwrap();
        assert!(!sink.resolve(&path).unwrap().exists());
        // Removing twice is fine
        sink.remove_service_logs("gone").await.unwrap();
    }
}
