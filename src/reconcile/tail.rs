use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Follow-mode reader over a growing log file.
///
/// Reads from the beginning of the file, waits at end of file, and starts over
/// when the file is truncated or a different file appears at the path.
pub struct LogTail {
    path: PathBuf,
    poll_interval: Duration,
    reader: Option<BufReader<File>>,
    offset: u64,
    partial: Vec<u8>,
    missing_logged: bool,
    /// Device and inode of the open file.
    identity: Option<(u64, u64)>,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            reader: None,
            offset: 0,
            partial: Vec::new(),
            missing_logged: false,
            identity: None,
        }
    }

    /// Next complete line without its terminator, or `None` once cancelled.
    pub async fn next_line(&mut self, cancel: &CancellationToken) -> Option<String> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            if self.reader.is_none() {
                match File::open(&self.path).await {
                    Ok(file) => {
                        log::info!("tailing {}", self.path.display());
                        self.identity = file.metadata().await.ok().as_ref().and_then(file_identity);
                        self.reader = Some(BufReader::new(file));
                        self.offset = 0;
                        self.partial.clear();
                        self.missing_logged = false;
                    }
                    Err(e) => {
                        if !self.missing_logged {
                            log::warn!("cannot open {}: {}, waiting", self.path.display(), e);
                            self.missing_logged = true;
                        }
                        if !self.idle(cancel).await {
                            return None;
                        }
                        continue;
                    }
                }
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };

            let mut chunk = Vec::new();
            match reader.read_until(b'\n', &mut chunk).await {
                Ok(0) => {
                    if self.rotated().await {
                        log::info!("{} was truncated or rotated, reopening", self.path.display());
                        self.reader = None;
                        continue;
                    }
                    if !self.idle(cancel).await {
                        return None;
                    }
                }
                Ok(n) => {
                    self.offset += n as u64;
                    self.partial.extend_from_slice(&chunk);
                    if self.partial.ends_with(b"\n") {
                        let line = String::from_utf8_lossy(&self.partial)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        self.partial.clear();
                        return Some(line);
                    }
                }
                Err(e) => {
                    log::warn!("reading {} failed: {}, reopening", self.path.display(), e);
                    self.reader = None;
                    if !self.idle(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn rotated(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => {
                meta.len() < self.offset
                    || matches!((self.identity, file_identity(&meta)), (Some(open), Some(now)) if open != now)
            }
            Err(_) => true,
        }
    }

    /// Sleep one poll interval. Returns false if cancelled meanwhile.
    async fn idle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn follows_appended_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first").unwrap();
        file.flush().unwrap();

        let cancel = CancellationToken::new();
        let mut tail = LogTail::new(file.path(), Duration::from_millis(10));
        assert_eq!(tail.next_line(&cancel).await.as_deref(), Some("first"));

        write!(file, "sec").unwrap();
        file.flush().unwrap();
        let path = file.path().to_path_buf();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut appender = std::fs::OpenOptions::new().append(true).open(path).unwrap();
            writeln!(appender, "ond\r").unwrap();
        });

        assert_eq!(tail.next_line(&cancel).await.as_deref(), Some("second"));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn truncation_restarts_from_the_top() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "one long line\n").unwrap();

        let cancel = CancellationToken::new();
        let mut tail = LogTail::new(file.path(), Duration::from_millis(10));
        assert_eq!(tail.next_line(&cancel).await.as_deref(), Some("one long line"));

        std::fs::write(file.path(), "new\n").unwrap();
        assert_eq!(tail.next_line(&cancel).await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn replaced_file_is_read_from_the_top_even_when_longer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.log");
        std::fs::write(&path, "old\n").unwrap();

        let cancel = CancellationToken::new();
        let mut tail = LogTail::new(&path, Duration::from_millis(10));
        assert_eq!(tail.next_line(&cancel).await.as_deref(), Some("old"));

        std::fs::rename(&path, dir.path().join("info.log.1")).unwrap();
        std::fs::write(&path, "first line of the new log\nsecond\n").unwrap();
        assert_eq!(
            tail.next_line(&cancel).await.as_deref(),
            Some("first line of the new log")
        );
        assert_eq!(tail.next_line(&cancel).await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn cancelled_tail_returns_none() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cancel = CancellationToken::new();
        let mut tail = LogTail::new(file.path(), Duration::from_millis(10));

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stopper.cancel();
        });
        assert_eq!(tail.next_line(&cancel).await, None);
    }
}
