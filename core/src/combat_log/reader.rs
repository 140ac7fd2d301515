use super::ReaderError;
use encoding_rs::WINDOWS_1252;
use memchr::memchr_iter;
use std::fs;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::debug;

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Log file reader. EverQuest logs are WINDOWS-1252 encoded; both the
/// one-shot read and the tail decode through `encoding_rs`.
pub struct Reader {
    path: PathBuf,
}

impl Reader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Reader { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read the whole file into decoded lines.
    pub fn read_to_lines(&self) -> Result<Vec<String>, ReaderError> {
        let bytes = fs::read(&self.path).map_err(|source| ReaderError::ReadFile {
            path: self.path.clone(),
            source,
        })?;

        let mut lines = Vec::new();
        let mut start = 0;
        for end in memchr_iter(b'\n', &bytes) {
            if end > start {
                let (line, _, _) = WINDOWS_1252.decode(&bytes[start..end]);
                lines.push(line.trim_end_matches('\r').to_string());
            }
            start = end + 1;
        }
        if start < bytes.len() {
            let (line, _, _) = WINDOWS_1252.decode(&bytes[start..]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        Ok(lines)
    }

    /// Tail the file, delivering complete decoded lines on `tx`. A file
    /// that shrinks below the current offset (truncation or rotation into
    /// place) resets the read position to the start. Returns when the
    /// receiver is dropped.
    pub async fn tail(
        self,
        start_at_end: bool,
        tx: mpsc::Sender<String>,
    ) -> Result<(), ReaderError> {
        let file = File::open(&self.path)
            .await
            .map_err(|source| ReaderError::OpenFile {
                path: self.path.clone(),
                source,
            })?;
        let mut pos = if start_at_end {
            file.metadata()
                .await
                .map_err(|source| ReaderError::Metadata {
                    path: self.path.clone(),
                    source,
                })?
                .len()
        } else {
            0
        };

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(pos))
            .await
            .map_err(|source| ReaderError::Seek {
                path: self.path.clone(),
                source,
            })?;

        let mut buf: Vec<u8> = Vec::new();
        loop {
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    // At EOF: watch for truncation, then poll again.
                    let len = tokio::fs::metadata(&self.path)
                        .await
                        .map_err(|source| ReaderError::Metadata {
                            path: self.path.clone(),
                            source,
                        })?
                        .len();
                    if len < pos {
                        debug!(path = %self.path.display(), "log file shrank, resetting to start");
                        reader
                            .seek(SeekFrom::Start(0))
                            .await
                            .map_err(|source| ReaderError::Seek {
                                path: self.path.clone(),
                                source,
                            })?;
                        pos = 0;
                        buf.clear();
                    }
                    sleep(TAIL_POLL_INTERVAL).await;
                }
                Ok(n) => {
                    pos += n as u64;
                    // Only hand off complete lines; partial reads keep
                    // accumulating until the newline arrives.
                    if buf.ends_with(b"\n") {
                        let (line, _, _) = WINDOWS_1252.decode(&buf);
                        let line = line.trim_end_matches(['\n', '\r']).to_string();
                        buf.clear();
                        if !line.is_empty() && tx.send(line).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(source) => {
                    return Err(ReaderError::ReadFile {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_to_lines_splits_and_decodes() {
        let dir = std::env::temp_dir();
        let path = dir.join("eqlog_reader_test.txt");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"first line\r\nsecond line\nthird").unwrap();
        drop(f);

        let lines = Reader::new(&path).read_to_lines().unwrap();
        assert_eq!(lines, vec!["first line", "second line", "third"]);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_tail_delivers_appended_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join("eqlog_tail_test.txt");
        fs::write(&path, b"old line\n").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let reader = Reader::new(&path);
        let handle = tokio::spawn(reader.tail(true, tx));

        // Give the tailer a moment to seek to the end before appending.
        sleep(Duration::from_millis(200)).await;
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"new line\n").unwrap();
        drop(f);

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for tailed line")
            .expect("channel closed");
        assert_eq!(got, "new line");

        drop(rx);
        handle.abort();
        let _ = fs::remove_file(&path);
    }
}
