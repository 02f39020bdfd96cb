//! Per-job append-only log buffer and the stream readers that feed it.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::RwLock;

/// Append-only line buffer for one job.
///
/// Appends and reads go through the same lock, so a reader always sees a
/// prefix of the lines in the order they were produced.
#[derive(Debug, Default)]
pub struct JobLog {
    lines: RwLock<Vec<String>>,
}

/// The answer to a log query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogTail {
    pub lines: Vec<String>,
    pub total_lines: usize,
}

impl JobLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one complete line.
    pub async fn append(&self, line: String) {
        self.lines.write().await.push(line);
    }

    /// Last `tail` lines (all lines when `tail` is 0) plus the total count.
    pub async fn tail(&self, tail: usize) -> LogTail {
        let lines = self.lines.read().await;
        let start = if tail == 0 {
            0
        } else {
            lines.len().saturating_sub(tail)
        };
        LogTail {
            lines: lines[start..].to_vec(),
            total_lines: lines.len(),
        }
    }

    /// Copy of the whole buffer.
    pub async fn snapshot(&self) -> Vec<String> {
        self.lines.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.lines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lines.read().await.is_empty()
    }
}

/// Longest line kept as one log entry; longer lines are split.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Read `stream` to EOF, appending each line to `log`. Returns the number of lines read.
///
/// Only whole lines are appended; an unterminated final line is flushed at EOF.
/// Lines longer than [`MAX_LINE_BYTES`] are split into several entries.
/// Invalid UTF-8 is replaced rather than dropped.
pub async fn capture_lines<R>(stream: R, log: &JobLog) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    capture_lines_capped(stream, log, MAX_LINE_BYTES).await
}

async fn capture_lines_capped<R>(stream: R, log: &JobLog, max_line: usize) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut count = 0;
    // The previous entry was cut at `max_line` and its newline is still unread.
    let mut split = false;

    loop {
        buf.clear();
        let n = (&mut reader)
            .take(max_line as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            break;
        }

        let terminated = buf.last() == Some(&b'\n');
        if terminated {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if split && buf.is_empty() {
                split = false;
                continue;
            }
        }
        split = !terminated && n == max_line;

        log.append(String::from_utf8_lossy(&buf).into_owned()).await;
        count += 1;
    }

    Ok(count)
}
