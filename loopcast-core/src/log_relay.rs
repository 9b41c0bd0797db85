//! Bounded encoder log and the relay that fills it.
//!
//! The relay task is the only writer. Readers take snapshot copies, so no
//! lock is ever held across I/O.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{trace, warn};

use crate::encoder::{StreamKey, redact};
use crate::tracing_setup::ENCODER_TARGET;

/// Longest line kept; the rest of an overlong line is discarded.
pub const MAX_LINE_BYTES: usize = 4096;

/// FIFO ring of the most recent output lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

#[derive(Debug)]
struct BufferInner {
    lines: VecDeque<String>,
    capacity: usize,
    appended: u64,
}

impl LogBuffer {
    /// Creates a buffer retaining at most `capacity` lines (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(BufferInner {
                lines: VecDeque::with_capacity(capacity),
                capacity,
                appended: 0,
            })),
        }
    }

    /// Appends a line, evicting the oldest one when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.lines.len() == inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.into());
        inner.appended += 1;
    }

    /// Copy of the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().lines.iter().cloned().collect()
    }

    /// Copy of the last `n` retained lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lines.clear();
        inner.appended = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total lines appended since the last clear, including evicted ones.
    pub fn total_appended(&self) -> u64 {
        self.inner.lock().appended
    }
}

/// Moves encoder output into a `LogBuffer` line by line.
pub struct LogRelay {
    buffer: LogBuffer,
    key: StreamKey,
}

impl LogRelay {
    /// Lines are redacted against `key` before they are stored or traced.
    pub fn new(buffer: LogBuffer, key: StreamKey) -> Self {
        Self { buffer, key }
    }

    /// Drains both streams until each reaches end-of-stream.
    ///
    /// A line ends at `\n` or `\r`, so progress reports show up as soon as
    /// they are written. Lines from one stream keep their relative order.
    /// Returns the number of lines relayed; completion means the process
    /// closed its output.
    pub async fn run<O, E>(self, stdout: Option<O>, stderr: Option<E>) -> u64
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let mut merged = stream::select(line_stream(stdout), line_stream(stderr));
        let mut relayed = 0u64;

        while let Some(raw) = merged.next().await {
            if raw.trim().is_empty() {
                continue;
            }
            let line = redact(&raw, &self.key);
            trace!(target: ENCODER_TARGET, "{}", line);
            self.buffer.push(line);
            relayed += 1;
        }

        relayed
    }
}

/// Splits a byte stream on either line terminator.
struct LineSplitter<R> {
    reader: BufReader<R>,
    partial: Vec<u8>,
    complete: VecDeque<String>,
    failed: bool,
}

impl<R: AsyncRead + Unpin> LineSplitter<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            partial: Vec::new(),
            complete: VecDeque::new(),
            failed: false,
        }
    }

    /// Next line, or `None` once the stream is exhausted.
    ///
    /// Invalid UTF-8 is replaced rather than treated as an error, and bytes
    /// past `MAX_LINE_BYTES` are dropped, so the pipe is always drained.
    async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.complete.pop_front() {
                return Some(line);
            }
            if self.failed {
                return None;
            }

            let consumed = match self.reader.fill_buf().await {
                Ok(chunk) if chunk.is_empty() => return take_line(&mut self.partial),
                Ok(chunk) => {
                    for &byte in chunk {
                        if byte == b'\n' || byte == b'\r' {
                            self.complete.extend(take_line(&mut self.partial));
                        } else if self.partial.len() < MAX_LINE_BYTES {
                            self.partial.push(byte);
                        }
                    }
                    chunk.len()
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) => {
                    warn!("Encoder output unreadable: {}", e);
                    self.failed = true;
                    return take_line(&mut self.partial);
                }
            };
            self.reader.consume(consumed);
        }
    }
}

/// Decodes and empties the pending bytes; `None` when there are none.
fn take_line(partial: &mut Vec<u8>) -> Option<String> {
    if partial.is_empty() {
        return None;
    }
    let line = String::from_utf8_lossy(partial).into_owned();
    partial.clear();
    Some(line)
}

fn line_stream<R>(reader: Option<R>) -> BoxStream<'static, String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        return stream::empty().boxed();
    };

    stream::unfold(LineSplitter::new(reader), |mut splitter| async move {
        let line = splitter.next_line().await?;
        Some((line, splitter))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    use super::*;

    #[test]
    fn test_buffer_evicts_oldest_first() {
        let buffer = LogBuffer::new(3);
        for i in 1..=5 {
            buffer.push(format!("frame={i}"));
        }

        assert_eq!(buffer.snapshot(), vec!["frame=3", "frame=4", "frame=5"]);
        assert_eq!(buffer.tail(2), vec!["frame=4", "frame=5"]);
        assert_eq!(buffer.tail(10).len(), 3);
        assert_eq!(buffer.total_appended(), 5);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let buffer = LogBuffer::new(4);
        buffer.push("a");
        let snapshot = buffer.snapshot();
        buffer.push("b");

        assert_eq!(snapshot, vec!["a"]);
        assert_eq!(buffer.len(), 2);
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_relay_preserves_order_and_redacts() {
        let buffer = LogBuffer::new(30);
        let relay = LogRelay::new(buffer.clone(), StreamKey::new("abc123"));
        let stdout: &[u8] = b"frame=1\r\nframe=2\nconnecting to live2/abc123\n";

        let relayed = relay.run(Some(stdout), None::<&[u8]>).await;

        assert_eq!(relayed, 3);
        assert_eq!(
            buffer.snapshot(),
            vec!["frame=1", "frame=2", "connecting to live2/****"]
        );
    }

    #[tokio::test]
    async fn test_relay_splits_carriage_return_progress() {
        let buffer = LogBuffer::new(30);
        let relay = LogRelay::new(buffer.clone(), StreamKey::new("abc123"));
        let stderr: &[u8] = b"frame=1 fps=0\rframe=2 fps=25\r\n";

        relay.run(None::<&[u8]>, Some(stderr)).await;

        assert_eq!(buffer.snapshot(), vec!["frame=1 fps=0", "frame=2 fps=25"]);
    }

    #[tokio::test]
    async fn test_progress_reports_appear_before_output_closes() {
        let buffer = LogBuffer::new(30);
        let relay = LogRelay::new(buffer.clone(), StreamKey::new("abc123"));
        let (mut writer, reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(relay.run(Some(reader), None::<&[u8]>));

        writer
            .write_all(b"frame=1 fps=25\rframe=2 fps=25\r")
            .await
            .unwrap();
        timeout(Duration::from_secs(2), async {
            while buffer.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("progress lines not relayed while the writer is open");

        assert_eq!(buffer.snapshot(), vec!["frame=1 fps=25", "frame=2 fps=25"]);
        assert!(!task.is_finished());
        drop(writer);
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_relay() {
        let buffer = LogBuffer::new(30);
        let relay = LogRelay::new(buffer.clone(), StreamKey::new("abc123"));
        let stderr: &[u8] = b"frame=1\ntitle: caf\xe9\nframe=2\nframe=3\n";

        let relayed = relay.run(None::<&[u8]>, Some(stderr)).await;

        assert_eq!(relayed, 4);
        assert_eq!(
            buffer.snapshot(),
            vec!["frame=1", "title: caf\u{FFFD}", "frame=2", "frame=3"]
        );
    }

    #[tokio::test]
    async fn test_overlong_line_is_truncated() {
        let buffer = LogBuffer::new(30);
        let relay = LogRelay::new(buffer.clone(), StreamKey::new("abc123"));
        let mut output = vec![b'x'; MAX_LINE_BYTES * 3];
        output.extend_from_slice(b"\nframe=1\n");

        relay.run(Some(std::io::Cursor::new(output)), None::<&[u8]>).await;

        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(lines[1], "frame=1");
    }

    #[tokio::test]
    async fn test_relay_merges_both_streams() {
        let buffer = LogBuffer::new(30);
        let relay = LogRelay::new(buffer.clone(), StreamKey::new("k"));
        let stdout: &[u8] = b"out-1\nout-2\n";
        let stderr: &[u8] = b"err-1\n";

        relay.run(Some(stdout), Some(stderr)).await;

        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 3);
        let outs: Vec<_> = lines.iter().filter(|l| l.starts_with("out")).collect();
        assert_eq!(outs, vec!["out-1", "out-2"]);
    }
}
