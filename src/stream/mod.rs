//! Concurrent draining of child stdout/stderr with line framing.
//!
//! One reader task per stream pulls raw bytes off the pipe (or PTY master) as
//! fast as the child produces them — never at the consumer's pace — frames
//! them into line-delimited [`OutputChunk`]s, and pushes [`StreamEvent`]s
//! into the execution driver's single event channel. The driver also feeds
//! the child's exit through the same channel, so "both streams drained and
//! the process exited" is a plain event count rather than a join on the
//! process alone. Waiting on exit while a pipe is still full is the deadlock
//! this module exists to prevent.
//!
//! Lines longer than the per-line cap are split into fragments tagged
//! `truncated = true`; nothing is silently dropped. Invalid UTF-8 decodes
//! lossily.

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Which output stream produced the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One framed piece of child output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    /// Lossy UTF-8 decoded data. Complete lines keep their trailing newline;
    /// an unterminated tail is flushed as-is when the stream closes.
    pub data: String,
    /// True when this chunk is a fragment of an over-cap line, or when the
    /// session output cap forced delivery-only mode (set by the driver).
    pub truncated: bool,
    /// Strictly increasing, contiguous, per stream.
    pub seq: u64,
}

/// Events merged into the execution driver's single ordered channel.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(OutputChunk),
    /// The named stream reached end of file (or the PTY raised EIO).
    Closed(StreamKind),
    /// The child was reaped. `code` is `None` when it died to a signal.
    Exited { code: Option<i32> },
}

/// Assembles raw reads into capped line chunks with per-stream sequencing.
pub struct LineFramer {
    kind: StreamKind,
    line_cap: usize,
    buf: Vec<u8>,
    next_seq: u64,
}

impl LineFramer {
    pub fn new(kind: StreamKind, line_cap: usize) -> Self {
        Self {
            kind,
            line_cap,
            buf: Vec::with_capacity(line_cap.min(4096)),
            next_seq: 1,
        }
    }

    fn emit(&mut self, bytes: &[u8], truncated: bool) -> OutputChunk {
        let seq = self.next_seq;
        self.next_seq += 1;
        OutputChunk {
            stream: self.kind,
            data: String::from_utf8_lossy(bytes).into_owned(),
            truncated,
            seq,
        }
    }

    /// Feed raw bytes, producing zero or more complete chunks.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<OutputChunk> {
        let mut out = Vec::new();
        self.buf.extend_from_slice(bytes);

        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                if line.len() > self.line_cap {
                    for fragment in line.chunks(self.line_cap) {
                        let chunk = self.emit(fragment, true);
                        out.push(chunk);
                    }
                } else {
                    let chunk = self.emit(&line, false);
                    out.push(chunk);
                }
                continue;
            }
            // No newline yet — still enforce the cap on a runaway line.
            if self.buf.len() >= self.line_cap {
                let fragment: Vec<u8> = self.buf.drain(..self.line_cap).collect();
                let chunk = self.emit(&fragment, true);
                out.push(chunk);
                continue;
            }
            break;
        }
        out
    }

    /// Flush the unterminated tail at end of stream.
    pub fn finish(&mut self) -> Option<OutputChunk> {
        if self.buf.is_empty() {
            return None;
        }
        let tail: Vec<u8> = std::mem::take(&mut self.buf);
        Some(self.emit(&tail, false))
    }
}

/// Spawn the drain task for one stream.
///
/// The task reads until EOF or error (a PTY master returns EIO once the
/// child is gone — same thing), then sends [`StreamEvent::Closed`]. A closed
/// event channel means the driver is gone and the task just stops.
pub fn spawn_reader(
    kind: StreamKind,
    mut reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    line_cap: usize,
    tx: mpsc::Sender<StreamEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut framer = LineFramer::new(kind, line_cap);
        let mut tmp = [0u8; 4096];
        loop {
            match reader.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for chunk in framer.push(&tmp[..n]) {
                        if tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
        if let Some(tail) = framer.finish() {
            let _ = tx.send(StreamEvent::Chunk(tail)).await;
        }
        debug!("{} drained", kind.as_str());
        let _ = tx.send(StreamEvent::Closed(kind)).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer(cap: usize) -> LineFramer {
        LineFramer::new(StreamKind::Stdout, cap)
    }

    #[test]
    fn splits_on_newlines() {
        let mut f = framer(1024);
        let chunks = f.push(b"one\ntwo\nthr");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, "one\n");
        assert_eq!(chunks[1].data, "two\n");
        let tail = f.finish().unwrap();
        assert_eq!(tail.data, "thr");
        assert!(!tail.truncated);
    }

    #[test]
    fn seq_is_contiguous_across_pushes() {
        let mut f = framer(1024);
        let mut seqs: Vec<u64> = Vec::new();
        for chunk in f.push(b"a\nb\n") {
            seqs.push(chunk.seq);
        }
        for chunk in f.push(b"c\n") {
            seqs.push(chunk.seq);
        }
        seqs.push(f.push(b"tail").into_iter().map(|c| c.seq).next().unwrap_or(0));
        if let Some(tail) = f.finish() {
            seqs.push(tail.seq);
        }
        let seqs: Vec<u64> = seqs.into_iter().filter(|&s| s != 0).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn over_cap_line_becomes_truncated_fragments() {
        let mut f = framer(4);
        let chunks = f.push(b"abcdefghij\n");
        // 11 bytes split into ceil(11/4) fragments, all truncated.
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.truncated));
        let joined: String = chunks.iter().map(|c| c.data.as_str()).collect();
        assert_eq!(joined, "abcdefghij\n");
    }

    #[test]
    fn runaway_line_without_newline_is_capped() {
        let mut f = framer(4);
        let chunks = f.push(b"abcdefgh");
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.truncated));
        assert!(f.finish().is_none());
    }

    #[test]
    fn invalid_utf8_decodes_lossily() {
        let mut f = framer(1024);
        let chunks = f.push(&[0xff, 0xfe, b'o', b'k', b'\n']);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].data.ends_with("ok\n"));
    }

    #[tokio::test]
    async fn reader_emits_chunks_then_closed() {
        let (tx, mut rx) = mpsc::channel(64);
        let data: &'static [u8] = b"hello\nworld";
        spawn_reader(StreamKind::Stderr, Box::new(data), 1024, tx);

        let mut datas = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                StreamEvent::Chunk(c) => {
                    assert_eq!(c.stream, StreamKind::Stderr);
                    datas.push(c.data);
                }
                StreamEvent::Closed(kind) => {
                    assert_eq!(kind, StreamKind::Stderr);
                    break;
                }
                StreamEvent::Exited { .. } => unreachable!(),
            }
        }
        assert_eq!(datas, vec!["hello\n".to_string(), "world".to_string()]);
    }
}
