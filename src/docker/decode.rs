//! Byte-level decoders for Engine API streams.

use std::collections::VecDeque;

use futures::stream::{BoxStream, Stream, StreamExt};

use super::RuntimeError;

const HEADER_LEN: usize = 8;

/// Turns arbitrary chunks into complete lines.
pub trait ChunkDecoder: Send + 'static {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>>;

    /// Flush whatever is buffered once the body ends.
    fn finish(&mut self) -> Vec<Vec<u8>>;
}

/// Splits on `\n`, dropping the terminator and a trailing `\r`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn take_line(mut line: Vec<u8>) -> Vec<u8> {
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        line
    }
}

impl ChunkDecoder for LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                lines.push(Self::take_line(std::mem::take(&mut self.pending)));
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    fn finish(&mut self) -> Vec<Vec<u8>> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        vec![Self::take_line(std::mem::take(&mut self.pending))]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Multiplexed,
    Raw,
}

/// Decoder for `/containers/{id}/logs`.
///
/// Non-TTY containers frame every write as `[stream, 0, 0, 0, len:u32be]`
/// followed by `len` payload bytes; TTY containers send raw bytes. The
/// framing is sniffed from the first bytes of the body. stdout and stderr
/// keep separate line buffers so interleaved partial writes do not merge.
#[derive(Debug, Default)]
pub struct LogDecoder {
    framing: Option<Framing>,
    buffer: Vec<u8>,
    stdout: LineSplitter,
    stderr: LineSplitter,
}

impl LogDecoder {
    fn sniff(&mut self) {
        if self.framing.is_some() || self.buffer.is_empty() {
            return;
        }
        if self.buffer[0] > 2 {
            self.framing = Some(Framing::Raw);
            return;
        }
        let known = self.buffer.len().min(4);
        if self.buffer[1..known].iter().any(|b| *b != 0) {
            self.framing = Some(Framing::Raw);
        } else if self.buffer.len() >= HEADER_LEN {
            self.framing = Some(Framing::Multiplexed);
        }
    }

    fn drain_frames(&mut self, lines: &mut Vec<Vec<u8>>) {
        while self.buffer.len() >= HEADER_LEN {
            let len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            if self.buffer.len() < HEADER_LEN + len {
                break;
            }
            let stream = self.buffer[0];
            let frame: Vec<u8> = self.buffer.drain(..HEADER_LEN + len).skip(HEADER_LEN).collect();
            let splitter = if stream == 2 {
                &mut self.stderr
            } else {
                &mut self.stdout
            };
            lines.extend(splitter.push(&frame));
        }
    }
}

impl ChunkDecoder for LogDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        self.sniff();

        let mut lines = Vec::new();
        match self.framing {
            Some(Framing::Multiplexed) => self.drain_frames(&mut lines),
            Some(Framing::Raw) => {
                let raw = std::mem::take(&mut self.buffer);
                lines.extend(self.stdout.push(&raw));
            }
            None => {}
        }
        lines
    }

    fn finish(&mut self) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        if !self.buffer.is_empty() {
            // A truncated frame or an undecided short body: keep the bytes.
            let rest = std::mem::take(&mut self.buffer);
            let rest = match self.framing {
                Some(Framing::Multiplexed) if rest.len() > HEADER_LEN => rest[HEADER_LEN..].to_vec(),
                Some(Framing::Multiplexed) => Vec::new(),
                _ => rest,
            };
            lines.extend(self.stdout.push(&rest));
        }
        lines.extend(self.stdout.finish());
        lines.extend(self.stderr.finish());
        lines
    }
}

struct DecodeState<S, D> {
    body: S,
    decoder: D,
    ready: VecDeque<Vec<u8>>,
    done: bool,
}

/// Adapt a chunked HTTP body into a stream of lines.
pub(crate) fn decode_lines<S, B, E, D>(body: S, decoder: D) -> BoxStream<'static, Result<Vec<u8>, RuntimeError>>
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<RuntimeError> + Send + 'static,
    D: ChunkDecoder,
{
    let state = DecodeState {
        body,
        decoder,
        ready: VecDeque::new(),
        done: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((Ok(line), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.decoder.push(chunk.as_ref())),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
