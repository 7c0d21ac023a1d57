//! Chunked transfer coding.
//!
//! The encoder frames each buffer it is given as one chunk and never touches
//! bytes it already emitted. The decoder is incremental: it accepts input in
//! arbitrary splits and reports how much of it belonged to the chunked body,
//! so bytes after the terminating chunk stay with the caller.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::tunnel::ChunkAction;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid chunk size line")]
    InvalidSize,
    #[error("chunk size overflow")]
    SizeOverflow,
    #[error("missing CRLF after chunk data")]
    MissingCrlf,
}

/// Emits `{size:x}\r\n{data}\r\n` per call and `0\r\n\r\n` on finish.
#[derive(Debug, Default)]
pub struct ChunkedEncoder {
    finished: bool,
}

impl ChunkedEncoder {
    pub fn encode(&mut self, data: &[u8], out: &mut BytesMut) {
        if data.is_empty() || self.finished {
            return;
        }
        out.reserve(data.len() + 20);
        out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.put_slice(data);
        out.put_slice(b"\r\n");
    }

    pub fn finish(&mut self, out: &mut BytesMut) {
        if !self.finished {
            out.put_slice(b"0\r\n\r\n");
            self.finished = true;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Size { seen_digit: bool },
    Extension,
    SizeLf,
    Data { remaining: u64 },
    DataCr,
    DataLf,
    TrailerLineStart,
    TrailerLine,
    FinalLf,
    Done,
}

/// Incremental chunked body decoder.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecodeState,
    size: u64,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: DecodeState::Size { seen_digit: false },
            size: 0,
        }
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminating chunk and trailers fully consumed.
    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Decode from `input`, appending body bytes to `out`.
    /// Returns the number of input bytes consumed.
    pub fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Result<usize, ChunkError> {
        let mut pos = 0;
        while pos < input.len() {
            let b = input[pos];
            match self.state {
                DecodeState::Size { seen_digit } => {
                    if let Some(d) = hex_value(b) {
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(u64::from(d)))
                            .ok_or(ChunkError::SizeOverflow)?;
                        self.state = DecodeState::Size { seen_digit: true };
                    } else if !seen_digit {
                        return Err(ChunkError::InvalidSize);
                    } else {
                        match b {
                            b';' | b' ' | b'\t' => self.state = DecodeState::Extension,
                            b'\r' => self.state = DecodeState::SizeLf,
                            b'\n' => self.end_size_line(),
                            _ => return Err(ChunkError::InvalidSize),
                        }
                    }
                    pos += 1;
                }
                DecodeState::Extension => {
                    match b {
                        b'\r' => self.state = DecodeState::SizeLf,
                        b'\n' => self.end_size_line(),
                        _ => {}
                    }
                    pos += 1;
                }
                DecodeState::SizeLf => {
                    if b != b'\n' {
                        return Err(ChunkError::InvalidSize);
                    }
                    self.end_size_line();
                    pos += 1;
                }
                DecodeState::Data { remaining } => {
                    let available = (input.len() - pos) as u64;
                    let take = remaining.min(available) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        DecodeState::DataCr
                    } else {
                        DecodeState::Data { remaining }
                    };
                }
                DecodeState::DataCr => {
                    match b {
                        b'\r' => self.state = DecodeState::DataLf,
                        b'\n' => self.next_chunk(),
                        _ => return Err(ChunkError::MissingCrlf),
                    }
                    pos += 1;
                }
                DecodeState::DataLf => {
                    if b != b'\n' {
                        return Err(ChunkError::MissingCrlf);
                    }
                    self.next_chunk();
                    pos += 1;
                }
                DecodeState::TrailerLineStart => {
                    match b {
                        b'\r' => self.state = DecodeState::FinalLf,
                        b'\n' => self.state = DecodeState::Done,
                        _ => self.state = DecodeState::TrailerLine,
                    }
                    pos += 1;
                }
                DecodeState::TrailerLine => {
                    if b == b'\n' {
                        self.state = DecodeState::TrailerLineStart;
                    }
                    pos += 1;
                }
                DecodeState::FinalLf => {
                    if b != b'\n' {
                        return Err(ChunkError::MissingCrlf);
                    }
                    self.state = DecodeState::Done;
                    pos += 1;
                }
                DecodeState::Done => break,
            }
        }
        Ok(pos)
    }

    fn end_size_line(&mut self) {
        self.state = if self.size == 0 {
            DecodeState::TrailerLineStart
        } else {
            DecodeState::Data {
                remaining: self.size,
            }
        };
    }

    fn next_chunk(&mut self) {
        self.size = 0;
        self.state = DecodeState::Size { seen_digit: false };
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Output of one codec step.
#[derive(Debug, Default, Clone)]
pub(crate) struct Framed {
    /// Bytes for consumers that receive the producer's chosen framing.
    pub wire: Bytes,
    /// De-framed body bytes for cache-write consumers.
    pub plain: Bytes,
}

/// Applies a producer's chunk action exactly once per input range.
#[derive(Debug)]
pub(crate) struct ChunkCodec {
    action: ChunkAction,
    encoder: ChunkedEncoder,
    decoder: ChunkedDecoder,
}

impl ChunkCodec {
    pub fn new(action: ChunkAction) -> Self {
        Self {
            action,
            encoder: ChunkedEncoder::default(),
            decoder: ChunkedDecoder::new(),
        }
    }

    /// Input carries chunked framing that ends the body by itself.
    pub fn reads_chunked(&self) -> bool {
        matches!(self.action, ChunkAction::Dechunk | ChunkAction::PassThroughChunked)
    }

    /// The chunked input reached its terminating chunk.
    pub fn body_complete(&self) -> bool {
        self.reads_chunked() && self.decoder.is_done()
    }

    /// Returns the framed views and how many input bytes they cover.
    pub fn apply(&mut self, input: &Bytes) -> Result<(Framed, usize), ChunkError> {
        match self.action {
            ChunkAction::PassThrough => Ok((
                Framed {
                    wire: input.clone(),
                    plain: input.clone(),
                },
                input.len(),
            )),
            ChunkAction::Chunk => {
                let mut out = BytesMut::new();
                self.encoder.encode(input, &mut out);
                Ok((
                    Framed {
                        wire: out.freeze(),
                        plain: input.clone(),
                    },
                    input.len(),
                ))
            }
            ChunkAction::Dechunk => {
                let mut out = BytesMut::new();
                let used = self.decoder.decode(input, &mut out)?;
                let plain = out.freeze();
                Ok((
                    Framed {
                        wire: plain.clone(),
                        plain,
                    },
                    used,
                ))
            }
            ChunkAction::PassThroughChunked => {
                let mut out = BytesMut::new();
                let used = self.decoder.decode(input, &mut out)?;
                Ok((
                    Framed {
                        wire: input.slice(..used),
                        plain: out.freeze(),
                    },
                    used,
                ))
            }
        }
    }

    /// Trailing framing once the producer is exhausted.
    pub fn finish(&mut self) -> Framed {
        match self.action {
            ChunkAction::Chunk => {
                let mut out = BytesMut::new();
                self.encoder.finish(&mut out);
                Framed {
                    wire: out.freeze(),
                    plain: Bytes::new(),
                }
            }
            _ => Framed::default(),
        }
    }
}
