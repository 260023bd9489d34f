use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{Error, Result};
use crate::types::Reply;

/// Negotiated RESP protocol version. RESP3-only frame tags arriving on a
/// RESP2 stream are a protocol violation, not a forward-compat extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    Resp2,
    Resp3,
}

/// Upper bound on a single frame, in bytes. Matches the server-side bulk
/// string limit.
pub(crate) const DEFAULT_MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

const MAX_NESTING_DEPTH: usize = 64;

/// Streamed, restartable frame parser.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame; the
/// caller appends more bytes and calls again, re-parsing from the start.
/// Frames are small enough that re-parsing a partial frame is cheaper than a
/// suspendable parser, and the buffer is only compacted after a full frame.
pub(crate) fn parse_frame(
    buf: &[u8],
    protocol: ProtocolVersion,
    max_frame: usize,
) -> Result<Option<(Reply, usize)>> {
    let mut parser = FrameParser {
        buf,
        pos: 0,
        protocol,
        max_frame,
    };
    match parser.value(MAX_NESTING_DEPTH)? {
        Some(reply) => Ok(Some((reply, parser.pos))),
        None => Ok(None),
    }
}

struct FrameParser<'a> {
    buf: &'a [u8],
    pos: usize,
    protocol: ProtocolVersion,
    max_frame: usize,
}

fn protocol_err(detail: impl Into<String>) -> Error {
    Error::Protocol(detail.into())
}

fn parse_i64(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol_err("length field is not a valid signed decimal"))
}

impl<'a> FrameParser<'a> {
    /// The next CRLF-terminated line, excluding the terminator.
    fn line(&mut self) -> Result<Option<&'a [u8]>> {
        let rest = &self.buf[self.pos..];
        match rest.windows(2).position(|w| w == b"\r\n") {
            Some(at) => {
                let line = &rest[..at];
                self.pos += at + 2;
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }

    /// Exactly `len` payload bytes followed by CRLF.
    fn payload(&mut self, len: usize) -> Result<Option<&'a [u8]>> {
        let rest = &self.buf[self.pos..];
        if rest.len() < len + 2 {
            return Ok(None);
        }
        if &rest[len..len + 2] != b"\r\n" {
            return Err(protocol_err("bulk payload is not CRLF-terminated"));
        }
        let data = &rest[..len];
        self.pos += len + 2;
        Ok(Some(data))
    }

    /// A length header: `-1` maps to `None` (null), other negatives and
    /// oversized values are violations.
    fn length(&mut self) -> Result<Option<Option<usize>>> {
        let Some(line) = self.line()? else {
            return Ok(None);
        };
        let n = parse_i64(line)?;
        if n == -1 {
            return Ok(Some(None));
        }
        if n < 0 {
            return Err(protocol_err("negative length"));
        }
        if n as usize > self.max_frame {
            return Err(protocol_err("declared size exceeds the frame bound"));
        }
        Ok(Some(Some(n as usize)))
    }

    fn pairs(&mut self, count: usize, depth: usize) -> Result<Option<Vec<(Reply, Reply)>>> {
        let mut out = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let Some(key) = self.value(depth)? else {
                return Ok(None);
            };
            let Some(value) = self.value(depth)? else {
                return Ok(None);
            };
            out.push((key, value));
        }
        Ok(Some(out))
    }

    fn items(&mut self, count: usize, depth: usize) -> Result<Option<Vec<Reply>>> {
        let mut out = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let Some(item) = self.value(depth)? else {
                return Ok(None);
            };
            out.push(item);
        }
        Ok(Some(out))
    }

    fn require_resp3(&self, tag: u8) -> Result<()> {
        if self.protocol == ProtocolVersion::Resp2 {
            return Err(protocol_err(format!(
                "RESP3 tag {:?} on a RESP2 stream",
                tag as char
            )));
        }
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<Option<Reply>> {
        if depth == 0 {
            return Err(protocol_err("frame nesting too deep"));
        }
        let Some(&tag) = self.buf.get(self.pos) else {
            return Ok(None);
        };
        let start = self.pos;
        self.pos += 1;
        let reply = match tag {
            b'+' => self.line()?.map(|l| Reply::Simple(l.to_vec())),
            b'-' => self.line()?.map(|l| Reply::Error(l.to_vec())),
            b':' => match self.line()? {
                Some(l) => Some(Reply::Int(parse_i64(l)?)),
                None => None,
            },
            b'$' => match self.length()? {
                Some(None) => Some(Reply::Bulk(None)),
                Some(Some(len)) => self.payload(len)?.map(|d| Reply::Bulk(Some(d.to_vec()))),
                None => None,
            },
            b'*' => match self.length()? {
                Some(None) => Some(Reply::Array(None)),
                Some(Some(len)) => self.items(len, depth - 1)?.map(|v| Reply::Array(Some(v))),
                None => None,
            },
            b'_' => {
                self.require_resp3(tag)?;
                match self.line()? {
                    Some(l) if l.is_empty() => Some(Reply::Null),
                    Some(_) => return Err(protocol_err("null frame carries payload")),
                    None => None,
                }
            }
            b',' => {
                self.require_resp3(tag)?;
                match self.line()? {
                    Some(l) => {
                        let text = std::str::from_utf8(l)
                            .map_err(|_| protocol_err("double is not UTF-8"))?;
                        let value = text
                            .parse::<f64>()
                            .map_err(|_| protocol_err("double does not parse"))?;
                        Some(Reply::Double(value))
                    }
                    None => None,
                }
            }
            b'#' => {
                self.require_resp3(tag)?;
                match self.line()? {
                    Some(line) if line == b"t" => Some(Reply::Boolean(true)),
                    Some(line) if line == b"f" => Some(Reply::Boolean(false)),
                    Some(_) => return Err(protocol_err("boolean must be #t or #f")),
                    None => None,
                }
            }
            b'(' => {
                self.require_resp3(tag)?;
                self.line()?.map(|l| Reply::BigNumber(l.to_vec()))
            }
            b'%' => {
                self.require_resp3(tag)?;
                match self.length()? {
                    Some(Some(len)) => self.pairs(len, depth - 1)?.map(Reply::Map),
                    Some(None) => return Err(protocol_err("null map")),
                    None => None,
                }
            }
            b'~' => {
                self.require_resp3(tag)?;
                match self.length()? {
                    Some(Some(len)) => self.items(len, depth - 1)?.map(Reply::Set),
                    Some(None) => return Err(protocol_err("null set")),
                    None => None,
                }
            }
            b'>' => {
                self.require_resp3(tag)?;
                match self.length()? {
                    Some(Some(len)) => self.items(len, depth - 1)?.map(Reply::Push),
                    Some(None) => return Err(protocol_err("null push")),
                    None => None,
                }
            }
            b'=' => {
                self.require_resp3(tag)?;
                match self.length()? {
                    Some(Some(len)) => {
                        if len < 4 {
                            return Err(protocol_err("verbatim shorter than its format prefix"));
                        }
                        match self.payload(len)? {
                            Some(raw) => {
                                if raw[3] != b':' {
                                    return Err(protocol_err("verbatim format separator missing"));
                                }
                                Some(Reply::Verbatim {
                                    format: [raw[0], raw[1], raw[2]],
                                    data: raw[4..].to_vec(),
                                })
                            }
                            None => None,
                        }
                    }
                    Some(None) => return Err(protocol_err("null verbatim")),
                    None => None,
                }
            }
            b'|' => {
                self.require_resp3(tag)?;
                match self.length()? {
                    Some(Some(len)) => match self.pairs(len, depth - 1)? {
                        Some(attrs) => self.value(depth - 1)?.map(|inner| Reply::Attribute {
                            attrs,
                            inner: Box::new(inner),
                        }),
                        None => None,
                    },
                    Some(None) => return Err(protocol_err("null attribute")),
                    None => None,
                }
            }
            // Inline command replies: a bare line of space-separated tokens.
            // Legacy, tolerated on input only.
            _ => {
                self.pos = start;
                match self.line()? {
                    Some(line) => {
                        let tokens = line
                            .split(|b| *b == b' ')
                            .filter(|t| !t.is_empty())
                            .map(|t| Reply::Bulk(Some(t.to_vec())))
                            .collect();
                        Some(Reply::Array(Some(tokens)))
                    }
                    None => None,
                }
            }
        };
        if reply.is_none() {
            self.pos = start;
        }
        Ok(reply)
    }
}

/// Frame codec driven by the read loop: decodes inbound RESP frames into
/// [`Reply`] values and passes pre-packed command bytes through on the write
/// side.
#[derive(Debug, Clone)]
pub(crate) struct ReplyCodec {
    protocol: ProtocolVersion,
    max_frame: usize,
}

impl ReplyCodec {
    pub(crate) fn new(protocol: ProtocolVersion, max_frame: usize) -> ReplyCodec {
        ReplyCodec {
            protocol,
            max_frame,
        }
    }
}

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>> {
        match parse_frame(&src[..], self.protocol, self.max_frame)? {
            Some((reply, consumed)) => {
                src.advance(consumed);
                Ok(Some(reply))
            }
            None => {
                if src.len() > self.max_frame {
                    return Err(protocol_err("unterminated frame exceeds the size bound"));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Vec<u8>> for ReplyCodec {
    type Error = Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
