//! Incremental reply decoder for clients and tests.

use crate::error::ProtocolError;
use crate::parse::parse_int;
use crate::reply::Reply;

/// Accumulates bytes from a socket and yields complete replies.
///
/// ```ignore
/// let mut reader = ReplyReader::new();
/// reader.feed(&bytes);
/// while let Some(reply) = reader.next_reply()? {
///     println!("{:?}", reply);
/// }
/// ```
#[derive(Debug, Default)]
pub struct ReplyReader {
    buf: Vec<u8>,
    pos: usize,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the peer.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pos > 0 && self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete reply, `Ok(None)` if more bytes are needed.
    pub fn next_reply(&mut self) -> Result<Option<Reply>, ProtocolError> {
        match read_reply(&self.buf[self.pos..])? {
            Some((reply, n)) => {
                self.pos += n;
                if self.pos > 4096 && self.pos * 2 > self.buf.len() {
                    self.buf.drain(..self.pos);
                    self.pos = 0;
                }
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }

    /// Bytes fed but not yet decoded.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Line body without its `\r\n`, and the bytes consumed including it.
fn read_line(buf: &[u8]) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    match buf.iter().position(|&c| c == b'\n') {
        None => Ok(None),
        Some(0) => Err(ProtocolError::InvalidReply),
        Some(nl) if buf[nl - 1] != b'\r' => Err(ProtocolError::InvalidReply),
        Some(nl) => Ok(Some((&buf[..nl - 1], nl + 1))),
    }
}

fn read_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, ProtocolError> {
    let Some(&kind) = buf.first() else {
        return Ok(None);
    };
    let Some((line, n)) = read_line(&buf[1..])? else {
        return Ok(None);
    };
    let head = n + 1;
    let int = || parse_int(line).ok_or(ProtocolError::InvalidReply);

    let reply = match kind {
        b'+' => (Reply::Simple(String::from_utf8_lossy(line).into_owned()), head),
        b'-' => (Reply::Error(String::from_utf8_lossy(line).into_owned()), head),
        b':' => (Reply::Int(int()?), head),
        b'$' => {
            let len = int()?;
            if len < 0 {
                (Reply::Null, head)
            } else {
                let len = len as usize;
                if buf.len() < head + len + 2 {
                    return Ok(None);
                }
                if &buf[head + len..head + len + 2] != b"\r\n" {
                    return Err(ProtocolError::InvalidReply);
                }
                (Reply::Bulk(buf[head..head + len].to_vec()), head + len + 2)
            }
        }
        b'*' => {
            let count = int()?;
            if count < 0 {
                (Reply::Null, head)
            } else {
                let mut items = Vec::with_capacity((count as usize).min(64));
                let mut at = head;
                for _ in 0..count {
                    match read_reply(&buf[at..])? {
                        Some((item, used)) => {
                            items.push(item);
                            at += used;
                        }
                        None => return Ok(None),
                    }
                }
                (Reply::Array(items), at)
            }
        }
        _ => return Err(ProtocolError::InvalidReply),
    };
    Ok(Some(reply))
}
