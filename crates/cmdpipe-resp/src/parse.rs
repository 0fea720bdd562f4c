//! Request framing.
//!
//! Two request forms are accepted on the same stream:
//!
//! - multi-bulk: `*<n>\r\n` followed by `n` arguments of `$<len>\r\n<bytes>\r\n`
//! - inline: a space-separated line ending in `\n` (optionally `\r\n`), with
//!   single or double quoted arguments and `\n \r \t` escapes inside quotes
//!
//! Multi-bulk arguments borrow from the input buffer. Quoted inline
//! arguments are owned because escapes rewrite them.

use std::borrow::Cow;

use crate::error::ProtocolError;

/// One complete request pulled from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Request arguments, command name first. Empty for `*0` and blank lines.
    pub args: Vec<Cow<'a, [u8]>>,
    /// Bytes of the buffer this frame occupied.
    pub consumed: usize,
}

impl<'a> Frame<'a> {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Borrow the arguments as plain slices.
    pub fn arg_slices(&self) -> Vec<&[u8]> {
        self.args.iter().map(|a| a.as_ref()).collect()
    }
}

/// Parse the next request at the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds only a partial request; the caller
/// keeps the bytes and retries once more arrive.
pub fn parse_next(buf: &[u8]) -> Result<Option<Frame<'_>>, ProtocolError> {
    match buf.first() {
        None => Ok(None),
        Some(b'*') => parse_multibulk(buf),
        Some(_) => parse_inline(buf),
    }
}

/// Parse an ASCII decimal integer with optional leading `-`.
pub(crate) fn parse_int(b: &[u8]) -> Option<i64> {
    let (neg, digits) = match b.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, b),
    };
    if digits.is_empty() {
        return None;
    }
    let mut n: i64 = 0;
    for &c in digits {
        if !c.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add(i64::from(c - b'0'))?;
    }
    Some(if neg { -n } else { n })
}

#[inline]
fn find_newline(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&c| c == b'\n')
        .map(|p| from + p)
}

fn parse_multibulk(buf: &[u8]) -> Result<Option<Frame<'_>>, ProtocolError> {
    let Some(nl) = find_newline(buf, 1) else {
        return Ok(None);
    };
    if buf[nl - 1] != b'\r' {
        return Err(ProtocolError::InvalidMultiBulkLength);
    }
    let count = parse_int(&buf[1..nl - 1])
        .filter(|&n| n >= 0)
        .ok_or(ProtocolError::InvalidMultiBulkLength)? as usize;

    let mut i = nl + 1;
    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        if i >= buf.len() {
            return Ok(None);
        }
        if buf[i] != b'$' {
            return Err(ProtocolError::UnexpectedByte(buf[i]));
        }
        let Some(nl) = find_newline(buf, i + 1) else {
            return Ok(None);
        };
        if buf[nl - 1] != b'\r' {
            return Err(ProtocolError::InvalidBulkLength);
        }
        let n = parse_int(&buf[i + 1..nl - 1])
            .filter(|&n| n >= 0)
            .ok_or(ProtocolError::InvalidBulkLength)? as usize;

        let start = nl + 1;
        if buf.len() - start < n + 2 {
            return Ok(None);
        }
        if buf[start + n] != b'\r' || buf[start + n + 1] != b'\n' {
            return Err(ProtocolError::InvalidBulkLength);
        }
        args.push(Cow::Borrowed(&buf[start..start + n]));
        i = start + n + 2;
    }
    Ok(Some(Frame { args, consumed: i }))
}

fn parse_inline(buf: &[u8]) -> Result<Option<Frame<'_>>, ProtocolError> {
    let Some(nl) = find_newline(buf, 0) else {
        return Ok(None);
    };
    let end = if nl > 0 && buf[nl - 1] == b'\r' { nl - 1 } else { nl };
    let args = split_inline(&buf[..end])?;
    Ok(Some(Frame { args, consumed: nl + 1 }))
}

fn split_inline(line: &[u8]) -> Result<Vec<Cow<'_, [u8]>>, ProtocolError> {
    let mut args = Vec::new();
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b' ' => i += 1,
            quote @ (b'"' | b'\'') => {
                i += 1;
                let mut arg = Vec::new();
                let mut closed = false;
                while i < line.len() {
                    let c = line[i];
                    i += 1;
                    if c == b'\\' && i < line.len() {
                        arg.push(match line[i] {
                            b'n' => b'\n',
                            b'r' => b'\r',
                            b't' => b'\t',
                            other => other,
                        });
                        i += 1;
                    } else if c == quote {
                        closed = true;
                        break;
                    } else {
                        arg.push(c);
                    }
                }
                // closing quote must end the token
                if !closed || (i < line.len() && line[i] != b' ') {
                    return Err(ProtocolError::UnbalancedQuotes);
                }
                args.push(Cow::Owned(arg));
            }
            _ => {
                let start = i;
                while i < line.len() && line[i] != b' ' {
                    if line[i] == b'"' || line[i] == b'\'' {
                        return Err(ProtocolError::UnbalancedQuotes);
                    }
                    i += 1;
                }
                args.push(Cow::Borrowed(&line[start..i]));
            }
        }
    }
    Ok(args)
}
