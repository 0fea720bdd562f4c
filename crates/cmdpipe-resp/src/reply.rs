//! Reply values and wire encoding helpers.

use std::borrow::Cow;

/// The result of executing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+<text>`
    Simple(String),
    /// `-<text>`
    Error(String),
    /// `:<n>`
    Int(i64),
    /// `$<len>` followed by the payload
    Bulk(Vec<u8>),
    /// `$-1`
    Null,
    /// `*<n>` followed by `n` nested replies
    Array(Vec<Reply>),
}

impl Reply {
    #[inline]
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    #[inline]
    pub fn queued() -> Self {
        Reply::Simple("QUEUED".to_string())
    }

    #[inline]
    pub fn pong() -> Self {
        Reply::Simple("PONG".to_string())
    }

    /// Error reply; `msg` should carry its own prefix (`ERR`, `EXECABORT`, ...)
    #[inline]
    pub fn error(msg: impl Into<String>) -> Self {
        Reply::Error(msg.into())
    }

    #[inline]
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(data.into())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Encode this reply onto the end of `buf`.
    pub fn append_to(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => append_simple(buf, s),
            Reply::Error(s) => append_error(buf, s),
            Reply::Int(n) => append_int(buf, *n),
            Reply::Bulk(b) => append_bulk(buf, b),
            Reply::Null => append_null(buf),
            Reply::Array(items) => {
                append_array(buf, items.len());
                for item in items {
                    item.append_to(buf);
                }
            }
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.append_to(&mut buf);
        buf
    }
}

fn append_prefix(buf: &mut Vec<u8>, c: u8, n: i64) {
    buf.push(c);
    if (0..=9).contains(&n) {
        buf.push(b'0' + n as u8);
    } else {
        buf.extend_from_slice(n.to_string().as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
}

fn strip_newlines(s: &str) -> Cow<'_, str> {
    if s.contains(['\r', '\n']) {
        Cow::Owned(s.replace(['\r', '\n'], " "))
    } else {
        Cow::Borrowed(s)
    }
}

pub fn append_ok(buf: &mut Vec<u8>) {
    buf.extend_from_slice(b"+OK\r\n");
}

pub fn append_simple(buf: &mut Vec<u8>, s: &str) {
    buf.push(b'+');
    buf.extend_from_slice(strip_newlines(s).as_bytes());
    buf.extend_from_slice(b"\r\n");
}

pub fn append_error(buf: &mut Vec<u8>, s: &str) {
    buf.push(b'-');
    buf.extend_from_slice(strip_newlines(s).as_bytes());
    buf.extend_from_slice(b"\r\n");
}

pub fn append_int(buf: &mut Vec<u8>, n: i64) {
    append_prefix(buf, b':', n);
}

pub fn append_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    append_prefix(buf, b'$', data.len() as i64);
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

pub fn append_null(buf: &mut Vec<u8>) {
    buf.extend_from_slice(b"$-1\r\n");
}

pub fn append_array(buf: &mut Vec<u8>, n: usize) {
    append_prefix(buf, b'*', n as i64);
}

/// Encode a request as a multi-bulk array of arguments.
pub fn append_command<A: AsRef<[u8]>>(buf: &mut Vec<u8>, args: &[A]) {
    append_array(buf, args.len());
    for arg in args {
        append_bulk(buf, arg.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_encoding() {
        assert_eq!(Reply::ok().to_bytes(), b"+OK\r\n");
        assert_eq!(Reply::error("ERR boom").to_bytes(), b"-ERR boom\r\n");
        assert_eq!(Reply::Int(-42).to_bytes(), b":-42\r\n");
        assert_eq!(Reply::Int(7).to_bytes(), b":7\r\n");
        assert_eq!(Reply::bulk("hi").to_bytes(), b"$2\r\nhi\r\n");
        assert_eq!(Reply::Null.to_bytes(), b"$-1\r\n");
    }

    #[test]
    fn test_newlines_replaced() {
        assert_eq!(Reply::error("ERR a\r\nb").to_bytes(), b"-ERR a  b\r\n");
        assert_eq!(Reply::Simple("x\ny".into()).to_bytes(), b"+x y\r\n");
    }

    #[test]
    fn test_nested_array() {
        let reply = Reply::Array(vec![
            Reply::queued(),
            Reply::Array(vec![Reply::Int(1), Reply::Null]),
        ]);
        assert_eq!(reply.to_bytes(), b"*2\r\n+QUEUED\r\n*2\r\n:1\r\n$-1\r\n");
        assert!(!reply.is_error());
    }

    #[test]
    fn test_append_command() {
        let mut buf = Vec::new();
        append_command(&mut buf, &["SET", "k", "0123456789"]);
        assert_eq!(buf, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$10\r\n0123456789\r\n");

        let frame = crate::parse_next(&buf).unwrap().unwrap();
        assert_eq!(frame.consumed, buf.len());
        assert_eq!(frame.args.len(), 3);
    }
}
