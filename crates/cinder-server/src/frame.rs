//! Reply frames for the admin listener.
//!
//! Replies are RESP so `redis-cli` and friends can talk to the admin
//! port directly. Integers are formatted with `itoa` straight into the
//! output buffer.

use bytes::{BufMut, Bytes, BytesMut};

/// A single reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Status reply, e.g. `+OK\r\n`.
    Simple(String),

    /// Error reply, e.g. `-ERR unknown subcommand\r\n`.
    Error(String),

    /// `:42\r\n`
    Integer(i64),

    /// Binary-safe string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// `*2\r\n...` followed by the items.
    Array(Vec<Frame>),
}

impl Frame {
    pub fn ok() -> Self {
        Frame::Simple("OK".into())
    }

    /// Error reply with the conventional `ERR ` prefix.
    pub fn err(msg: impl std::fmt::Display) -> Self {
        Frame::Error(format!("ERR {msg}"))
    }

    /// Bulk reply holding UTF-8 text.
    pub fn text(s: impl Into<String>) -> Self {
        Frame::Bulk(Bytes::from(s.into()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Serializes this frame into the provided buffer, including the
    /// trailing `\r\n` delimiters.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => line(dst, b'+', s.as_bytes()),
            Frame::Error(msg) => line(dst, b'-', msg.as_bytes()),
            Frame::Integer(n) => {
                dst.put_u8(b':');
                write_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => {
                dst.put_u8(b'$');
                write_i64(data.len() as i64, dst);
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(items) => {
                dst.put_u8(b'*');
                write_i64(items.len() as i64, dst);
                dst.put_slice(b"\r\n");
                for item in items {
                    item.serialize(dst);
                }
            }
        }
    }
}

fn line(dst: &mut BytesMut, prefix: u8, body: &[u8]) {
    dst.put_u8(prefix);
    // a stray newline would split the reply in two
    for &b in body {
        dst.put_u8(if b == b'\r' || b == b'\n' { b' ' } else { b });
    }
    dst.put_slice(b"\r\n");
}

/// Writes an i64 as its decimal ASCII representation directly into the buffer.
fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}
