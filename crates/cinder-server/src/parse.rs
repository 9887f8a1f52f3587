//! Request framing for the admin listener.
//!
//! A request is either a RESP array of bulk strings, as sent by
//! `redis-cli` and client libraries, or an inline text line. Both forms
//! produce the same argument list.
//!
//! The parser works on the buffered bytes without consuming them and
//! reports how much it used, so the caller can retry once more data
//! arrives.

use std::io::Cursor;

use thiserror::Error;

/// Most arguments a single request may carry.
const MAX_ARGS: usize = 1 << 20;

/// Longest single bulk argument.
const MAX_BULK_LEN: i64 = 512 * 1024;

/// Malformed request data. The connection is closed after reporting it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Not an error on the wire: more bytes are needed.
    #[error("incomplete request")]
    Incomplete,

    #[error("invalid multibulk length")]
    InvalidMultibulkLength,

    #[error("invalid bulk length")]
    InvalidBulkLength,

    #[error("expected '$', got '{0}'")]
    ExpectedBulk(char),

    #[error("bulk string is not terminated by CRLF")]
    MissingCrlf,
}

/// Parses one request from the front of `buf`.
///
/// Returns `Ok(Some((args, consumed)))` for a complete request,
/// `Ok(None)` if more data is needed, or an error for malformed input.
/// Blank inline lines yield an empty argument list.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Vec<String>, usize)>, ProtocolError> {
    match buf.first() {
        None => Ok(None),
        Some(b'*') => {
            let mut cursor = Cursor::new(buf);
            match parse_array(&mut cursor) {
                Ok(args) => Ok(Some((args, cursor.position() as usize))),
                Err(ProtocolError::Incomplete) => Ok(None),
                Err(e) => Err(e),
            }
        }
        Some(_) => Ok(parse_inline(buf)),
    }
}

fn parse_inline(buf: &[u8]) -> Option<(Vec<String>, usize)> {
    let pos = memchr::memchr(b'\n', buf)?;
    let line = String::from_utf8_lossy(&buf[..pos]);
    let args = line.split_ascii_whitespace().map(str::to_owned).collect();
    Some((args, pos + 1))
}

fn parse_array(cursor: &mut Cursor<&[u8]>) -> Result<Vec<String>, ProtocolError> {
    // caller checked the '*'
    read_byte(cursor)?;
    let count = read_integer_line(cursor, ProtocolError::InvalidMultibulkLength)?;
    if count < 0 || count as u64 > MAX_ARGS as u64 {
        return Err(ProtocolError::InvalidMultibulkLength);
    }

    let count = count as usize;
    let mut args = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        match read_byte(cursor)? {
            b'$' => {}
            other => return Err(ProtocolError::ExpectedBulk(char::from(other))),
        }
        let len = read_integer_line(cursor, ProtocolError::InvalidBulkLength)?;
        if !(0..=MAX_BULK_LEN).contains(&len) {
            return Err(ProtocolError::InvalidBulkLength);
        }
        let len = len as usize;

        // need `len` bytes of data + \r\n
        let pos = cursor.position() as usize;
        let buf = *cursor.get_ref();
        if buf.len() < pos + len + 2 {
            return Err(ProtocolError::Incomplete);
        }
        if &buf[pos + len..pos + len + 2] != b"\r\n" {
            return Err(ProtocolError::MissingCrlf);
        }
        args.push(String::from_utf8_lossy(&buf[pos..pos + len]).into_owned());
        cursor.set_position((pos + len + 2) as u64);
    }
    Ok(args)
}

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    let byte = *cursor.get_ref().get(pos).ok_or(ProtocolError::Incomplete)?;
    cursor.set_position((pos + 1) as u64);
    Ok(byte)
}

/// Reads up to the next `\r\n` and parses the line as an integer.
fn read_integer_line(
    cursor: &mut Cursor<&[u8]>,
    invalid: ProtocolError,
) -> Result<i64, ProtocolError> {
    let buf = *cursor.get_ref();
    let start = cursor.position() as usize;
    let rest = buf.get(start..).ok_or(ProtocolError::Incomplete)?;
    let cr = memchr::memchr(b'\r', rest).ok_or(ProtocolError::Incomplete)?;
    match rest.get(cr + 1) {
        None => return Err(ProtocolError::Incomplete),
        Some(b'\n') => {}
        Some(_) => return Err(invalid),
    }
    cursor.set_position((start + cr + 2) as u64);

    std::str::from_utf8(&rest[..cr])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_parse(input: &[u8]) -> Vec<String> {
        let (args, consumed) = parse_request(input)
            .expect("parse should not error")
            .expect("parse should return a request");
        assert_eq!(consumed, input.len(), "should consume entire input");
        args
    }

    #[test]
    fn inline_lines() {
        assert_eq!(must_parse(b"PING\r\n"), vec!["PING"]);
        assert_eq!(
            must_parse(b"  cluster   forget abc \n"),
            vec!["cluster", "forget", "abc"]
        );
        assert!(must_parse(b"\r\n").is_empty());
        assert_eq!(parse_request(b"PING").unwrap(), None);
    }

    #[test]
    fn resp_array() {
        let input = b"*3\r\n$7\r\ncluster\r\n$6\r\nforget\r\n$13\r\n1ip23j89123no\r\n";
        assert_eq!(must_parse(input), vec!["cluster", "forget", "1ip23j89123no"]);
    }

    #[test]
    fn resp_arguments_keep_whitespace() {
        let input = b"*3\r\n$7\r\nCLUSTER\r\n$7\r\nKEYSLOT\r\n$7\r\na b\r\ncd\r\n";
        assert_eq!(must_parse(input), vec!["CLUSTER", "KEYSLOT", "a b\r\ncd"]);
        assert!(must_parse(b"*0\r\n").is_empty());
    }

    #[test]
    fn incomplete_array_waits_for_more() {
        let input = b"*2\r\n$4\r\nPING\r\n$2\r\nhi\r\n";
        for cut in 1..input.len() {
            assert_eq!(parse_request(&input[..cut]).unwrap(), None, "cut at {cut}");
        }
        assert_eq!(must_parse(input), vec!["PING", "hi"]);
    }

    #[test]
    fn pipelined_requests_report_consumed() {
        let input = b"*1\r\n$4\r\nPING\r\nPING\n";
        let (args, consumed) = parse_request(input).unwrap().unwrap();
        assert_eq!(args, vec!["PING"]);
        assert_eq!(consumed, 14);
        assert_eq!(must_parse(&input[consumed..]), vec!["PING"]);
    }

    #[test]
    fn malformed_arrays() {
        assert_eq!(
            parse_request(b"*-1\r\n"),
            Err(ProtocolError::InvalidMultibulkLength)
        );
        assert_eq!(
            parse_request(b"*x\r\n"),
            Err(ProtocolError::InvalidMultibulkLength)
        );
        assert_eq!(
            parse_request(b"*1\r\n:5\r\n"),
            Err(ProtocolError::ExpectedBulk(':'))
        );
        assert_eq!(
            parse_request(b"*1\r\n$-1\r\n"),
            Err(ProtocolError::InvalidBulkLength)
        );
        assert_eq!(
            parse_request(b"*1\r\n$2\r\nabcd\r\n"),
            Err(ProtocolError::MissingCrlf)
        );
    }
}
