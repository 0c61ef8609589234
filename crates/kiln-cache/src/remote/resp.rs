//! Minimal RESP (REdis Serialization Protocol) encoding and reply parsing.
//!
//! Only what the cache needs: command arrays out, and the four reply kinds a
//! `GET`/`SET` exchange can produce. Anything else is a protocol violation
//! and tears down the connection.

use std::io::{self, BufRead};

/// Largest bulk payload we will accept from the server.
const MAX_BULK_LEN: i64 = 1024 * 1024 * 1024;

/// A single server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    /// `+OK` style status line.
    Status(String),
    /// `-ERR …` error line.
    Error(String),
    /// `$N` bulk payload.
    Bulk(Vec<u8>),
    /// `$-1` — the key does not exist.
    Nil,
}

/// Encode a command as a RESP array of bulk strings.
pub(crate) fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one reply from the server.
pub(crate) fn read_reply(reader: &mut impl BufRead) -> io::Result<Reply> {
    let line = read_line(reader)?;
    let (kind, rest) = line
        .split_first()
        .ok_or_else(|| io::Error::other("empty reply line"))?;
    let rest = String::from_utf8_lossy(rest).into_owned();

    match *kind {
        b'+' => Ok(Reply::Status(rest)),
        b'-' => Ok(Reply::Error(rest)),
        b':' => Ok(Reply::Status(rest)),
        b'$' => {
            let len: i64 = rest
                .parse()
                .map_err(|_| io::Error::other("bad bulk length"))?;
            if len == -1 {
                return Ok(Reply::Nil);
            }
            if !(0..=MAX_BULK_LEN).contains(&len) {
                return Err(io::Error::other("implausible bulk length"));
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload)?;
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf)?;
            if &crlf != b"\r\n" {
                return Err(io::Error::other("bulk payload not CRLF-terminated"));
            }
            Ok(Reply::Bulk(payload))
        }
        other => Err(io::Error::other(format!(
            "unexpected reply type 0x{other:02x}"
        ))),
    }
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    if !line.ends_with(b"\r\n") {
        return Err(io::Error::other("reply line not CRLF-terminated"));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encodes_get_command() {
        let encoded = encode_command(&[b"GET", b"kiln_abc_.entry"]);
        assert_eq!(
            encoded,
            b"*2\r\n$3\r\nGET\r\n$15\r\nkiln_abc_.entry\r\n"
        );
    }

    #[test]
    fn parses_status_error_bulk_and_nil() {
        let mut input = Cursor::new(b"+OK\r\n-ERR nope\r\n$5\r\nhello\r\n$-1\r\n".to_vec());
        assert_eq!(read_reply(&mut input).unwrap(), Reply::Status("OK".into()));
        assert_eq!(
            read_reply(&mut input).unwrap(),
            Reply::Error("ERR nope".into())
        );
        assert_eq!(read_reply(&mut input).unwrap(), Reply::Bulk(b"hello".to_vec()));
        assert_eq!(read_reply(&mut input).unwrap(), Reply::Nil);
    }

    #[test]
    fn bulk_payload_may_contain_crlf() {
        let mut input = Cursor::new(b"$6\r\na\r\nb\r\r\n".to_vec());
        assert_eq!(
            read_reply(&mut input).unwrap(),
            Reply::Bulk(b"a\r\nb\r".to_vec())
        );
    }

    #[test]
    fn rejects_array_replies() {
        let mut input = Cursor::new(b"*1\r\n$1\r\nx\r\n".to_vec());
        assert!(read_reply(&mut input).is_err());
    }

    #[test]
    fn rejects_truncated_bulk() {
        let mut input = Cursor::new(b"$10\r\nshort\r\n".to_vec());
        assert!(read_reply(&mut input).is_err());
    }

    #[test]
    fn rejects_implausible_bulk_length() {
        let mut input = Cursor::new(b"$99999999999999\r\n".to_vec());
        assert!(read_reply(&mut input).is_err());
    }
}
