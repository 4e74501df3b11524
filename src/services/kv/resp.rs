//! Minimal wire codec for the key-value store protocol (RESP framing).
//!
//! Only the five reply shapes the backend needs are implemented: simple
//! strings, errors, integers, bulk strings and arrays.

use std::io;

/// Upper bound on a single bulk payload. The length comes straight off the
/// wire, so it must not be trusted to size an allocation.
const MAX_BULK_LEN: usize = 64 * 1024 * 1024;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// One decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the protocol's nil bulk (absent key).
    Bulk(Option<Vec<u8>>),
    /// `None` is the nil array.
    Array(Option<Vec<Reply>>),
}

/// Encode a command as an array of bulk strings.
pub(crate) fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

fn bad_frame(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("malformed reply: {detail}"))
}

async fn read_line<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-reply",
        ));
    }
    if !line.ends_with("\r\n") {
        return Err(bad_frame("line missing CRLF terminator"));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

/// Decode one reply. Boxed because arrays recurse.
pub(crate) fn read_reply<'a, R>(reader: &'a mut R) -> BoxFuture<'a, io::Result<Reply>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        // The type tag must be a single ASCII byte; a blank line or a
        // multi-byte first character is not a frame.
        if !line.is_char_boundary(1) {
            return Err(bad_frame("missing reply type tag"));
        }
        let (kind, rest) = line.split_at(1);
        match kind {
            "+" => Ok(Reply::Simple(rest.to_string())),
            "-" => Ok(Reply::Error(rest.to_string())),
            ":" => rest
                .parse()
                .map(Reply::Integer)
                .map_err(|_| bad_frame("integer reply not numeric")),
            "$" => {
                let len: i64 = rest.parse().map_err(|_| bad_frame("bulk length not numeric"))?;
                if len < 0 {
                    return Ok(Reply::Bulk(None));
                }
                if len as u64 > MAX_BULK_LEN as u64 {
                    return Err(bad_frame("bulk length exceeds the payload limit"));
                }
                let mut data = vec![0u8; len as usize + 2];
                reader.read_exact(&mut data).await?;
                if &data[len as usize..] != b"\r\n" {
                    return Err(bad_frame("bulk payload missing CRLF terminator"));
                }
                data.truncate(len as usize);
                Ok(Reply::Bulk(Some(data)))
            }
            "*" => {
                let len: i64 = rest
                    .parse()
                    .map_err(|_| bad_frame("array length not numeric"))?;
                if len < 0 {
                    return Ok(Reply::Array(None));
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_reply(reader).await?);
                }
                Ok(Reply::Array(Some(items)))
            }
            other => Err(bad_frame(&format!("unknown reply type `{other}`"))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn decode(raw: &[u8]) -> io::Result<Reply> {
        let mut reader = BufReader::new(raw);
        read_reply(&mut reader).await
    }

    #[test]
    fn command_framing() {
        let buf = encode_command(&[b"GET", b"/a/b"]);
        assert_eq!(buf, b"*2\r\n$3\r\nGET\r\n$4\r\n/a/b\r\n");
    }

    #[tokio::test]
    async fn simple_error_and_integer_replies() {
        assert_eq!(decode(b"+OK\r\n").await.unwrap(), Reply::Simple("OK".into()));
        assert_eq!(
            decode(b"-ERR unknown command\r\n").await.unwrap(),
            Reply::Error("ERR unknown command".into())
        );
        assert_eq!(decode(b":42\r\n").await.unwrap(), Reply::Integer(42));
    }

    #[tokio::test]
    async fn bulk_replies_including_nil() {
        assert_eq!(
            decode(b"$5\r\nhello\r\n").await.unwrap(),
            Reply::Bulk(Some(b"hello".to_vec()))
        );
        assert_eq!(decode(b"$0\r\n\r\n").await.unwrap(), Reply::Bulk(Some(vec![])));
        assert_eq!(decode(b"$-1\r\n").await.unwrap(), Reply::Bulk(None));
    }

    #[tokio::test]
    async fn nested_array_reply() {
        // The shape a cursor scan returns: [cursor, [keys...]].
        let raw = b"*2\r\n$1\r\n0\r\n*2\r\n$2\r\n/a\r\n$2\r\n/b\r\n";
        assert_eq!(
            decode(raw).await.unwrap(),
            Reply::Array(Some(vec![
                Reply::Bulk(Some(b"0".to_vec())),
                Reply::Array(Some(vec![
                    Reply::Bulk(Some(b"/a".to_vec())),
                    Reply::Bulk(Some(b"/b".to_vec())),
                ])),
            ]))
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_rejected() {
        assert!(decode(b"?nope\r\n").await.is_err());
        assert!(decode(b":abc\r\n").await.is_err());
        assert!(decode(b"$5\r\nhelloXY").await.is_err());
        assert!(decode(b"").await.is_err());
    }

    #[tokio::test]
    async fn blank_or_non_ascii_type_tags_are_errors_not_panics() {
        // A bare CRLF has no type tag at all.
        assert!(decode(b"\r\n").await.is_err());
        // A multi-byte first character must not trip the tag split.
        assert!(decode("é\r\n".as_bytes()).await.is_err());
        assert!(decode("崩OK\r\n".as_bytes()).await.is_err());
    }

    #[tokio::test]
    async fn oversized_bulk_lengths_are_rejected_before_allocating() {
        assert!(decode(b"$9999999999\r\n").await.is_err());
        assert!(decode(b"$67108865\r\n").await.is_err());
    }
}
