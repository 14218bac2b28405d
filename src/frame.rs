// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use std::string::FromUtf8Error;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// The null bulk string. Clients read it as "key does not exist", which is not the same thing as
/// an empty string (`$0\r\n\r\n`).
static NULL_BULK: &[u8; 5] = b"$-1\r\n";

/// Maximum nesting of arrays inside arrays. Commands are flat arrays, so anything deeper than
/// this is hostile input and would otherwise grow the stack without bound.
pub const MAX_DEPTH: usize = 32;

/// Largest bulk string payload accepted, same as the default `proto-max-bulk-len` of Redis.
pub const MAX_BULK_LENGTH: usize = 512 * 1024 * 1024;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("protocol error; invalid frame data type: {0:?}")]
    InvalidDataType(char),
    #[error("protocol error; invalid length {0:?}")]
    InvalidLength(String),
    #[error("protocol error; expected CRLF after bulk string payload")]
    MissingTerminator,
    #[error("protocol error; arrays nested deeper than {} levels", MAX_DEPTH)]
    DepthExceeded,
    /// Invalid message encoding.
    #[error("{0}")]
    Other(crate::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Parses a single frame from `src`, advancing the cursor past it.
    ///
    /// Returns [`Error::Incomplete`] when `src` ends before the frame does. In that case the
    /// cursor position is meaningless and the caller is expected to retry from the start of the
    /// frame once more data is available.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        Self::parse_nested(src, 0)
    }

    fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Self, Error> {
        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => {
                let bytes = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes)?;
                Ok(Frame::Simple(string))
            }
            DataType::SimpleError => {
                let bytes = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes)?;
                Ok(Frame::Error(string))
            }
            DataType::Integer => {
                let integer = get_decimal(src)?;
                Ok(Frame::Integer(integer))
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => {
                let length = get_decimal(src)?;

                if length == -1 {
                    return Ok(Frame::Null);
                }

                let length = usize::try_from(length)
                    .ok()
                    .filter(|length| *length <= MAX_BULK_LENGTH)
                    .ok_or_else(|| Error::InvalidLength(length.to_string()))?;

                // The payload is binary safe, it may contain CRLF itself, so it is read by length
                // and never by scanning for the terminator.
                let data = get_exact(src, length)?;
                let data = Bytes::copy_from_slice(data);

                if get_exact(src, CRLF.len())? != CRLF {
                    return Err(Error::MissingTerminator);
                }

                Ok(Frame::Bulk(data))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => {
                if depth >= MAX_DEPTH {
                    return Err(Error::DepthExceeded);
                }

                let length = get_decimal(src)?;
                let length =
                    usize::try_from(length).map_err(|_| Error::InvalidLength(length.to_string()))?;

                // Never trust the announced length for the allocation, the elements still have to
                // arrive.
                let mut frames = Vec::with_capacity(length.min(src.remaining()));
                for _ in 0..length {
                    let frame = Self::parse_nested(src, depth + 1)?;
                    frames.push(frame);
                }

                Ok(Frame::Array(frames))
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Frame::Simple(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleString));
                extend_line(&mut bytes, s);
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Error(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleError));
                extend_line(&mut bytes, s);
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Integer(i) => {
                let digits = i.to_string();
                let mut bytes = Vec::with_capacity(1 + digits.len() + CRLF.len());
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(digits.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Bulk(bytes) => {
                let length_str = bytes.len().to_string();
                let mut result = Vec::with_capacity(
                    1 + length_str.len() + CRLF.len() + bytes.len() + CRLF.len(),
                );
                result.push(u8::from(DataType::BulkString));
                result.extend_from_slice(length_str.as_bytes());
                result.extend_from_slice(CRLF);
                result.extend_from_slice(bytes);
                result.extend_from_slice(CRLF);
                result
            }
            Frame::Null => NULL_BULK.to_vec(),
            Frame::Array(arr) => {
                let length_str = arr.len().to_string();
                let mut bytes = Vec::with_capacity(1 + length_str.len() + CRLF.len());
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(length_str.as_bytes());
                bytes.extend_from_slice(CRLF);
                for frame in arr {
                    bytes.extend(frame.serialize());
                }
                bytes
            }
        }
    }

    /// Builds the array of bulk strings a client would send for `parts`.
    pub fn command<I, T>(parts: I) -> Frame
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Frame::Array(parts.into_iter().map(|p| Frame::Bulk(p.into())).collect())
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "$-1"),
            Frame::Array(arr) => {
                write!(f, "*{}", arr.len())?;
                for frame in arr {
                    write!(f, " {}", frame)?;
                }
                Ok(())
            }
        }
    }
}

/// Returns the bytes up to the next CRLF and moves the cursor past the terminator. The number of
/// bytes consumed, terminator included, is the change in the cursor position.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    let line_end = src.get_ref()[start..end]
        .windows(2)
        .position(|window| window == CRLF)
        .ok_or(Error::Incomplete)
        .map(|index| start + index)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&src.get_ref()[start..line_end])
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    let line = get_line(src)?;
    let line = std::str::from_utf8(line).map_err(|_| Error::InvalidLength(format!("{line:?}")))?;

    line.parse::<i64>()
        .map_err(|_| Error::InvalidLength(line.to_string()))
}

fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8], Error> {
    if src.remaining() < n {
        return Err(Error::Incomplete);
    }

    let start = src.position() as usize;
    src.advance(n);

    Ok(&src.get_ref()[start..start + n])
}

/// Writes the text of a simple string or error. A line can't carry CR or LF, so both become
/// spaces.
fn extend_line(dst: &mut Vec<u8>, line: &str) {
    dst.extend(line.bytes().map(|b| match b {
        b'\r' | b'\n' => b' ',
        b => b,
    }));
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

/// The RESP2 types this server understands. Commands only ever arrive as arrays of bulk strings,
/// the remaining types are accepted so every reply the server produces can be read back.
#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    BulkString,   // '$'
    SimpleError,  // '-'
    Integer,      // ':'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::InvalidDataType(byte as char)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        "protocol error; invalid frame format".into()
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn parse(data: &[u8]) -> Result<Frame, Error> {
        let mut cursor = Cursor::new(data);
        Frame::parse(&mut cursor)
    }

    fn round_trip(frame: Frame) {
        let bytes = frame.serialize();
        let mut cursor = Cursor::new(&bytes[..]);

        let parsed = Frame::parse(&mut cursor).unwrap();

        assert_eq!(parsed, frame);
        assert_eq!(cursor.position() as usize, bytes.len());
    }

    #[test]
    fn parse_simple_string_frame() {
        let frame = parse(b"+OK\r\n");

        assert!(matches!(frame, Ok(Frame::Simple(ref s)) if s == "OK"));
    }

    #[test]
    fn parse_simple_error_frame() {
        let frame = parse(b"-Error message\r\n");

        assert!(matches!(
            frame,
            Ok(Frame::Error(ref s)) if s == "Error message"
        ));
    }

    fn parse_integer_frame(data: &[u8], expected: i64) {
        let frame = parse(data);

        assert!(matches!(frame, Ok(Frame::Integer(i)) if i == expected));
    }

    #[test]
    fn parse_integer_frame_positive() {
        parse_integer_frame(b":1000\r\n", 1000);
    }

    #[test]
    fn parse_integer_frame_negative() {
        parse_integer_frame(b":-1000\r\n", -1000);
    }

    #[test]
    fn parse_integer_frame_zero() {
        parse_integer_frame(b":0\r\n", 0);
    }

    #[test]
    fn parse_integer_frame_positive_singned() {
        parse_integer_frame(b":+1000\r\n", 1000);
    }

    #[test]
    fn parse_bulk_string_frame() {
        let frame = parse(b"$6\r\nfoobar\r\n");

        assert!(matches!(
            frame,
            Ok(Frame::Bulk(ref b)) if b == &Bytes::from("foobar")
        ));
    }

    #[test]
    fn parse_bulk_string_frame_empty() {
        let frame = parse(b"$0\r\n\r\n");

        assert!(matches!(
            frame,
            Ok(Frame::Bulk(ref b)) if b.is_empty()
        ));
    }

    #[test]
    fn parse_bulk_string_frame_null() {
        let frame = parse(b"$-1\r\n");

        assert!(matches!(frame, Ok(Frame::Null)));
    }

    #[test]
    fn parse_bulk_string_frame_with_crlf_in_payload() {
        let frame = parse(b"$12\r\nHello\r\nWorld\r\n");

        assert!(matches!(
            frame,
            Ok(Frame::Bulk(ref b)) if b == &Bytes::from("Hello\r\nWorld")
        ));
    }

    #[test]
    fn parse_bulk_string_frame_missing_terminator() {
        let frame = parse(b"$3\r\nfooXY");

        assert!(matches!(frame, Err(Error::MissingTerminator)));
    }

    #[test]
    fn parse_bulk_string_frame_invalid_length() {
        assert!(matches!(parse(b"$-2\r\n"), Err(Error::InvalidLength(_))));
        assert!(matches!(parse(b"$abc\r\n"), Err(Error::InvalidLength(_))));
    }

    #[test]
    fn parse_array_frame_empty() {
        let frame = parse(b"*0\r\n");

        assert!(matches!(frame, Ok(Frame::Array(ref a)) if a.is_empty()));
    }

    #[test]
    fn parse_array_frame() {
        let frame = parse(b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n").unwrap();

        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("hello")),
                Frame::Bulk(Bytes::from("world")),
            ])
        );
    }

    #[test]
    fn parse_array_frame_nested() {
        let frame = parse(b"*2\r\n*3\r\n:1\r\n:2\r\n:3\r\n*2\r\n+Hello\r\n-World\r\n").unwrap();

        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Array(vec![
                    Frame::Integer(1),
                    Frame::Integer(2),
                    Frame::Integer(3)
                ]),
                Frame::Array(vec![
                    Frame::Simple("Hello".to_string()),
                    Frame::Error("World".to_string())
                ]),
            ])
        );
    }

    #[test]
    fn parse_array_frame_negative_length() {
        let frame = parse(b"*-1\r\n");

        assert!(matches!(frame, Err(Error::InvalidLength(_))));
    }

    #[test]
    fn parse_array_frame_null_in_the_middle() {
        let frame = parse(b"*3\r\n$5\r\nhello\r\n$-1\r\n$5\r\nworld\r\n").unwrap();

        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("hello")),
                Frame::Null,
                Frame::Bulk(Bytes::from("world")),
            ])
        );
    }

    #[test]
    fn parse_array_frame_too_deep() {
        let mut data = b"*1\r\n".repeat(MAX_DEPTH + 1);
        data.extend_from_slice(b"*0\r\n");

        assert!(matches!(parse(&data), Err(Error::DepthExceeded)));
    }

    #[test]
    fn parse_unknown_data_type() {
        assert!(matches!(parse(b"%1\r\n"), Err(Error::InvalidDataType('%'))));
        assert!(matches!(
            parse(b"GET foo\r\n"),
            Err(Error::InvalidDataType('G'))
        ));
    }

    #[test]
    fn parse_incomplete() {
        let data = b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n";

        for end in 0..data.len() {
            assert!(
                matches!(parse(&data[..end]), Err(Error::Incomplete)),
                "prefix of {} bytes should be incomplete",
                end
            );
        }
    }

    #[test]
    fn serialize_null_and_empty_bulk() {
        let null = Frame::Null.serialize();
        let empty = Frame::Bulk(Bytes::new()).serialize();

        assert_eq!(null, b"$-1\r\n");
        assert_eq!(null.len(), 5);
        assert_eq!(empty, b"$0\r\n\r\n");
        assert_ne!(null, empty);
    }

    #[test]
    fn serialize_line_breaks_in_simple_text() {
        let frame = Frame::Error("ERR unknown command 'FOO\r\n+OK'".to_string());
        let bytes = frame.serialize();

        assert_eq!(bytes, b"-ERR unknown command 'FOO  +OK'\r\n");

        let mut cursor = Cursor::new(&bytes[..]);
        let parsed = Frame::parse(&mut cursor).unwrap();
        assert_eq!(cursor.position() as usize, bytes.len());
        assert_eq!(
            parsed,
            Frame::Error("ERR unknown command 'FOO  +OK'".to_string())
        );

        assert_eq!(
            Frame::Simple("a\nb".to_string()).serialize(),
            b"+a b\r\n"
        );
    }

    #[test]
    fn serialize_command() {
        let frame = Frame::command(["SET", "name", "Alice"]);

        assert_eq!(
            frame.serialize(),
            b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$5\r\nAlice\r\n"
        );
    }

    #[test]
    fn round_trip_every_variant() {
        round_trip(Frame::Simple("PONG".to_string()));
        round_trip(Frame::Error("ERR unknown command 'FOO'".to_string()));
        round_trip(Frame::Integer(-42));
        round_trip(Frame::Bulk(Bytes::from("Alice")));
        round_trip(Frame::Bulk(Bytes::new()));
        round_trip(Frame::Null);
        round_trip(Frame::Array(vec![]));
        round_trip(Frame::Array(vec![
            Frame::Integer(1),
            Frame::Null,
            Frame::Array(vec![Frame::Bulk(Bytes::from("nested"))]),
        ]));
    }

    #[test]
    fn round_trip_binary_payload() {
        let mut payload = vec![0u8; 1024];
        rand::thread_rng().fill(&mut payload[..]);
        payload.extend_from_slice(b"\r\n\r\n");

        round_trip(Frame::Bulk(Bytes::from(payload)));
    }
}
