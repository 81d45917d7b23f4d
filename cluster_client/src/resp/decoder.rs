//! Resumable RESP decoder.
//!
//! Redis-compatible servers frame every value with a one-byte type
//! prefix, a content region, and a trailing `\r\n`. The decoder here is
//! a pure function over an accumulated buffer and cursor, so a single
//! node connection can resume decoding across partial socket reads
//! without blocking the driver thread.

use super::token::Token;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    BadLength(String),
    NegativeLength(i64),
    Truncated,
    IntegerOverflow(String),
    InvalidBoolean(u8),
    UnknownType(u8),
    MalformedLine,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadLength(s) => write!(f, "malformed length: {s}"),
            ParseError::NegativeLength(n) => write!(f, "negative length: {n}"),
            ParseError::Truncated => write!(f, "frame truncated"),
            ParseError::IntegerOverflow(s) => write!(f, "integer overflow: {s}"),
            ParseError::InvalidBoolean(b) => write!(f, "invalid boolean byte: {b}"),
            ParseError::UnknownType(b) => write!(f, "unknown RESP type byte: {}", *b as char),
            ParseError::MalformedLine => write!(f, "malformed line, missing CRLF"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Outcome of attempting to decode one token from the front of a buffer.
pub enum DecodeOutcome {
    /// Not enough bytes yet; caller should read more and retry.
    Incomplete,
    /// A full token was decoded, consuming `consumed` bytes from the front.
    Done { token: Token, consumed: usize },
}

/// Decodes one RESP value starting at the front of `buf`.
///
/// This is the resumable entry point: given
/// `(buffer, cursor)` it returns `Incomplete`, or `(Token,
/// consumed_bytes)`. The cursor is represented implicitly: callers pass
/// the unconsumed remainder of their buffer each time.
pub fn decode_one(buf: &[u8]) -> Result<DecodeOutcome, ParseError> {
    if buf.is_empty() {
        return Ok(DecodeOutcome::Incomplete);
    }
    let tag = buf[0];
    let rest = &buf[1..];
    match tag {
        b'+' => decode_line(rest, 1, |s| Ok(Token::SimpleString(s.to_string()))),
        b'-' => decode_line(rest, 1, |s| Ok(Token::SimpleError(s.to_string()))),
        b':' => decode_line(rest, 1, |s| {
            parse_i64(s).map(Token::Number)
        }),
        b',' => decode_line(rest, 1, |s| {
            s.parse::<f64>()
                .map(Token::Double)
                .map_err(|_| ParseError::BadLength(s.to_string()))
        }),
        b'(' => decode_line(rest, 1, |s| Ok(Token::BigNumber(s.to_string()))),
        b'#' => decode_line(rest, 1, |s| match s {
            "t" => Ok(Token::Boolean(true)),
            "f" => Ok(Token::Boolean(false)),
            _ => Err(ParseError::InvalidBoolean(s.bytes().next().unwrap_or(0))),
        }),
        b'_' => decode_line(rest, 1, |s| {
            if s.is_empty() {
                Ok(Token::Null)
            } else {
                Err(ParseError::MalformedLine)
            }
        }),
        b'$' => decode_blob(rest, 1, BlobKind::String),
        b'!' => decode_blob(rest, 1, BlobKind::Error),
        b'=' => decode_blob(rest, 1, BlobKind::Verbatim),
        b'*' => decode_aggregate(rest, 1, AggKind::Array),
        b'~' => decode_aggregate(rest, 1, AggKind::Set),
        b'>' => decode_aggregate(rest, 1, AggKind::Push),
        b'%' => decode_aggregate(rest, 1, AggKind::Map),
        b'|' => decode_attribute(rest, 1),
        other => Err(ParseError::UnknownType(other)),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decodes a CRLF-terminated line, invoking `build` on its text content.
/// `prefix_len` is the number of bytes already consumed for the type tag.
fn decode_line(
    buf: &[u8],
    prefix_len: usize,
    build: impl FnOnce(&str) -> Result<Token, ParseError>,
) -> Result<DecodeOutcome, ParseError> {
    match find_crlf(buf) {
        None => Ok(DecodeOutcome::Incomplete),
        Some(idx) => {
            let line = std::str::from_utf8(&buf[..idx]).map_err(|_| ParseError::MalformedLine)?;
            let token = build(line)?;
            Ok(DecodeOutcome::Done {
                token,
                consumed: prefix_len + idx + 2,
            })
        }
    }
}

fn parse_i64(s: &str) -> Result<i64, ParseError> {
    s.parse::<i64>()
        .map_err(|_| ParseError::BadLength(s.to_string()))
}

/// Parses the declared length of a `$`/`!`/`=`/`*`/`~`/`%`/`|` header.
/// `-1` is accepted (RESP2 null marker) and surfaced as `Ok(-1)`; any
/// other negative value is a protocol error.
fn parse_len(s: &str) -> Result<i64, ParseError> {
    let n = parse_i64(s)?;
    if n < -1 {
        return Err(ParseError::NegativeLength(n));
    }
    Ok(n)
}

enum BlobKind {
    String,
    Error,
    Verbatim,
}

fn decode_blob(buf: &[u8], prefix_len: usize, kind: BlobKind) -> Result<DecodeOutcome, ParseError> {
    let header_end = match find_crlf(buf) {
        None => return Ok(DecodeOutcome::Incomplete),
        Some(idx) => idx,
    };
    let header =
        std::str::from_utf8(&buf[..header_end]).map_err(|_| ParseError::MalformedLine)?;
    let len = parse_len(header)?;
    let header_consumed = prefix_len + header_end + 2;

    if len == -1 {
        return Ok(DecodeOutcome::Done {
            token: Token::Null,
            consumed: header_consumed,
        });
    }
    let len = len as usize;
    let body_start = header_end + 2;
    let needed = body_start + len + 2;
    if buf.len() < needed {
        return Ok(DecodeOutcome::Incomplete);
    }
    let body = &buf[body_start..body_start + len];
    if &buf[body_start + len..needed] != b"\r\n" {
        return Err(ParseError::MalformedLine);
    }

    let token = match kind {
        BlobKind::String => Token::BlobString(body.to_vec()),
        BlobKind::Error => Token::BlobError(String::from_utf8_lossy(body).into_owned()),
        BlobKind::Verbatim => {
            if body.len() < 4 || body[3] != b':' {
                return Err(ParseError::MalformedLine);
            }
            let encoding = String::from_utf8_lossy(&body[..3]).into_owned();
            Token::VerbatimString {
                encoding,
                content: body[4..].to_vec(),
            }
        }
    };
    Ok(DecodeOutcome::Done {
        token,
        consumed: prefix_len + needed,
    })
}

enum AggKind {
    Array,
    Set,
    Push,
    Map,
}

fn decode_aggregate(buf: &[u8], prefix_len: usize, kind: AggKind) -> Result<DecodeOutcome, ParseError> {
    let header_end = match find_crlf(buf) {
        None => return Ok(DecodeOutcome::Incomplete),
        Some(idx) => idx,
    };
    let header =
        std::str::from_utf8(&buf[..header_end]).map_err(|_| ParseError::MalformedLine)?;
    let count = parse_len(header)?;
    let mut consumed = prefix_len + header_end + 2;

    if count == -1 {
        return Ok(DecodeOutcome::Done {
            token: Token::Null,
            consumed,
        });
    }
    let count = count as usize;
    let element_count = match kind {
        AggKind::Map => count * 2,
        _ => count,
    };

    let mut items = Vec::with_capacity(element_count);
    let mut cursor = &buf[header_end + 2..];
    for _ in 0..element_count {
        match decode_one(cursor)? {
            DecodeOutcome::Incomplete => return Ok(DecodeOutcome::Incomplete),
            DecodeOutcome::Done { token, consumed: c } => {
                items.push(token);
                consumed += c;
                cursor = &cursor[c..];
            }
        }
    }

    let token = match kind {
        AggKind::Array => Token::Array(items),
        AggKind::Set => Token::Set(items),
        AggKind::Push => Token::Push(items),
        AggKind::Map => Token::Map(
            items
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect(),
        ),
    };
    Ok(DecodeOutcome::Done { token, consumed })
}

fn decode_attribute(buf: &[u8], prefix_len: usize) -> Result<DecodeOutcome, ParseError> {
    // Attributes share the map header shape (`|<len>\r\n` followed by
    // `len` key/value pairs) but must be paired with the token that
    // follows them.
    match decode_aggregate(buf, prefix_len, AggKind::Map)? {
        DecodeOutcome::Incomplete => Ok(DecodeOutcome::Incomplete),
        DecodeOutcome::Done {
            token: Token::Map(pairs),
            consumed: attr_consumed,
        } => {
            let remaining = &buf[attr_consumed - prefix_len..];
            match decode_one(remaining)? {
                DecodeOutcome::Incomplete => Ok(DecodeOutcome::Incomplete),
                DecodeOutcome::Done {
                    token: value,
                    consumed: value_consumed,
                } => Ok(DecodeOutcome::Done {
                    token: Token::Attribute {
                        attributes: pairs,
                        value: Box::new(value),
                    },
                    consumed: attr_consumed + value_consumed,
                }),
            }
        }
        DecodeOutcome::Done { .. } => unreachable!("map decode always returns Token::Map"),
    }
}

/// Growable accumulation buffer feeding `decode_one`, used by the node
/// connection driver so partial socket reads never lose state.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode the next token. On success the consumed bytes
    /// are drained from the internal buffer.
    pub fn try_decode(&mut self) -> Result<Option<Token>, ParseError> {
        match decode_one(&self.buf)? {
            DecodeOutcome::Incomplete => Ok(None),
            DecodeOutcome::Done { token, consumed } => {
                self.buf.drain(..consumed);
                Ok(Some(token))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test01_simple_string() {
        let mut d = Decoder::new();
        d.feed(b"+OK\r\n");
        assert_eq!(d.try_decode().unwrap(), Some(Token::SimpleString("OK".into())));
    }

    #[test]
    fn test02_incomplete_then_complete() {
        let mut d = Decoder::new();
        d.feed(b"$3\r\nba");
        assert_eq!(d.try_decode().unwrap(), None);
        d.feed(b"r\r\n");
        assert_eq!(d.try_decode().unwrap(), Some(Token::BlobString(b"bar".to_vec())));
    }

    #[test]
    fn test03_resp2_null_bulk() {
        let mut d = Decoder::new();
        d.feed(b"$-1\r\n");
        assert_eq!(d.try_decode().unwrap(), Some(Token::Null));
    }

    #[test]
    fn test04_resp2_null_array() {
        let mut d = Decoder::new();
        d.feed(b"*-1\r\n");
        assert_eq!(d.try_decode().unwrap(), Some(Token::Null));
    }

    #[test]
    fn test05_array_of_integers() {
        let mut d = Decoder::new();
        d.feed(b"*3\r\n:1\r\n:2\r\n:3\r\n");
        assert_eq!(
            d.try_decode().unwrap(),
            Some(Token::Array(vec![
                Token::Number(1),
                Token::Number(2),
                Token::Number(3)
            ]))
        );
    }

    #[test]
    fn test06_map_reply() {
        let mut d = Decoder::new();
        d.feed(b"%1\r\n+k\r\n+v\r\n");
        assert_eq!(
            d.try_decode().unwrap(),
            Some(Token::Map(vec![(
                Token::SimpleString("k".into()),
                Token::SimpleString("v".into())
            )]))
        );
    }

    #[test]
    fn test07_boolean() {
        let mut d = Decoder::new();
        d.feed(b"#t\r\n#f\r\n");
        assert_eq!(d.try_decode().unwrap(), Some(Token::Boolean(true)));
        assert_eq!(d.try_decode().unwrap(), Some(Token::Boolean(false)));
    }

    #[test]
    fn test08_invalid_boolean() {
        assert!(matches!(
            decode_one(b"#x\r\n"),
            Err(ParseError::InvalidBoolean(b'x'))
        ));
    }

    #[test]
    fn test09_bad_length() {
        assert!(matches!(decode_one(b"$abc\r\n"), Err(ParseError::BadLength(_))));
    }

    #[test]
    fn test10_negative_length_other_than_minus_one() {
        assert!(matches!(
            decode_one(b"$-5\r\nxxxxx\r\n"),
            Err(ParseError::NegativeLength(-5))
        ));
    }

    #[test]
    fn test11_attribute_pairs_with_following_token() {
        let mut d = Decoder::new();
        d.feed(b"|1\r\n+key\r\n+val\r\n+OK\r\n");
        let token = d.try_decode().unwrap().unwrap();
        match token {
            Token::Attribute { attributes, value } => {
                assert_eq!(attributes.len(), 1);
                assert_eq!(*value, Token::SimpleString("OK".into()));
            }
            _ => panic!("expected attribute token"),
        }
    }

    #[test]
    fn test12_verbatim_string() {
        let mut d = Decoder::new();
        d.feed(b"=9\r\ntxt:hello\r\n");
        assert_eq!(
            d.try_decode().unwrap(),
            Some(Token::VerbatimString {
                encoding: "txt".into(),
                content: b"hello".to_vec()
            })
        );
    }

    #[test]
    fn test13_set_reply() {
        let mut d = Decoder::new();
        d.feed(b"~2\r\n+a\r\n+b\r\n");
        assert_eq!(
            d.try_decode().unwrap(),
            Some(Token::Set(vec![
                Token::SimpleString("a".into()),
                Token::SimpleString("b".into())
            ]))
        );
    }

    #[test]
    fn test14_push_reply() {
        let mut d = Decoder::new();
        d.feed(b">1\r\n+msg\r\n");
        assert_eq!(
            d.try_decode().unwrap(),
            Some(Token::Push(vec![Token::SimpleString("msg".into())]))
        );
    }

    #[test]
    fn test15_truncated_nested_array_is_incomplete_not_error() {
        let mut d = Decoder::new();
        d.feed(b"*2\r\n:1\r\n");
        assert_eq!(d.try_decode().unwrap(), None);
    }

    #[test]
    fn test16_unknown_type() {
        assert!(matches!(decode_one(b"@foo\r\n"), Err(ParseError::UnknownType(b'@'))));
    }
}
