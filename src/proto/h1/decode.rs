//! Request body framing: Content-Length and chunked transfer decoding.

use bytes::{Buf, Bytes, BytesMut};
use http::Version;
use tracing::{debug, trace};

use super::parse::ParsedHead;
use crate::error::{Error, Parse, Result};
use crate::headers;

use self::ChunkedState::*;

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body (no framing headers present).
    None,
    Length(u64),
    Chunked,
}

/// Decides the body framing for a parsed head (RFC 7230 §3.3.3).
pub(crate) fn body_framing(head: &ParsedHead) -> Result<BodyFraming> {
    let transfer_encoding = head.headers.get("transfer-encoding");
    let content_length = headers::content_length_parse(&head.headers);

    if let Some(te) = transfer_encoding {
        if content_length.is_some() {
            debug!("request with both Transfer-Encoding and Content-Length");
            return Err(Error::new_parse(Parse::Header));
        }
        if head.version == Version::HTTP_10 {
            debug!("HTTP/1.0 request with Transfer-Encoding");
            return Err(Error::new_parse(Parse::Header));
        }
        if !headers::transfer_encoding_is_chunked(te) {
            return Err(Error::new_parse(Parse::UnsupportedTransferEncoding));
        }
        return Ok(BodyFraming::Chunked);
    }

    match content_length {
        Some(Ok(0)) => Ok(BodyFraming::None),
        Some(Ok(len)) => Ok(BodyFraming::Length(len)),
        Some(Err(())) => {
            debug!("illegal Content-Length");
            Err(Error::new_parse(Parse::Header))
        }
        None => Ok(BodyFraming::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    End,
}

/// Incremental chunked-body decoder.
///
/// Feed it receive-buffer bytes as they arrive; it consumes what it can and
/// returns the assembled body once the terminating chunk and trailer section
/// have been seen. Chunk extensions are skipped; decoded size is capped.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkedState,
    chunk_len: u64,
    decoded: BytesMut,
    max_body_bytes: usize,
}

impl ChunkedDecoder {
    pub(crate) fn new(max_body_bytes: usize) -> ChunkedDecoder {
        ChunkedDecoder {
            state: Size,
            chunk_len: 0,
            decoded: BytesMut::new(),
            max_body_bytes,
        }
    }

    /// Consumes bytes from `buf`. Returns the full decoded body when the
    /// `0\r\n` terminator (and any trailer section) has been consumed, or
    /// `None` if more input is needed.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        while self.state != End {
            if buf.is_empty() {
                return Ok(None);
            }
            self.step(buf)?;
            if self.decoded.len() > self.max_body_bytes {
                return Err(Error::new_parse(Parse::BodyTooLarge));
            }
        }
        trace!(decoded = self.decoded.len(), "chunked body complete");
        Ok(Some(std::mem::take(&mut self.decoded).freeze()))
    }

    fn step(&mut self, buf: &mut BytesMut) -> Result<()> {
        macro_rules! byte {
            () => {{
                buf.get_u8()
            }};
        }
        self.state = match self.state {
            Size => {
                let b = byte!();
                match b {
                    b'0'..=b'9' => {
                        self.chunk_len = self.checked_size(b - b'0')?;
                        Size
                    }
                    b'a'..=b'f' => {
                        self.chunk_len = self.checked_size(b + 10 - b'a')?;
                        Size
                    }
                    b'A'..=b'F' => {
                        self.chunk_len = self.checked_size(b + 10 - b'A')?;
                        Size
                    }
                    b'\t' | b' ' => SizeLws,
                    b';' => Extension,
                    b'\r' => SizeLf,
                    _ => return Err(Error::new_parse(Parse::Chunked)),
                }
            }
            SizeLws => match byte!() {
                b'\t' | b' ' => SizeLws,
                b';' => Extension,
                b'\r' => SizeLf,
                _ => return Err(Error::new_parse(Parse::Chunked)),
            },
            Extension => match byte!() {
                // Extensions are skipped entirely.
                b'\r' => SizeLf,
                b'\n' => return Err(Error::new_parse(Parse::Chunked)),
                _ => Extension,
            },
            SizeLf => match byte!() {
                b'\n' => {
                    if self.chunk_len == 0 {
                        Trailer
                    } else {
                        Body
                    }
                }
                _ => return Err(Error::new_parse(Parse::Chunked)),
            },
            Body => {
                let take = std::cmp::min(self.chunk_len, buf.len() as u64) as usize;
                self.decoded.extend_from_slice(&buf[..take]);
                buf.advance(take);
                self.chunk_len -= take as u64;
                if self.chunk_len == 0 {
                    BodyCr
                } else {
                    Body
                }
            }
            BodyCr => match byte!() {
                b'\r' => BodyLf,
                _ => return Err(Error::new_parse(Parse::Chunked)),
            },
            BodyLf => match byte!() {
                b'\n' => Size,
                _ => return Err(Error::new_parse(Parse::Chunked)),
            },
            // Trailer fields are consumed and discarded.
            Trailer => match byte!() {
                b'\r' => EndCr,
                _ => TrailerLf,
            },
            TrailerLf => match byte!() {
                b'\n' => Trailer,
                _ => TrailerLf,
            },
            EndCr => match byte!() {
                b'\n' => End,
                _ => return Err(Error::new_parse(Parse::Chunked)),
            },
            End => End,
        };
        Ok(())
    }

    fn checked_size(&self, digit: u8) -> Result<u64> {
        self.chunk_len
            .checked_mul(16)
            .and_then(|len| len.checked_add(u64::from(digit)))
            .ok_or_else(|| Error::new_parse(Parse::Chunked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::parse::parse_head;

    fn framing_of(raw: &[u8]) -> Result<BodyFraming> {
        let mut buf = BytesMut::from(raw);
        let head = parse_head(&mut buf, 8192, true).unwrap().unwrap();
        body_framing(&head)
    }

    #[test]
    fn framing_selection() {
        assert_eq!(
            framing_of(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap(),
            BodyFraming::Length(5)
        );
        assert_eq!(
            framing_of(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap(),
            BodyFraming::Chunked
        );
        assert_eq!(
            framing_of(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap(),
            BodyFraming::None
        );
    }

    #[test]
    fn length_and_te_conflict() {
        let err = framing_of(
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn chunked_on_http10_rejected() {
        assert!(framing_of(b"POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n").is_err());
    }

    #[test]
    fn non_chunked_te_unsupported() {
        let err =
            framing_of(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n").unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::Kind::Parse(Parse::UnsupportedTransferEncoding)
        ));
    }

    #[test]
    fn decode_wikipedia() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut buf = BytesMut::from(&b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"[..]);
        let body = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&body[..], b"Wikipedia");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_across_splits() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        for split in 1..raw.len() {
            let mut decoder = ChunkedDecoder::new(1024);
            let mut first = BytesMut::from(&raw[..split]);
            let mut rest = BytesMut::from(&raw[split..]);
            let early = decoder.decode(&mut first).unwrap();
            let body = match early {
                Some(body) => body,
                None => {
                    let mut remainder = first;
                    remainder.unsplit(rest);
                    rest = remainder;
                    decoder.decode(&mut rest).unwrap().unwrap()
                }
            };
            assert_eq!(&body[..], b"Wikipedia", "split at {}", split);
        }
    }

    #[test]
    fn extensions_are_skipped() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut buf = BytesMut::from(&b"4;name=value\r\nWiki\r\n0\r\n\r\n"[..]);
        let body = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&body[..], b"Wiki");
    }

    #[test]
    fn trailers_are_discarded() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut buf =
            BytesMut::from(&b"4\r\nWiki\r\n0\r\nX-Checksum: abc\r\n\r\n"[..]);
        let body = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&body[..], b"Wiki");
    }

    #[test]
    fn oversize_body_rejected_at_boundary() {
        let mut decoder = ChunkedDecoder::new(4);
        let mut buf = BytesMut::from(&b"5\r\nabcde\r\n0\r\n\r\n"[..]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::Kind::Parse(Parse::BodyTooLarge)
        ));

        let mut decoder = ChunkedDecoder::new(4);
        let mut buf = BytesMut::from(&b"4\r\nabcd\r\n0\r\n\r\n"[..]);
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], b"abcd");
    }

    #[test]
    fn bad_size_digit_rejected() {
        let mut decoder = ChunkedDecoder::new(1024);
        let mut buf = BytesMut::from(&b"zz\r\n\r\n"[..]);
        assert!(decoder.decode(&mut buf).is_err());
    }
}
