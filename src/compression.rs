//! Request/response body compression for the registry HTTP surface.
//!
//! Requests may set `Content-Encoding: gzip|deflate|zstd` and are
//! decompressed transparently before reaching the registry logic.
//! Responses honor `Accept-Encoding` with preference order
//! zstd > gzip > deflate; when compression is applied, `Content-Length`
//! is removed and `Vary: Accept-Encoding` is added (the caller is
//! responsible for actually stripping `Content-Length` since that's a
//! header-table concern, not a bytes concern).

use std::io::{Read, Write};

use bytes::Bytes;

use crate::errors::{Error, Result};

/// One of the three encodings this registry understands, in both
/// directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// gzip (RFC 1952).
    Gzip,
    /// zlib/deflate (RFC 1950).
    Deflate,
    /// Zstandard.
    Zstd,
}

impl Encoding {
    /// The `Content-Encoding`/`Accept-Encoding` token for this encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Zstd => "zstd",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            "zstd" => Some(Encoding::Zstd),
            _ => None,
        }
    }
}

/// Decompress `body` per a (possibly absent) `Content-Encoding` header
/// value. An absent or unrecognized header means the body is passed
/// through unchanged (unrecognized encodings are not this registry's
/// problem to reject at the compression layer; callers choose whether to
/// treat that as `Unsupported`).
pub fn decode_request_body(content_encoding: Option<&str>, body: Bytes) -> Result<Bytes> {
    let Some(raw) = content_encoding else {
        return Ok(body);
    };
    let Some(encoding) = Encoding::from_token(raw) else {
        return Ok(body);
    };
    decode(encoding, &body)
}

fn decode(encoding: Encoding, body: &[u8]) -> Result<Bytes> {
    match encoding {
        Encoding::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::InvalidInput(format!("bad gzip body: {e}")))?;
            Ok(Bytes::from(out))
        }
        Encoding::Deflate => {
            let mut decoder = flate2::read::ZlibDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::InvalidInput(format!("bad deflate body: {e}")))?;
            Ok(Bytes::from(out))
        }
        Encoding::Zstd => {
            let out = zstd::decode_all(body).map_err(|e| Error::InvalidInput(format!("bad zstd body: {e}")))?;
            Ok(Bytes::from(out))
        }
    }
}

/// Parse an `Accept-Encoding` header value and pick the best encoding this
/// registry supports, preferring zstd, then gzip, then deflate. `q=0`
/// explicitly disables a token. Returns `None` when nothing acceptable is
/// offered (including when the header is absent).
pub fn negotiate_response_encoding(accept_encoding: Option<&str>) -> Option<Encoding> {
    let raw = accept_encoding?;
    let mut acceptable = std::collections::HashSet::new();
    for part in raw.split(',') {
        let mut pieces = part.split(';');
        let token = pieces.next()?.trim();
        let q_disabled = pieces
            .find_map(|p| p.trim().strip_prefix("q="))
            .and_then(|v| v.parse::<f32>().ok())
            .map(|q| q == 0.0)
            .unwrap_or(false);
        if q_disabled {
            continue;
        }
        if let Some(enc) = Encoding::from_token(token) {
            acceptable.insert(enc);
        }
    }
    for candidate in [Encoding::Zstd, Encoding::Gzip, Encoding::Deflate] {
        if acceptable.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Compress `body` with `encoding` for a response.
pub fn encode_response_body(encoding: Encoding, body: &[u8]) -> Result<Bytes> {
    match encoding {
        Encoding::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body)?;
            Ok(Bytes::from(encoder.finish()?))
        }
        Encoding::Deflate => {
            let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(body)?;
            Ok(Bytes::from(encoder.finish()?))
        }
        Encoding::Zstd => {
            let out = zstd::encode_all(body, 0).map_err(Error::Io)?;
            Ok(Bytes::from(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_prefers_zstd_over_gzip() {
        let enc = negotiate_response_encoding(Some("gzip, zstd, deflate")).unwrap();
        assert_eq!(enc, Encoding::Zstd);
    }

    #[test]
    fn negotiate_honors_q_zero() {
        let enc = negotiate_response_encoding(Some("zstd;q=0, gzip")).unwrap();
        assert_eq!(enc, Encoding::Gzip);
    }

    #[test]
    fn negotiate_absent_header_is_none() {
        assert!(negotiate_response_encoding(None).is_none());
    }

    #[test]
    fn gzip_round_trips() {
        let body = b"hello registry";
        let encoded = encode_response_body(Encoding::Gzip, body).unwrap();
        let decoded = decode(Encoding::Gzip, &encoded).unwrap();
        assert_eq!(&decoded[..], body);
    }

    #[test]
    fn zstd_round_trips() {
        let body = b"hello registry";
        let encoded = encode_response_body(Encoding::Zstd, body).unwrap();
        let decoded = decode(Encoding::Zstd, &encoded).unwrap();
        assert_eq!(&decoded[..], body);
    }
}
