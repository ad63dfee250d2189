//! Raw (block) Snappy framing for remote write/read bodies, the format
//! Prometheus remote-storage clients send. Framed Snappy is not accepted.

use errors::ErrorMetadata;
use http::{
    header::{
        ACCEPT_ENCODING,
        CONTENT_ENCODING,
    },
    HeaderMap,
};

pub const SNAPPY: &str = "snappy";

/// Decompress the body when `Content-Encoding: snappy` is present.
/// Corrupt input fails the request with invalid-argument.
pub fn maybe_decompress(headers: &HeaderMap, body: &[u8]) -> anyhow::Result<Vec<u8>> {
    let encoded = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(SNAPPY));
    if !encoded {
        return Ok(body.to_vec());
    }
    snap::raw::Decoder::new().decompress_vec(body).map_err(|e| {
        ErrorMetadata::invalid_argument(
            "InvalidSnappyBody",
            format!("snappy decompression failed: {e}"),
        )
        .into()
    })
}

/// Compress the response when the client advertised
/// `Accept-Encoding: snappy`. Returns the body and whether it was
/// compressed.
pub fn maybe_compress(headers: &HeaderMap, body: Vec<u8>) -> anyhow::Result<(Vec<u8>, bool)> {
    let accepts = headers
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case(SNAPPY))
        });
    if !accepts {
        return Ok((body, false));
    }
    let compressed = snap::raw::Encoder::new().compress_vec(&body)?;
    Ok((compressed, true))
}
