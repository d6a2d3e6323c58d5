//! gRPC and gRPC-web message framing.
//!
//! ```text
//! ┌──────┬──────────────┬─────────────┐
//! │ flag │ length (u32) │ message ... │
//! └──────┴──────────────┴─────────────┘
//! ```
//!
//! Only unary, uncompressed calls are accepted. gRPC-web appends a trailer
//! frame (flag `0x80`) holding `grpc-status` / `grpc-message` as an HTTP/1
//! header block; `-text` variants base64 the whole body.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Length of the frame prefix.
pub const FRAME_HEADER_LEN: usize = 5;

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_TRAILER: u8 = 0x80;

/// gRPC status `OK`.
pub const STATUS_OK: u16 = 0;

/// Frame one message.
#[must_use]
pub fn encode_message(message: &[u8]) -> Bytes {
    encode_frame(0, message)
}

fn encode_frame(flag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(flag);
    // Bodies are capped by the request limit well below u32::MAX
    buf.put_u32(u32::try_from(payload.len()).unwrap_or(u32::MAX));
    buf.put_slice(payload);
    buf.freeze()
}

/// Extract the single message of a unary request body.
///
/// # Errors
///
/// `Error::Framing` for an empty, truncated, compressed, trailer-flagged or
/// multi-message body.
pub fn decode_unary(body: &[u8]) -> Result<Bytes> {
    if body.len() < FRAME_HEADER_LEN {
        return Err(Error::Framing(format!(
            "body of {} bytes is shorter than a frame header",
            body.len()
        )));
    }
    let flag = body[0];
    if flag & FLAG_TRAILER != 0 {
        return Err(Error::Framing("unexpected trailer frame in request".into()));
    }
    if flag & FLAG_COMPRESSED != 0 {
        return Err(Error::Framing("compressed messages are not supported".into()));
    }
    let declared = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    let rest = &body[FRAME_HEADER_LEN..];
    match rest.len().cmp(&declared) {
        std::cmp::Ordering::Less => Err(Error::Framing(format!(
            "truncated message: declared {declared} bytes, got {}",
            rest.len()
        ))),
        std::cmp::Ordering::Greater => {
            Err(Error::Framing("streaming requests are not supported".into()))
        }
        std::cmp::Ordering::Equal => Ok(Bytes::copy_from_slice(rest)),
    }
}

/// gRPC-web trailer frame.
#[must_use]
pub fn encode_web_trailers(status: u16, message: &str) -> Bytes {
    let mut block = format!("grpc-status:{status}\r\n");
    if !message.is_empty() {
        block.push_str("grpc-message:");
        block.push_str(&percent_encode(message));
        block.push_str("\r\n");
    }
    encode_frame(FLAG_TRAILER, block.as_bytes())
}

/// Decode a `grpc-web-text` body.
///
/// Clients may send several independently padded base64 chunks, so the
/// body is decoded one 4-character quantum at a time.
///
/// # Errors
///
/// `Error::Framing` if the body is not base64.
pub fn decode_text(body: &[u8]) -> Result<Vec<u8>> {
    let compact: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if compact.len() % 4 != 0 {
        return Err(Error::Framing("grpc-web-text body is not base64".into()));
    }
    let mut out = Vec::with_capacity(compact.len() / 4 * 3);
    for quantum in compact.chunks(4) {
        BASE64
            .decode_vec(quantum, &mut out)
            .map_err(|e| Error::Framing(format!("grpc-web-text body is not base64: {e}")))?;
    }
    Ok(out)
}

/// Encode a `grpc-web-text` body.
#[must_use]
pub fn encode_text(body: &[u8]) -> Bytes {
    Bytes::from(BASE64.encode(body))
}

/// Percent-encode a `grpc-message` value.
#[must_use]
pub fn percent_encode(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for byte in message.bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
