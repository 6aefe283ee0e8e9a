//! Open Sound Control message encoding
//!
//! Only plain OSC 1.0 messages are produced; bundles and time tags are not
//! used. Wire layout:
//!
//! - Address pattern: ASCII, NUL-terminated, padded to a multiple of 4 bytes
//! - Type tag string: `,` followed by one tag per argument, padded the same way
//! - Arguments: `i` int32 and `f` float32 big-endian, `s` padded string

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::{self, Deserializer, Unexpected, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, Result};

/// A typed OSC argument
///
/// Deserializes from plain JSON values: integers become `Int`, other numbers
/// `Float`, strings `Str`. Integers outside the `i32` range are rejected
/// rather than silently sent as floats.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OscArg {
    /// `i`: 32-bit integer
    Int(i32),
    /// `f`: 32-bit float
    Float(f32),
    /// `s`: string
    Str(String),
}

impl OscArg {
    /// OSC type tag character
    pub fn type_tag(&self) -> char {
        match self {
            OscArg::Int(_) => 'i',
            OscArg::Float(_) => 'f',
            OscArg::Str(_) => 's',
        }
    }
}

impl<'de> Deserialize<'de> for OscArg {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(OscArgVisitor)
    }
}

struct OscArgVisitor;

impl<'de> Visitor<'de> for OscArgVisitor {
    type Value = OscArg;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a 32-bit integer, a number or a string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<OscArg, E> {
        i32::try_from(v)
            .map(OscArg::Int)
            .map_err(|_| E::invalid_value(Unexpected::Signed(v), &"an integer in the i32 range"))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<OscArg, E> {
        i32::try_from(v)
            .map(OscArg::Int)
            .map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &"an integer in the i32 range"))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<OscArg, E> {
        Ok(OscArg::Float(v as f32))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<OscArg, E> {
        Ok(OscArg::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<OscArg, E> {
        Ok(OscArg::Str(v))
    }
}

impl fmt::Display for OscArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OscArg::Int(v) => write!(f, "{}", v),
            OscArg::Float(v) => write!(f, "{}", v),
            OscArg::Str(v) => write!(f, "\"{}\"", v),
        }
    }
}

/// A decoded OSC message
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    /// Address pattern
    pub address: String,
    /// Arguments in order
    pub args: Vec<OscArg>,
}

/// Check that an address can be put on the wire
pub fn validate_address(address: &str) -> Result<()> {
    if !address.starts_with('/') || address.contains('\0') || !address.is_ascii() {
        return Err(BridgeError::InvalidOscAddress(address.to_string()));
    }
    Ok(())
}

fn padded_len(len: usize) -> usize {
    // NUL terminator plus padding to the next multiple of four
    (len + 4) & !3
}

fn put_padded_str(buf: &mut BytesMut, s: &str) {
    let total = padded_len(s.len());
    buf.put_slice(s.as_bytes());
    buf.put_bytes(0, total - s.len());
}

/// Encode a message into a single datagram payload
pub fn encode_message(address: &str, args: &[OscArg]) -> Result<Bytes> {
    validate_address(address)?;
    for arg in args {
        if let OscArg::Str(s) = arg {
            if s.contains('\0') {
                return Err(BridgeError::MalformedOsc(
                    "string argument contains NUL".to_string(),
                ));
            }
        }
    }

    let tags: String = std::iter::once(',')
        .chain(args.iter().map(OscArg::type_tag))
        .collect();

    let mut buf = BytesMut::with_capacity(padded_len(address.len()) + padded_len(tags.len()) + 8 * args.len());
    put_padded_str(&mut buf, address);
    put_padded_str(&mut buf, &tags);

    for arg in args {
        match arg {
            OscArg::Int(v) => buf.put_i32(*v),
            OscArg::Float(v) => buf.put_f32(*v),
            OscArg::Str(s) => put_padded_str(&mut buf, s),
        }
    }

    Ok(buf.freeze())
}

fn take_padded_str(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| BridgeError::MalformedOsc("unterminated string".to_string()))?;
    let total = padded_len(end);
    if buf.len() < total {
        return Err(BridgeError::MalformedOsc("truncated string padding".to_string()));
    }
    let raw = buf.split_to(total);
    String::from_utf8(raw[..end].to_vec())
        .map_err(|e| BridgeError::MalformedOsc(format!("invalid UTF-8: {}", e)))
}

/// Decode a datagram produced by [`encode_message`]
pub fn decode_message(datagram: &[u8]) -> Result<OscMessage> {
    let mut buf = Bytes::copy_from_slice(datagram);

    let address = take_padded_str(&mut buf)?;
    validate_address(&address)?;

    let tags = take_padded_str(&mut buf)?;
    let tags = tags
        .strip_prefix(',')
        .ok_or_else(|| BridgeError::MalformedOsc("missing type tag string".to_string()))?;

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'i' | 'f' if buf.remaining() < 4 => {
                return Err(BridgeError::MalformedOsc("truncated argument".to_string()))
            }
            'i' => OscArg::Int(buf.get_i32()),
            'f' => OscArg::Float(buf.get_f32()),
            's' => OscArg::Str(take_padded_str(&mut buf)?),
            other => {
                return Err(BridgeError::MalformedOsc(format!(
                    "unsupported type tag '{}'",
                    other
                )))
            }
        };
        args.push(arg);
    }

    Ok(OscMessage { address, args })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_integer_rejected() {
        assert!(serde_json::from_str::<Vec<OscArg>>("[3000000000]").is_err());
        assert!(serde_json::from_str::<Vec<OscArg>>("[-3000000000]").is_err());
        assert!(serde_json::from_str::<Vec<OscArg>>("[true]").is_err());
    }

    #[test]
    fn test_encode_without_args() {
        let bytes = encode_message("/go", &[]).unwrap();
        assert_eq!(bytes.as_ref(), b"/go\0,\0\0\0");
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode_message(
            "/cue/fire",
            &[OscArg::Int(1), OscArg::Float(0.5), OscArg::Str("red".to_string())],
        )
        .unwrap();

        // "/cue/fire" is 9 bytes -> 12 with terminator and padding
        assert_eq!(&bytes[..12], b"/cue/fire\0\0\0");
        assert_eq!(&bytes[12..20], b",ifs\0\0\0\0");
        assert_eq!(&bytes[20..24], &1i32.to_be_bytes());
        assert_eq!(&bytes[24..28], &0.5f32.to_be_bytes());
        assert_eq!(&bytes[28..32], b"red\0");
        assert_eq!(bytes.len() % 4, 0);
    }

    #[test]
    fn test_address_length_multiple_of_four_gets_full_pad() {
        let bytes = encode_message("/abc", &[]).unwrap();
        assert_eq!(&bytes[..8], b"/abc\0\0\0\0");
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert!(matches!(
            encode_message("cue/fire", &[]),
            Err(BridgeError::InvalidOscAddress(_))
        ));
        assert!(matches!(
            encode_message("/bad\0addr", &[]),
            Err(BridgeError::InvalidOscAddress(_))
        ));
    }

    #[test]
    fn test_decode_encoded_message() {
        let args = vec![OscArg::Str("buzzer 3".to_string()), OscArg::Int(-7)];
        let bytes = encode_message("/team/score", &args).unwrap();
        let message = decode_message(&bytes).unwrap();

        assert_eq!(message.address, "/team/score");
        assert_eq!(message.args, args);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = encode_message("/x", &[OscArg::Int(5)]).unwrap();
        assert!(decode_message(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_args_from_json() {
        let args: Vec<OscArg> = serde_json::from_str(r#"[1, 2.5, "go"]"#).unwrap();
        assert_eq!(
            args,
            vec![OscArg::Int(1), OscArg::Float(2.5), OscArg::Str("go".to_string())]
        );
    }
}
