//! Packet decoding for raw sensor notifications.
//!
//! Firmware variants send the same 6-axis reading in three encodings:
//!
//! - **Binary**: `<u32 seq><i16 ax><i16 ay><i16 az><i16 gx><i16 gy><i16 gz>`,
//!   little-endian, 16 bytes.
//! - **JSON**: an object with `ax`..`gz` keys, optionally prefixed with the
//!   channel name (`hip_ax`, `cadera_ax`, ...).
//! - **CSV**: at least six numeric tokens; a configurable offset selects which
//!   six are used.
//!
//! In [`Encoding::Auto`] the length decides first: every 16-byte payload is
//! read as binary, even one that happens to be valid text such as
//! `1,2,3,4,5,6,7,89`. Sensors that send text lines of that exact length
//! need the encoding pinned to `json` or `csv` in the decoder config.
//!
//! Decoding never panics. Callers count failures and drop the packet.

use crate::core::types::{Channel, SixAxisReading, AXES};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the binary packet layout in bytes.
pub const BINARY_PACKET_LEN: usize = 16;

const AXIS_KEYS: [&str; AXES] = ["ax", "ay", "az", "gx", "gy", "gz"];

/// Why a payload could not be turned into a reading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Too short for the binary layout and not parseable as text either.
    #[error("truncated payload ({len} bytes)")]
    Truncated { len: usize },
    /// JSON parsed but a required axis key is absent.
    #[error("missing field '{field}'")]
    FieldMissing { field: String },
    /// A numeric token or value could not be parsed.
    #[error("malformed value '{token}'")]
    Malformed { token: String },
}

/// Wire encoding of a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Binary if the payload is exactly 16 bytes, else JSON if it starts
    /// with `{`, else CSV. Text payloads of 16 bytes are read as binary.
    #[default]
    Auto,
    Binary,
    Json,
    Csv,
}

/// Decoder options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Pin the payload encoding instead of detecting it
    #[serde(default)]
    pub encoding: Encoding,
    /// Index of the first CSV token to use (e.g. 1 to skip a sequence column)
    #[serde(default)]
    pub csv_offset: usize,
}

/// A successfully decoded payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedPacket {
    /// Sequence counter (binary packets only)
    pub seq: Option<u32>,
    pub reading: SixAxisReading,
    pub encoding: Encoding,
}

/// Stateless decoder; cheap to clone into each channel task.
#[derive(Debug, Clone, Default)]
pub struct PacketDecoder {
    config: DecoderConfig,
}

impl PacketDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    /// Decode a payload into a reading.
    pub fn decode(&self, channel: Channel, raw: &[u8]) -> Result<SixAxisReading, DecodeError> {
        self.decode_packet(channel, raw).map(|packet| packet.reading)
    }

    /// Decode a payload, keeping the sequence counter and detected encoding.
    pub fn decode_packet(&self, channel: Channel, raw: &[u8]) -> Result<DecodedPacket, DecodeError> {
        match self.config.encoding {
            Encoding::Binary => decode_binary(raw),
            Encoding::Json => decode_json(channel, text(raw)?),
            Encoding::Csv => decode_csv(text(raw)?, self.config.csv_offset),
            Encoding::Auto => {
                if raw.len() == BINARY_PACKET_LEN {
                    return decode_binary(raw);
                }
                let s = text(raw)?;
                if s.starts_with('{') {
                    decode_json(channel, s)
                } else {
                    decode_csv(s, self.config.csv_offset)
                }
            }
        }
    }
}

/// Interpret the payload as trimmed UTF-8 text.
fn text(raw: &[u8]) -> Result<&str, DecodeError> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| DecodeError::Truncated { len: raw.len() })?
        .trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if s.is_empty() {
        return Err(DecodeError::Truncated { len: raw.len() });
    }
    Ok(s)
}

fn decode_binary(raw: &[u8]) -> Result<DecodedPacket, DecodeError> {
    if raw.len() < BINARY_PACKET_LEN {
        return Err(DecodeError::Truncated { len: raw.len() });
    }

    let seq = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let mut values = [0.0f32; AXES];
    for (i, value) in values.iter_mut().enumerate() {
        let at = 4 + i * 2;
        *value = i16::from_le_bytes([raw[at], raw[at + 1]]) as f32;
    }

    Ok(DecodedPacket {
        seq: Some(seq),
        reading: SixAxisReading::from_array(values),
        encoding: Encoding::Binary,
    })
}

fn decode_json(channel: Channel, s: &str) -> Result<DecodedPacket, DecodeError> {
    // Notifications cut off at the link MTU show up as unterminated JSON.
    let value: serde_json::Value =
        serde_json::from_str(s).map_err(|_| DecodeError::Truncated { len: s.len() })?;
    let object = value.as_object().ok_or_else(|| DecodeError::Malformed {
        token: value.to_string(),
    })?;

    let mut values = [0.0f32; AXES];
    for (slot, key) in values.iter_mut().zip(AXIS_KEYS) {
        let field = object
            .get(key)
            .or_else(|| {
                channel
                    .json_prefixes()
                    .iter()
                    .find_map(|prefix| object.get(&format!("{prefix}_{key}")))
            })
            .ok_or_else(|| DecodeError::FieldMissing {
                field: key.to_string(),
            })?;
        *slot = json_number(field)?;
    }

    Ok(DecodedPacket {
        seq: object.get("seq").and_then(|v| v.as_u64()).map(|v| v as u32),
        reading: SixAxisReading::from_array(values),
        encoding: Encoding::Json,
    })
}

fn json_number(value: &serde_json::Value) -> Result<f32, DecodeError> {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n.is_finite() => Ok(n as f32),
        _ => Err(DecodeError::Malformed {
            token: value.to_string(),
        }),
    }
}

fn decode_csv(s: &str, offset: usize) -> Result<DecodedPacket, DecodeError> {
    let tokens: Vec<&str> = s
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() < offset + AXES {
        return Err(DecodeError::Truncated { len: s.len() });
    }

    let mut values = [0.0f32; AXES];
    for (slot, token) in values.iter_mut().zip(&tokens[offset..offset + AXES]) {
        *slot = match token.parse::<f32>() {
            Ok(v) if v.is_finite() => v,
            _ => {
                return Err(DecodeError::Malformed {
                    token: token.to_string(),
                })
            }
        };
    }

    Ok(DecodedPacket {
        seq: None,
        reading: SixAxisReading::from_array(values),
        encoding: Encoding::Csv,
    })
}

/// Build a binary packet. Used by the scripted transport and tests.
pub fn encode_binary(seq: u32, counts: [i16; AXES]) -> [u8; BINARY_PACKET_LEN] {
    let mut packet = [0u8; BINARY_PACKET_LEN];
    packet[..4].copy_from_slice(&seq.to_le_bytes());
    for (i, count) in counts.iter().enumerate() {
        let at = 4 + i * 2;
        packet[at..at + 2].copy_from_slice(&count.to_le_bytes());
    }
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decoder() -> PacketDecoder {
        PacketDecoder::default()
    }

    #[test]
    fn test_binary_packet() {
        let packet = encode_binary(7, [100, -200, 16384, -1, 0, 32767]);
        let decoded = decoder().decode_packet(Channel::Hip, &packet).unwrap();
        assert_eq!(decoded.seq, Some(7));
        assert_eq!(decoded.encoding, Encoding::Binary);
        assert_eq!(
            decoded.reading.to_array(),
            [100.0, -200.0, 16384.0, -1.0, 0.0, 32767.0]
        );
    }

    #[test]
    fn test_json_packet() {
        let payload = br#"{"ax":0.12,"ay":-0.98,"az":0.05,"gx":1.5,"gy":-2.0,"gz":0.25}"#;
        let reading = decoder().decode(Channel::Hip, payload).unwrap();
        assert_eq!(reading.gx, 1.5);
        assert_eq!(reading.ay, -0.98);
    }

    #[test]
    fn test_json_prefixed_keys() {
        let payload = br#"{"cadera_ax":1,"cadera_ay":2,"cadera_az":3,"cadera_gx":4,"cadera_gy":5,"cadera_gz":6,
                          "pierna_ax":7,"pierna_ay":8,"pierna_az":9,"pierna_gx":10,"pierna_gy":11,"pierna_gz":12}"#;
        let hip = decoder().decode(Channel::Hip, payload).unwrap();
        let leg = decoder().decode(Channel::Leg, payload).unwrap();
        assert_eq!(hip.to_array(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(leg.to_array(), [7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_json_missing_key() {
        let payload = br#"{"ax":0.1,"ay":0.2,"az":0.3,"gx":1,"gy":2}"#;
        assert_eq!(
            decoder().decode(Channel::Leg, payload),
            Err(DecodeError::FieldMissing {
                field: "gz".to_string()
            })
        );
    }

    #[test]
    fn test_json_non_numeric_value() {
        let payload = br#"{"ax":"x","ay":0.2,"az":0.3,"gx":1,"gy":2,"gz":3}"#;
        assert!(matches!(
            decoder().decode(Channel::Hip, payload),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_cut_off_json_is_truncated() {
        let payload = br#"{"ax":0.12,"ay":-0.9"#;
        assert!(matches!(
            decoder().decode(Channel::Hip, payload),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_csv_packet() {
        let reading = decoder()
            .decode(Channel::Hip, b"0.1, 0.2, 0.98, 3, 4, 5, 99\n")
            .unwrap();
        assert_eq!(reading.to_array(), [0.1, 0.2, 0.98, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_csv_offset_skips_sequence_column() {
        let decoder = PacketDecoder::new(DecoderConfig {
            encoding: Encoding::Csv,
            csv_offset: 1,
        });
        let reading = decoder.decode(Channel::Leg, b"42,1,2,3,4,5,6").unwrap();
        assert_eq!(reading.to_array(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(matches!(
            decoder.decode(Channel::Leg, b"42,1,2,3,4,5"),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        let d = decoder();
        assert_eq!(
            d.decode(Channel::Hip, b""),
            Err(DecodeError::Truncated { len: 0 })
        );
        assert!(matches!(
            d.decode(Channel::Hip, &[0xff, 0xfe, 0x00]),
            Err(DecodeError::Truncated { len: 3 })
        ));
        assert!(matches!(
            d.decode(Channel::Hip, b"1,2,3"),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(
            d.decode(Channel::Hip, b"1,2,abc,4,5,6,7"),
            Err(DecodeError::Malformed {
                token: "abc".to_string()
            })
        );
        assert!(matches!(
            d.decode(Channel::Hip, b"1,2,nan,4,5,6,7"),
            Err(DecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_forced_binary_rejects_short_payload() {
        let decoder = PacketDecoder::new(DecoderConfig {
            encoding: Encoding::Binary,
            csv_offset: 0,
        });
        assert_eq!(
            decoder.decode(Channel::Hip, &[0u8; 12]),
            Err(DecodeError::Truncated { len: 12 })
        );
    }

    #[test]
    fn test_sixteen_byte_text_needs_pinned_encoding() {
        let payload = b"1,2,3,4,5,6,7,89";
        assert_eq!(payload.len(), BINARY_PACKET_LEN);

        let auto = decoder().decode_packet(Channel::Hip, payload).unwrap();
        assert_eq!(auto.encoding, Encoding::Binary);

        let csv = PacketDecoder::new(DecoderConfig {
            encoding: Encoding::Csv,
            csv_offset: 0,
        });
        let pinned = csv.decode_packet(Channel::Hip, payload).unwrap();
        assert_eq!(pinned.encoding, Encoding::Csv);
        assert_eq!(pinned.reading.to_array(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    proptest! {
        #[test]
        fn prop_binary_fields_survive_decoding(seq in any::<u32>(), counts in any::<[i16; 6]>()) {
            let packet = encode_binary(seq, counts);
            let decoded = decoder().decode_packet(Channel::Hip, &packet).unwrap();
            prop_assert_eq!(decoded.seq, Some(seq));
            let expected: Vec<f32> = counts.iter().map(|&c| c as f32).collect();
            prop_assert_eq!(decoded.reading.to_array().to_vec(), expected);
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decoder().decode(Channel::Leg, &bytes);
        }
    }
}
