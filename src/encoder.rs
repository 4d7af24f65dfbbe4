//! Outbound wire encoding
//!
//! This module builds the OSC-style binary messages sent to visual engines and
//! the plain-text payloads written to the haptic actuator.
//!
//! Message layout:
//! 1. address string, UTF-8, NUL-padded with `(4 - len % 4) % 4` bytes
//! 2. type tag string (`,` then one `i` per argument), padded the same way
//! 3. each argument as a big-endian `i32`
//!
//! The padding rule adds nothing to strings that are already aligned, which
//! is what the receiving patches expect.

use crate::error::SyncError;
use crate::types::SessionId;
use serde::{Deserialize, Serialize};

/// Shared address for group broadcast bundles
pub const GROUP_BPM_ADDRESS: &str = "/wek/bpm";

const TYPE_TAG_PREFIX: u8 = b',';
const TYPE_TAG_INT: u8 = b'i';

/// Per-player address carrying that player's bpm
pub fn player_bpm_address(id: SessionId) -> String {
    format!("/player/{id}/bpm")
}

/// Number of NUL bytes appended after a string of `len` bytes
pub fn padding_for(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// An address plus integer arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<i32>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>, args: Vec<i32>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// Single-value message for one player
    pub fn player_bpm(id: SessionId, bpm: u16) -> Self {
        Self::new(player_bpm_address(id), vec![i32::from(bpm)])
    }

    /// Bundle carrying every given reading under the group address
    pub fn group_bpms(bpms: &[u16]) -> Self {
        Self::new(
            GROUP_BPM_ADDRESS,
            bpms.iter().copied().map(i32::from).collect(),
        )
    }

    /// Type tag string for the arguments, e.g. `,iii`
    pub fn type_tag(&self) -> String {
        let mut tag = String::with_capacity(self.args.len() + 1);
        tag.push(char::from(TYPE_TAG_PREFIX));
        tag.extend(std::iter::repeat(char::from(TYPE_TAG_INT)).take(self.args.len()));
        tag
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let type_tag = self.type_tag();
        let mut data = Vec::with_capacity(
            self.address.len() + 3 + type_tag.len() + 3 + self.args.len() * 4,
        );

        push_padded(&mut data, self.address.as_bytes());
        push_padded(&mut data, type_tag.as_bytes());
        for arg in &self.args {
            data.extend_from_slice(&arg.to_be_bytes());
        }

        data
    }

    /// Parse wire bytes produced by [`OscMessage::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.first() != Some(&b'/') {
            return Err(SyncError::MalformedPacket(
                "address must start with '/'".to_string(),
            ));
        }

        // Without padding the address may run straight into the type tag, so
        // every aligned ',' before the first NUL is a possible end
        let nul = bytes.iter().position(|&b| b == 0);
        let mut candidates = bytes
            .iter()
            .enumerate()
            .take(nul.unwrap_or(bytes.len()))
            .filter(|&(i, &b)| b == TYPE_TAG_PREFIX && i % 4 == 0)
            .map(|(i, _)| i)
            .chain(nul);

        let mut last_error = SyncError::MalformedPacket("missing type tag".to_string());
        let (address_len, args) = loop {
            let Some(address_len) = candidates.next() else {
                return Err(last_error);
            };
            match decode_arguments(bytes, address_len) {
                Ok(args) => break (address_len, args),
                Err(e) => last_error = e,
            }
        };
        let address = std::str::from_utf8(&bytes[..address_len])
            .map_err(|e| SyncError::MalformedPacket(format!("address is not UTF-8: {e}")))?
            .to_string();

        Ok(Self { address, args })
    }
}

/// Parse the type tag and arguments following an address of `address_len` bytes
fn decode_arguments(bytes: &[u8], address_len: usize) -> Result<Vec<i32>, SyncError> {
    let tag_start = skip_padding(bytes, address_len, address_len)?;
    if bytes.get(tag_start) != Some(&TYPE_TAG_PREFIX) {
        return Err(SyncError::MalformedPacket(
            "type tag must start with ','".to_string(),
        ));
    }
    let arg_count = bytes[tag_start + 1..]
        .iter()
        .take_while(|&&b| b == TYPE_TAG_INT)
        .count();
    let tag_len = arg_count + 1;
    let offset = skip_padding(bytes, tag_start + tag_len, tag_len)?;

    let arg_bytes = &bytes[offset..];
    if arg_bytes.len() != arg_count * 4 {
        return Err(SyncError::MalformedPacket(format!(
            "expected {} argument bytes, got {}",
            arg_count * 4,
            arg_bytes.len()
        )));
    }
    Ok(arg_bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn push_padded(data: &mut Vec<u8>, bytes: &[u8]) {
    data.extend_from_slice(bytes);
    data.resize(data.len() + padding_for(bytes.len()), 0);
}

fn skip_padding(bytes: &[u8], offset: usize, len: usize) -> Result<usize, SyncError> {
    let end = offset + padding_for(len);
    match bytes.get(offset..end) {
        Some(pad) if pad.iter().all(|&b| b == 0) => Ok(end),
        _ => Err(SyncError::MalformedPacket(format!(
            "bad padding at offset {offset}"
        ))),
    }
}

/// Encode a single player's bpm message
pub fn encode_player_bpm(id: SessionId, bpm: u16) -> Vec<u8> {
    OscMessage::player_bpm(id, bpm).encode()
}

/// Encode the group bundle for the given readings
pub fn encode_group_bpms(bpms: &[u16]) -> Vec<u8> {
    OscMessage::group_bpms(bpms).encode()
}

/// Actuator payload for one reading, e.g. `72`
pub fn encode_text_bpm(bpm: u16) -> Vec<u8> {
    bpm.to_string().into_bytes()
}

/// Actuator payload for the group, e.g. `72,68,75`
pub fn encode_text_group(bpms: &[u16]) -> Vec<u8> {
    bpms.iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_player_message_layout() {
        let bytes = encode_player_bpm(1, 72);

        // "/player/1/bpm" is 13 bytes -> 3 bytes of padding
        assert_eq!(&bytes[..13], b"/player/1/bpm");
        assert_eq!(&bytes[13..16], &[0, 0, 0]);
        // ",i" -> 2 bytes of padding
        assert_eq!(&bytes[16..20], b",i\0\0");
        assert_eq!(&bytes[20..], &72i32.to_be_bytes());
        assert_eq!(bytes.len(), 24);
        assert_eq!(bytes.len() % 4, 0);
    }

    #[test]
    fn test_player_message_round_trip() {
        let decoded = OscMessage::decode(&encode_player_bpm(1, 72)).unwrap();
        assert_eq!(decoded.address, "/player/1/bpm");
        assert_eq!(decoded.type_tag(), ",i");
        assert_eq!(decoded.args, vec![72]);
    }

    #[test]
    fn test_aligned_strings_get_no_padding() {
        // "/wek/bpm" (8 bytes) and ",iii" (4 bytes) are already aligned
        let bytes = encode_group_bpms(&[72, 68, 75]);
        assert_eq!(&bytes[..12], b"/wek/bpm,iii");
        assert_eq!(bytes.len(), 12 + 12);
        assert_eq!(&bytes[20..24], &75i32.to_be_bytes());

        let decoded = OscMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, OscMessage::group_bpms(&[72, 68, 75]));
    }

    #[test]
    fn test_group_with_two_readings() {
        let bytes = encode_group_bpms(&[60, 61]);
        // ",ii" is 3 bytes -> one NUL
        assert_eq!(&bytes[8..12], b",ii\0");
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(OscMessage::decode(&bytes).unwrap().args, vec![60, 61]);
    }

    #[test]
    fn test_decode_address_with_aligned_comma() {
        for message in [
            OscMessage::new("/abc,def", vec![7]),
            OscMessage::new("/abc,iii", vec![]),
            OscMessage::new("/abc,de", vec![1, 2]),
        ] {
            assert_eq!(OscMessage::decode(&message.encode()).unwrap(), message);
        }
    }

    #[test]
    fn test_wide_values_are_widened_not_truncated() {
        let bytes = encode_player_bpm(2, u16::MAX);
        let decoded = OscMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.args, vec![65535]);
    }

    #[test]
    fn test_decode_rejects_truncated_arguments() {
        let bytes = encode_player_bpm(1, 72);
        assert!(matches!(
            OscMessage::decode(&bytes[..22]),
            Err(SyncError::MalformedPacket(_))
        ));
        assert!(matches!(
            OscMessage::decode(b"no-slash"),
            Err(SyncError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_text_payloads() {
        assert_eq!(encode_text_bpm(72), b"72".to_vec());
        assert_eq!(encode_text_group(&[72, 68, 75]), b"72,68,75".to_vec());
        assert!(encode_text_group(&[]).is_empty());
    }
}
