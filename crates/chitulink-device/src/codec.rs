// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command codec: the device's command vocabulary, text encoding, chunk
// trailer layout and the small reply parsers shared by every component.
//
// Commands are either text (G/M-codes encoded with the charset the device
// announced during the handshake) or binary (file chunks). The variant is
// resolved to bytes exactly once, at the send boundary.

use std::borrow::Cow;

use encoding_rs::{EncoderResult, Encoding, UTF_8};
use tracing::trace;

/// Handshake / capability query.
pub const HANDSHAKE: &str = "M4001";
/// Firmware version query.
pub const FIRMWARE_VERSION: &str = "M4002";
/// Status query.
pub const STATUS: &str = "M4000";
/// Name of the file currently printing.
pub const ACTIVE_FILE: &str = "M4006";
/// Discovery broadcast probe.
pub const DISCOVERY_PROBE: &str = "M99999";
pub const PAUSE: &str = "M25";
pub const RESUME: &str = "M24";
pub const CANCEL: &str = "M33";

/// Payload bytes per chunk.
pub const CHUNK_SIZE: usize = 1280;
/// Bytes appended to every chunk: offset (4), checksum (1), sentinel (1).
pub const TRAILER_LEN: usize = 6;
/// Final trailer byte of every chunk.
pub const CHUNK_SENTINEL: u8 = 131;

/// Reply substrings meaning the device dropped this client.
const DISCONNECT_MARKERS: [&str; 2] = ["Wifi reboot", "IP is connected"];

/// A command ready to be sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Text(String),
    Binary(Vec<u8>),
}

impl Command {
    pub fn text(cmd: impl Into<String>) -> Self {
        Self::Text(cmd.into())
    }

    /// `M28 <file>`: create a file on the device storage.
    pub fn open_file(name: &str) -> Self {
        Self::Text(format!("M28 {name}"))
    }

    /// `M29 <file>`: close the file opened by `M28`.
    pub fn close_file(name: &str) -> Self {
        Self::Text(format!("M29 {name}"))
    }

    /// `M6030 ":<file>" I1`: start printing a stored file.
    pub fn start_print(name: &str) -> Self {
        Self::Text(format!("M6030 \":{name}\" I1"))
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Wire bytes for this command.
    pub fn to_bytes(&self, encoding: TextEncoding) -> Cow<'_, [u8]> {
        match self {
            Self::Text(text) => Cow::Owned(encoding.encode(text)),
            Self::Binary(bytes) => Cow::Borrowed(bytes),
        }
    }
}

impl From<&str> for Command {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Command {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

/// Character encoding negotiated with the device (`U:` handshake token).
///
/// Any WHATWG label is accepted, so GBK and the other CJK charsets used by
/// vendor firmware work alongside UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEncoding(&'static Encoding);

impl Default for TextEncoding {
    fn default() -> Self {
        Self::utf8()
    }
}

impl TextEncoding {
    pub fn utf8() -> Self {
        Self(UTF_8)
    }

    /// Resolve a charset label such as `'UTF-8'` or `GBK` (quotes are ignored).
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.replace('\'', "");
        Encoding::for_label(label.trim().as_bytes()).map(Self)
    }

    pub fn name(self) -> &'static str {
        self.0.name()
    }

    /// Encode, silently dropping characters the charset cannot represent.
    pub fn encode(self, text: &str) -> Vec<u8> {
        let encoding = self.0.output_encoding();
        if encoding == UTF_8 {
            return text.as_bytes().to_vec();
        }
        let mut encoder = encoding.new_encoder();
        let mut out = Vec::with_capacity(text.len() + 16);
        let mut input = text;
        loop {
            let (result, read) =
                encoder.encode_from_utf8_to_vec_without_replacement(input, &mut out, true);
            input = &input[read..];
            match result {
                EncoderResult::InputEmpty => break,
                EncoderResult::OutputFull => out.reserve(input.len() + 16),
                EncoderResult::Unmappable(c) => {
                    trace!(%c, encoding = encoding.name(), "dropped unmappable character");
                }
            }
        }
        out
    }

    /// Decode, silently dropping bytes that are invalid in the charset.
    pub fn decode(self, bytes: &[u8]) -> String {
        let (text, _) = self.0.decode_without_bom_handling(bytes);
        text.chars()
            .filter(|&c| c != char::REPLACEMENT_CHARACTER)
            .collect()
    }
}

/// Build one chunk datagram: payload, then the offset (most significant byte
/// first), the XOR of payload and offset bytes, and the sentinel.
pub fn encode_chunk(payload: &[u8], offset: u32) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(payload.len() + TRAILER_LEN);
    datagram.extend_from_slice(payload);
    datagram.extend_from_slice(&offset.to_be_bytes());
    let checksum = datagram.iter().fold(0u8, |acc, byte| acc ^ byte);
    datagram.push(checksum);
    datagram.push(CHUNK_SENTINEL);
    datagram
}

/// Whether a reply tells us the device has dropped this client.
pub fn has_disconnect_marker(reply: &str) -> bool {
    DISCONNECT_MARKERS.iter().any(|marker| reply.contains(marker))
}

/// Space-separated `KEY:VALUE` tokens; tokens without exactly one colon are
/// skipped.
pub fn key_values(reply: &str) -> impl Iterator<Item = (&str, &str)> {
    reply.trim_end().split(' ').filter_map(|token| {
        let mut parts = token.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => Some((key, value)),
            _ => None,
        }
    })
}

/// Offset named by a `resend <N>` reply.
pub fn parse_resend(reply: &str) -> Option<u64> {
    let start = reply.find("resend ")? + "resend ".len();
    let digits: &str = &reply[start..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

/// Text between the first pair of single quotes.
pub fn quoted_text(reply: &str) -> Option<&str> {
    let mut parts = reply.split('\'');
    parts.next()?;
    let inner = parts.next()?;
    parts.next().map(|_| inner)
}

/// Firmware version following the literal `ok ` token.
pub fn firmware_from_reply(reply: &str) -> Option<&str> {
    let reply = reply.trim_end();
    let start = reply.find("ok ")? + "ok ".len();
    let rest = &reply[start..];
    Some(rest.split("ok ").next().unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_trailer_layout() {
        let payload = [0x10u8, 0x20, 0x30];
        let datagram = encode_chunk(&payload, 0x0102_0304);

        assert_eq!(datagram.len(), payload.len() + TRAILER_LEN);
        assert_eq!(&datagram[..3], &payload);
        assert_eq!(&datagram[3..7], &[0x01, 0x02, 0x03, 0x04]);
        let expected = 0x10 ^ 0x20 ^ 0x30 ^ 0x01 ^ 0x02 ^ 0x03 ^ 0x04;
        assert_eq!(datagram[7], expected);
        assert_eq!(datagram[8], CHUNK_SENTINEL);
    }

    #[test]
    fn checksum_covers_whole_full_chunk() {
        let payload: Vec<u8> = (0..CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        let datagram = encode_chunk(&payload, 2560);
        let xor_all = datagram[..CHUNK_SIZE + 4].iter().fold(0u8, |a, b| a ^ b);
        assert_eq!(datagram[CHUNK_SIZE + 4], xor_all);
        assert_eq!(datagram.len(), 1286);
    }

    fn gbk() -> TextEncoding {
        TextEncoding::from_label("'GBK'").unwrap()
    }

    #[test]
    fn text_command_uses_encoding() {
        let cmd = Command::open_file("bäd.gcode");
        let latin1 = TextEncoding::from_label("ISO-8859-1").unwrap();
        assert_eq!(&*cmd.to_bytes(latin1), b"M28 b\xe4d.gcode");
        assert_eq!(&*cmd.to_bytes(TextEncoding::utf8()), "M28 bäd.gcode".as_bytes());
    }

    #[test]
    fn gbk_file_name_round_trips() {
        let cmd = Command::open_file("模型.gcode");
        let bytes = cmd.to_bytes(gbk());
        assert_eq!(&*bytes, b"M28 \xc4\xa3\xd0\xcd.gcode");
        assert_eq!(gbk().decode(&bytes), "M28 模型.gcode");
        assert_eq!(gbk().decode(b"ok '\xc4\xa3\xd0\xcd.gcode'"), "ok '模型.gcode'");
    }

    #[test]
    fn unmappable_characters_are_dropped() {
        let latin1 = TextEncoding::from_label("latin1").unwrap();
        assert_eq!(latin1.encode("M28 a模b"), b"M28 ab");
    }

    #[test]
    fn binary_command_passes_through() {
        let cmd = Command::from(vec![1u8, 2, 3]);
        assert!(!cmd.is_text());
        assert_eq!(&*cmd.to_bytes(gbk()), &[1, 2, 3]);
    }

    #[test]
    fn encoding_labels() {
        assert_eq!(TextEncoding::from_label("'UTF-8'"), Some(TextEncoding::utf8()));
        assert_eq!(TextEncoding::from_label(" gb2312 "), Some(gbk()));
        assert_eq!(gbk().name(), "GBK");
        assert_eq!(TextEncoding::from_label("no-such-charset"), None);
    }

    #[test]
    fn utf8_decode_drops_invalid_bytes() {
        assert_eq!(TextEncoding::utf8().decode(b"ok\xff done"), "ok done");
    }

    #[test]
    fn start_print_command_quotes_name() {
        assert_eq!(
            Command::start_print("cube.gcode"),
            Command::Text("M6030 \":cube.gcode\" I1".into())
        );
    }

    #[test]
    fn key_values_skip_malformed_tokens() {
        let pairs: Vec<_> = key_values("ok B:60/60 junk MAC:AA:BB T:12\r\n").collect();
        assert_eq!(pairs, vec![("B", "60/60"), ("T", "12")]);
    }

    #[test]
    fn resend_offset_parsing() {
        assert_eq!(parse_resend("resend 1280"), Some(1280));
        assert_eq!(parse_resend("Error resend 2560\r\n"), Some(2560));
        assert_eq!(parse_resend("resend x"), None);
        assert_eq!(parse_resend("ok"), None);
    }

    #[test]
    fn quoted_text_needs_a_pair() {
        assert_eq!(quoted_text("ok '/cube.gcode' done"), Some("/cube.gcode"));
        assert_eq!(quoted_text("ok 'unterminated"), None);
        assert_eq!(quoted_text("ok"), None);
    }

    #[test]
    fn firmware_follows_ok() {
        assert_eq!(firmware_from_reply("ok V4.2.3\r\n"), Some("V4.2.3"));
        assert_eq!(firmware_from_reply("Error"), None);
    }

    #[test]
    fn disconnect_markers() {
        assert!(has_disconnect_marker("Error:Wifi reboot"));
        assert!(has_disconnect_marker("Error:IP is connected"));
        assert!(!has_disconnect_marker("ok"));
    }
}
