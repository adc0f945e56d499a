//! Candidate text decoders, tried in a fixed preference order.
//!
//! K_i: One decoder is chosen for the whole file; there is no per-line fallback.
//! B_i: Each candidate may reject the bytes → Option

use encoding_rs::WINDOWS_1252;
use std::fmt;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A text encoding the row source knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEncoding {
    /// UTF-8, with a leading byte-order mark stripped if present
    Utf8Bom,
    /// Strict UTF-8
    Utf8,
    /// ISO-8859-1, every byte maps to the code point of the same value
    Latin1,
    /// Windows code page 1252
    Windows1252,
}

impl SourceEncoding {
    /// Decoders in the order they are attempted.
    pub const PREFERENCE: [SourceEncoding; 4] = [
        SourceEncoding::Utf8Bom,
        SourceEncoding::Utf8,
        SourceEncoding::Latin1,
        SourceEncoding::Windows1252,
    ];

    /// Decode the whole buffer, or `None` if these bytes are not valid here.
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            SourceEncoding::Utf8Bom => {
                let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
                std::str::from_utf8(body).ok().map(str::to_owned)
            }
            SourceEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
            SourceEncoding::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
            SourceEncoding::Windows1252 => WINDOWS_1252
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(|text| text.into_owned()),
        }
    }

    /// Try every candidate in preference order and keep the first success.
    pub fn detect(bytes: &[u8]) -> Option<(SourceEncoding, String)> {
        Self::PREFERENCE
            .iter()
            .find_map(|enc| enc.decode(bytes).map(|text| (*enc, text)))
    }
}

impl fmt::Display for SourceEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceEncoding::Utf8Bom => write!(f, "utf-8-sig"),
            SourceEncoding::Utf8 => write!(f, "utf-8"),
            SourceEncoding::Latin1 => write!(f, "latin-1"),
            SourceEncoding::Windows1252 => write!(f, "cp1252"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bom_is_stripped() {
        let (enc, text) = SourceEncoding::detect(b"\xEF\xBB\xBF555,hello").unwrap();
        assert_eq!(enc, SourceEncoding::Utf8Bom);
        assert_eq!(text, "555,hello");
    }

    #[test]
    fn test_invalid_utf8_falls_through_to_latin1() {
        // 0xE9 is 'é' in Latin-1 and an invalid lone byte in UTF-8.
        let (enc, text) = SourceEncoding::detect(b"555,caf\xE9").unwrap();
        assert_eq!(enc, SourceEncoding::Latin1);
        assert_eq!(text, "555,café");
    }

    #[test]
    fn test_individual_decoders() {
        assert!(SourceEncoding::Utf8.decode(b"\xFF").is_none());
        assert_eq!(
            SourceEncoding::Utf8.decode(b"\xEF\xBB\xBFx").as_deref(),
            Some("\u{feff}x")
        );
        // 0x80 is the euro sign in cp1252.
        assert_eq!(
            SourceEncoding::Windows1252.decode(b"\x80").as_deref(),
            Some("€")
        );
    }
}
