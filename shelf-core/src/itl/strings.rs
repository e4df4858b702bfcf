//! String encoding/decoding for `hohm` chunks (spec.md §4.3 "Strings").
//!
//! The encoding flag byte selects one of four encodings. Windows-1252 has
//! no teacher-provided crate (the corpus has no `encoding_rs` user), so it
//! is hand-rolled: codepoints below 0x80 are byte-identical to ASCII, and
//! the C1-range 0x80-0x9F slots that Windows-1252 repurposes for printable
//! characters are the only part that needs a lookup table.
use super::ItlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Ascii = 0,
    Utf16Be = 1,
    Utf8 = 2,
    Windows1252 = 3,
}

impl StringEncoding {
    pub fn from_flag(flag: u8) -> Result<Self, ItlError> {
        match flag {
            0 => Ok(StringEncoding::Ascii),
            1 => Ok(StringEncoding::Utf16Be),
            2 => Ok(StringEncoding::Utf8),
            3 => Ok(StringEncoding::Windows1252),
            other => Err(ItlError::Malformed(format!("invalid string encoding flag {other}"))),
        }
    }

    pub fn flag(self) -> u8 {
        self as u8
    }
}

/// Windows-1252 codepoints for byte values 0x80-0x9F; everything else maps
/// byte-for-byte to the same Unicode codepoint (Latin-1 equivalence).
const WIN1252_C1: [u16; 32] = [
    0x20AC, 0x0081, 0x201A, 0x0192, 0x201E, 0x2026, 0x2020, 0x2021, 0x02C6, 0x2030, 0x0160, 0x2039,
    0x0152, 0x008D, 0x017D, 0x008F, 0x0090, 0x2018, 0x2019, 0x201C, 0x201D, 0x2022, 0x2013, 0x2014,
    0x02DC, 0x2122, 0x0161, 0x203A, 0x0153, 0x009D, 0x017E, 0x0178,
];

fn decode_windows1252(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if (0x80..=0x9F).contains(&b) {
                char::from_u32(WIN1252_C1[(b - 0x80) as usize] as u32).unwrap_or('\u{FFFD}')
            } else {
                b as char
            }
        })
        .collect()
}

fn encode_windows1252(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        let cp = c as u32;
        if cp < 0x80 || (0xA0..=0xFF).contains(&cp) {
            out.push(cp as u8);
        } else if let Some(pos) = WIN1252_C1.iter().position(|&w| w as u32 == cp) {
            out.push(0x80 + pos as u8);
        } else {
            return None;
        }
    }
    Some(out)
}

/// Decodes a `hohm` string payload per its encoding flag (spec.md §4.3).
pub fn decode_string(encoding: StringEncoding, bytes: &[u8]) -> Result<String, ItlError> {
    match encoding {
        StringEncoding::Ascii => Ok(bytes.iter().map(|&b| b as char).collect()),
        StringEncoding::Utf8 => {
            String::from_utf8(bytes.to_vec()).map_err(|_| ItlError::Malformed("invalid UTF-8 string".into()))
        }
        StringEncoding::Windows1252 => Ok(decode_windows1252(bytes)),
        StringEncoding::Utf16Be => {
            if bytes.len() % 2 != 0 {
                return Err(ItlError::Malformed("UTF-16BE string has odd byte length".into()));
            }
            let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
            String::from_utf16(&units).map_err(|_| ItlError::Malformed("invalid UTF-16BE string".into()))
        }
    }
}

/// Picks the emit encoding and byte representation for `value` (spec.md
/// §4.3: "the codec picks flag 3 when every rune fits Windows-1252
/// (ASCII range), otherwise flag 1 (UTF-16BE)").
pub fn encode_string(value: &str) -> (StringEncoding, Vec<u8>) {
    if let Some(bytes) = encode_windows1252(value) {
        (StringEncoding::Windows1252, bytes)
    } else {
        let bytes = value.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        (StringEncoding::Utf16Be, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trips_as_windows1252() {
        let (enc, bytes) = encode_string("The Hobbit");
        assert_eq!(enc, StringEncoding::Windows1252);
        assert_eq!(decode_string(enc, &bytes).unwrap(), "The Hobbit");
    }

    #[test]
    fn non_latin_falls_back_to_utf16be() {
        let (enc, bytes) = encode_string("銀河ヒッチハイク");
        assert_eq!(enc, StringEncoding::Utf16Be);
        assert_eq!(decode_string(enc, &bytes).unwrap(), "銀河ヒッチハイク");
    }

    #[test]
    fn windows1252_curly_quote_round_trips() {
        let (enc, bytes) = encode_string("\u{201C}quoted\u{201D}");
        assert_eq!(enc, StringEncoding::Windows1252);
        assert_eq!(decode_string(enc, &bytes).unwrap(), "\u{201C}quoted\u{201D}");
    }

    #[test]
    fn invalid_flag_is_rejected() {
        assert!(StringEncoding::from_flag(9).is_err());
    }
}
