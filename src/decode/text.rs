//! Character set handling for broadcast text fields.

use super::DecodeError;
use encoding_rs::Encoding;

/// Decode a DVB text field, per _ETSI EN 300 468 Annex A_.  The first byte may select a character
/// table; without one the default table is assumed.  Emphasis control codes are dropped and the
/// CR/LF control code becomes `'\n'`.
pub fn decode_dvb_text(field: &'static str, bytes: &[u8]) -> Result<String, DecodeError> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    let (encoding, text) = match bytes[0] {
        0x01..=0x0b => (iso_8859_part(bytes[0] + 4), &bytes[1..]),
        0x10 => {
            if bytes.len() < 3 {
                return Err(DecodeError::Truncated {
                    field,
                    needed: 3,
                    available: bytes.len(),
                });
            }
            (iso_8859_part(bytes[2]), &bytes[3..])
        }
        0x11 => return Ok(clean_unicode(utf16_be(&bytes[1..]))),
        0x12 => (Some(encoding_rs::EUC_KR), &bytes[1..]),
        0x13 => (Some(encoding_rs::GBK), &bytes[1..]),
        0x14 => (Some(encoding_rs::BIG5), &bytes[1..]),
        0x15 => {
            let (s, _, _) = encoding_rs::UTF_8.decode(&bytes[1..]);
            return Ok(clean_unicode(s.into_owned()));
        }
        0x1f => {
            return Err(DecodeError::InvalidField {
                field,
                reason: format!("unsupported encoding_type_id {:#04x}", bytes.get(1).unwrap_or(&0)),
            })
        }
        0x00..=0x1f => (None, &bytes[1..]),
        _ => (None, bytes),
    };
    let encoding = encoding.unwrap_or(encoding_rs::WINDOWS_1252);
    if encoding.is_single_byte() {
        Ok(decode_single_byte(encoding, text))
    } else {
        let (s, _) = encoding.decode_without_bom_handling(text);
        Ok(clean_unicode(s.into_owned()))
    }
}

fn iso_8859_part(part: u8) -> Option<&'static Encoding> {
    match part {
        1 => Some(encoding_rs::WINDOWS_1252),
        2 => Some(encoding_rs::ISO_8859_2),
        3 => Some(encoding_rs::ISO_8859_3),
        4 => Some(encoding_rs::ISO_8859_4),
        5 => Some(encoding_rs::ISO_8859_5),
        6 => Some(encoding_rs::ISO_8859_6),
        7 => Some(encoding_rs::ISO_8859_7),
        8 => Some(encoding_rs::ISO_8859_8),
        9 => Some(encoding_rs::WINDOWS_1254),
        10 => Some(encoding_rs::ISO_8859_10),
        11 => Some(encoding_rs::WINDOWS_874),
        13 => Some(encoding_rs::ISO_8859_13),
        14 => Some(encoding_rs::ISO_8859_14),
        15 => Some(encoding_rs::ISO_8859_15),
        16 => Some(encoding_rs::ISO_8859_16),
        _ => None,
    }
}

/// Decode with a single-byte table, first handling the `0x80..=0x9f` control codes which some
/// tables would otherwise map to printable characters.
fn decode_single_byte(encoding: &'static Encoding, text: &[u8]) -> String {
    let filtered: Vec<u8> = text
        .iter()
        .filter_map(|&b| match b {
            0x8a => Some(b'\n'),
            0x80..=0x9f => None,
            _ => Some(b),
        })
        .collect();
    let (s, _) = encoding.decode_without_bom_handling(&filtered);
    trim_padding(&s)
}

fn utf16_be(bytes: &[u8]) -> String {
    let (s, _) = encoding_rs::UTF_16BE.decode_without_bom_handling(bytes);
    s.into_owned()
}

fn clean_unicode(s: String) -> String {
    let s: String = s
        .chars()
        .filter_map(|c| match c {
            '\u{008a}' | '\u{e08a}' => Some('\n'),
            '\u{0080}'..='\u{009f}' | '\u{e080}'..='\u{e09f}' => None,
            _ => Some(c),
        })
        .collect();
    trim_padding(&s)
}

fn trim_padding(s: &str) -> String {
    s.trim_end_matches(|c: char| c == '\0' || c == ' ').to_string()
}

/// Fixed-width Latin-1 fields as used by MediaHighway: trailing spaces and NULs are padding.
pub fn decode_latin1(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let s: String = bytes[..end].iter().map(|&b| b as char).collect();
    s.trim_end().to_string()
}

/// UTF-16BE text without a character table selector, as in ATSC short channel names.
pub fn decode_utf16(bytes: &[u8]) -> String {
    let s = utf16_be(bytes);
    s.trim_end_matches(|c: char| c == '\0' || c == ' ').to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_table() {
        assert_eq!(decode_dvb_text("t", b"News at Ten").unwrap(), "News at Ten");
    }

    #[test]
    fn control_codes() {
        let bytes = b"\x86Bold\x87 line\x8anext";
        assert_eq!(decode_dvb_text("t", &bytes[..]).unwrap(), "Bold line\nnext");
    }

    #[test]
    fn selected_tables() {
        // ISO/IEC 8859-5, Cyrillic
        assert_eq!(decode_dvb_text("t", &[0x01, 0xbd, 0xde][..]).unwrap(), "Но");
        // three byte selector for ISO/IEC 8859-2
        assert_eq!(
            decode_dvb_text("t", &[0x10, 0x00, 0x02, 0xa9][..]).unwrap(),
            "Š"
        );
        assert_eq!(
            decode_dvb_text("t", &[0x11, 0x00, 0x41, 0x00, 0xe9][..]).unwrap(),
            "Aé"
        );
        assert_eq!(
            decode_dvb_text("t", "\u{15}Ωmega".as_bytes()).unwrap(),
            "Ωmega"
        );
    }

    #[test]
    fn truncated_selector() {
        assert_matches!(
            decode_dvb_text("event_name", &[0x10, 0x00][..]),
            Err(DecodeError::Truncated {
                field: "event_name",
                ..
            })
        );
    }

    #[test]
    fn latin1_padding() {
        assert_eq!(decode_latin1(b"Canal+  \0\0"), "Canal+");
        assert_eq!(decode_latin1(&[0x45, 0xa1, 0x20][..]), "E\u{a1}");
    }
}
