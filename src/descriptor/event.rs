//! Descriptors attached to EIT events.

use super::DescriptorError;
use std::fmt;

/// `short_event_descriptor` (tag 0x4d): event name and a short description, in one language.
pub struct ShortEventDescriptor<'buf> {
    buf: &'buf [u8],
    name_len: usize,
}
impl<'buf> ShortEventDescriptor<'buf> {
    pub const TAG: u8 = 0x4d;
    pub fn new(tag: u8, buf: &'buf [u8]) -> Result<ShortEventDescriptor<'buf>, DescriptorError> {
        if buf.len() < 5 {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: 5,
            });
        }
        let name_len = buf[3] as usize;
        let text_len_at = 4 + name_len;
        if text_len_at >= buf.len() {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: text_len_at + 1,
            });
        }
        let text_len = buf[text_len_at] as usize;
        if text_len_at + 1 + text_len > buf.len() {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: text_len_at + 1 + text_len,
            });
        }
        Ok(ShortEventDescriptor { buf, name_len })
    }

    pub fn language_code(&self) -> &'buf [u8] {
        &self.buf[0..3]
    }

    /// Still encoded, as per _EN 300 468 Annex A_.
    pub fn event_name(&self) -> &'buf [u8] {
        &self.buf[4..4 + self.name_len]
    }

    pub fn text(&self) -> &'buf [u8] {
        let at = 4 + self.name_len;
        let len = self.buf[at] as usize;
        &self.buf[at + 1..at + 1 + len]
    }
}
impl<'buf> fmt::Debug for ShortEventDescriptor<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("ShortEventDescriptor")
            .field("language_code", &String::from_utf8_lossy(self.language_code()))
            .field("event_name", &String::from_utf8_lossy(self.event_name()))
            .finish()
    }
}

/// `extended_event_descriptor` (tag 0x4e).  Long descriptions are split over several of these,
/// numbered by `descriptor_number`.
pub struct ExtendedEventDescriptor<'buf> {
    buf: &'buf [u8],
    items_len: usize,
}
impl<'buf> ExtendedEventDescriptor<'buf> {
    pub const TAG: u8 = 0x4e;
    pub fn new(
        tag: u8,
        buf: &'buf [u8],
    ) -> Result<ExtendedEventDescriptor<'buf>, DescriptorError> {
        if buf.len() < 6 {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: 6,
            });
        }
        let items_len = buf[4] as usize;
        let text_len_at = 5 + items_len;
        if text_len_at >= buf.len() {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: text_len_at + 1,
            });
        }
        let text_len = buf[text_len_at] as usize;
        if text_len_at + 1 + text_len > buf.len() {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: text_len_at + 1 + text_len,
            });
        }
        Ok(ExtendedEventDescriptor { buf, items_len })
    }

    pub fn descriptor_number(&self) -> u8 {
        self.buf[0] >> 4
    }

    pub fn last_descriptor_number(&self) -> u8 {
        self.buf[0] & 0x0f
    }

    pub fn language_code(&self) -> &'buf [u8] {
        &self.buf[1..4]
    }

    /// The raw `item_description`/`item` loop.
    pub fn items(&self) -> &'buf [u8] {
        &self.buf[5..5 + self.items_len]
    }

    pub fn text(&self) -> &'buf [u8] {
        let at = 5 + self.items_len;
        let len = self.buf[at] as usize;
        &self.buf[at + 1..at + 1 + len]
    }
}
impl<'buf> fmt::Debug for ExtendedEventDescriptor<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("ExtendedEventDescriptor")
            .field("descriptor_number", &self.descriptor_number())
            .field("last_descriptor_number", &self.last_descriptor_number())
            .field("text_len", &self.text().len())
            .finish()
    }
}

/// `content_descriptor` (tag 0x54): genre classification as pairs of nibbles.
#[derive(Debug)]
pub struct ContentDescriptor<'buf> {
    buf: &'buf [u8],
}
impl<'buf> ContentDescriptor<'buf> {
    pub const TAG: u8 = 0x54;
    pub fn new(_tag: u8, buf: &'buf [u8]) -> Result<ContentDescriptor<'buf>, DescriptorError> {
        Ok(ContentDescriptor { buf })
    }

    /// `(content_nibble_level_1, content_nibble_level_2)` for each classification given.
    pub fn nibbles(&self) -> impl Iterator<Item = (u8, u8)> + 'buf {
        self.buf.chunks_exact(2).map(|c| (c[0] >> 4, c[0] & 0x0f))
    }
}

/// Where a CRID is to be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CridLocation<'buf> {
    /// Carried within the descriptor.
    Inline(&'buf [u8]),
    /// A reference into a CRID Information Table.
    Reference(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crid<'buf> {
    pub crid_type: u8,
    pub location: CridLocation<'buf>,
}

impl<'buf> Crid<'buf> {
    /// Type 0x01/0x31 identifies the programme (episode).
    pub fn is_episode(&self) -> bool {
        self.crid_type == 0x01 || self.crid_type == 0x31
    }
    /// Type 0x02/0x32 identifies a series.
    pub fn is_series(&self) -> bool {
        self.crid_type == 0x02 || self.crid_type == 0x32
    }
}

/// `content_identifier_descriptor` (tag 0x76), from _ETSI TS 102 323_.
#[derive(Debug)]
pub struct ContentIdentifierDescriptor<'buf> {
    buf: &'buf [u8],
}
impl<'buf> ContentIdentifierDescriptor<'buf> {
    pub const TAG: u8 = 0x76;
    pub fn new(
        _tag: u8,
        buf: &'buf [u8],
    ) -> Result<ContentIdentifierDescriptor<'buf>, DescriptorError> {
        Ok(ContentIdentifierDescriptor { buf })
    }

    pub fn crids(&self) -> CridIter<'buf> {
        CridIter { buf: self.buf }
    }
}

pub struct CridIter<'buf> {
    buf: &'buf [u8],
}
impl<'buf> Iterator for CridIter<'buf> {
    type Item = Result<Crid<'buf>, DescriptorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let crid_type = self.buf[0] >> 2;
        let location = self.buf[0] & 0b11;
        let (location, consumed) = match location {
            0 => {
                let len = self.buf.get(1).map(|&l| l as usize);
                match len {
                    Some(len) if self.buf.len() >= 2 + len => {
                        (CridLocation::Inline(&self.buf[2..2 + len]), 2 + len)
                    }
                    _ => return self.fail(2 + len.unwrap_or(0)),
                }
            }
            1 => {
                if self.buf.len() < 3 {
                    return self.fail(3);
                }
                let r = u16::from(self.buf[1]) << 8 | u16::from(self.buf[2]);
                (CridLocation::Reference(r), 3)
            }
            _ => {
                // reserved location values have no defined length
                self.buf = &self.buf[0..0];
                return None;
            }
        };
        self.buf = &self.buf[consumed..];
        Some(Ok(Crid {
            crid_type,
            location,
        }))
    }
}
impl<'buf> CridIter<'buf> {
    fn fail(&mut self, expected: usize) -> Option<Result<Crid<'buf>, DescriptorError>> {
        let actual = self.buf.len();
        self.buf = &self.buf[0..0];
        Some(Err(DescriptorError::NotEnoughData {
            tag: ContentIdentifierDescriptor::TAG,
            actual,
            expected,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::super::{Descriptor, SiDescriptors};
    use super::*;
    use assert_matches::assert_matches;
    use hex_literal::*;

    #[test]
    fn short_event() {
        let data = hex!("4d0d656e67054e6577732004546f6e6967");
        // the declared text length runs one byte past the end
        assert_matches!(
            SiDescriptors::from_bytes(&data),
            Err(DescriptorError::NotEnoughData { tag: 0x4d, .. })
        );
        let data = hex!("4d0d656e67054e6577732003546f6e");
        assert_matches!(SiDescriptors::from_bytes(&data), Ok(SiDescriptors::ShortEvent(ev)) => {
            assert_eq!(ev.language_code(), b"eng");
            assert_eq!(ev.event_name(), b"News ");
            assert_eq!(ev.text(), b"Ton");
        });
    }

    #[test]
    fn extended_event() {
        let data = hex!("4e0a12656e6700 04 54657874");
        assert_matches!(SiDescriptors::from_bytes(&data), Ok(SiDescriptors::ExtendedEvent(ev)) => {
            assert_eq!(ev.descriptor_number(), 1);
            assert_eq!(ev.last_descriptor_number(), 2);
            assert_eq!(ev.items(), b"");
            assert_eq!(ev.text(), b"Text");
        });
    }

    #[test]
    fn content_nibbles() {
        let data = hex!("5404 4300 a1ff");
        assert_matches!(SiDescriptors::from_bytes(&data), Ok(SiDescriptors::Content(c)) => {
            assert_eq!(c.nibbles().collect::<Vec<_>>(), vec![(4, 3), (0xa, 1)]);
        });
    }

    #[test]
    fn crids() {
        // inline series CRID "/s1", then a referenced episode CRID
        let data = hex!("7608 c8032f7331 c50102");
        assert_matches!(SiDescriptors::from_bytes(&data), Ok(SiDescriptors::ContentIdentifier(c)) => {
            let crids: Vec<_> = c.crids().collect();
            assert_eq!(crids.len(), 2);
            let first = crids[0].as_ref().unwrap();
            assert!(first.is_series());
            assert_eq!(first.location, CridLocation::Inline(b"/s1"));
            let second = crids[1].as_ref().unwrap();
            assert!(second.is_episode());
            assert_eq!(second.location, CridLocation::Reference(0x0102));
        });
    }
}
