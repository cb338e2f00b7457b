//! Dish Network's Huffman coded event name (tag 0x91) and description (tag 0x92) descriptors.

use super::event::ContentDescriptor;
use super::DescriptorError;
use std::fmt;

/// Which of the two Dish Network dictionaries a text field is coded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DishDictionary {
    Table128,
    Table255,
}

pub struct DishTextDescriptor<'buf> {
    buf: &'buf [u8],
}
impl<'buf> DishTextDescriptor<'buf> {
    pub const NAME_TAG: u8 = 0x91;
    pub const DESCRIPTION_TAG: u8 = 0x92;

    pub fn new(tag: u8, buf: &'buf [u8]) -> Result<DishTextDescriptor<'buf>, DescriptorError> {
        if buf.len() < 2 {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: 2,
            });
        }
        Ok(DishTextDescriptor { buf })
    }

    pub fn dictionary(&self) -> DishDictionary {
        if self.buf[0] & 0b1000_0000 != 0 {
            DishDictionary::Table255
        } else {
            DishDictionary::Table128
        }
    }

    /// Number of characters the text decompresses to.
    pub fn decompressed_len(&self) -> usize {
        usize::from(self.buf[1])
    }

    pub fn compressed(&self) -> &'buf [u8] {
        &self.buf[2..]
    }
}
impl<'buf> fmt::Debug for DishTextDescriptor<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("DishTextDescriptor")
            .field("dictionary", &self.dictionary())
            .field("decompressed_len", &self.decompressed_len())
            .finish()
    }
}

crate::descriptor_enum! {
    #[derive(Debug)]
    DishDescriptors {
        Name 0x91 => DishTextDescriptor,
        Description 0x92 => DishTextDescriptor,
        Content 0x54 => ContentDescriptor,
    }
}

#[cfg(test)]
mod test {
    use super::super::Descriptor;
    use super::*;
    use assert_matches::assert_matches;
    use hex_literal::*;

    #[test]
    fn text_fields() {
        assert_matches!(DishDescriptors::from_bytes(&hex!("9103 8002 5c")), Ok(DishDescriptors::Name(n)) => {
            assert_eq!(n.dictionary(), DishDictionary::Table255);
            assert_eq!(n.decompressed_len(), 2);
            assert_eq!(n.compressed(), &[0x5c]);
        });
        assert_matches!(DishDescriptors::from_bytes(&hex!("9202 0000")), Ok(DishDescriptors::Description(d)) => {
            assert_eq!(d.dictionary(), DishDictionary::Table128);
            assert!(d.compressed().is_empty());
        });
        assert_matches!(
            DishDescriptors::from_bytes(&hex!("9101 80")),
            Err(DescriptorError::NotEnoughData { tag: 0x91, .. })
        );
    }
}
