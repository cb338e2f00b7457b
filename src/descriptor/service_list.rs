//! `service_list_descriptor` (tag 0x41), carried in the NIT transport stream loop.

use super::DescriptorError;
use std::fmt;

pub struct ServiceListDescriptor<'buf> {
    buf: &'buf [u8],
}
impl<'buf> ServiceListDescriptor<'buf> {
    pub const TAG: u8 = 0x41;
    pub fn new(tag: u8, buf: &'buf [u8]) -> Result<ServiceListDescriptor<'buf>, DescriptorError> {
        if buf.len() % 3 != 0 {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: (buf.len() / 3 + 1) * 3,
            });
        }
        Ok(ServiceListDescriptor { buf })
    }

    /// `(service_id, service_type)` pairs.
    pub fn services(&self) -> impl Iterator<Item = (u16, u8)> + 'buf {
        self.buf
            .chunks_exact(3)
            .map(|c| (u16::from(c[0]) << 8 | u16::from(c[1]), c[2]))
    }
}
impl<'buf> fmt::Debug for ServiceListDescriptor<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_list().entries(self.services()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::super::{Descriptor, SiDescriptors};
    use super::*;
    use assert_matches::assert_matches;
    use hex_literal::*;

    #[test]
    fn services() {
        let data = hex!("4106 1001 01 1002 02");
        assert_matches!(SiDescriptors::from_bytes(&data), Ok(SiDescriptors::ServiceList(l)) => {
            assert_eq!(l.services().collect::<Vec<_>>(), vec![(0x1001, 1), (0x1002, 2)]);
        });
        assert_matches!(
            SiDescriptors::from_bytes(&hex!("4104 1001 01 10")),
            Err(DescriptorError::NotEnoughData { tag: 0x41, .. })
        );
    }
}
