//! `service_descriptor` (tag 0x48), which names a service in the SDT.

use super::DescriptorError;
use std::fmt;

pub struct ServiceDescriptor<'buf> {
    buf: &'buf [u8],
    provider_len: usize,
}
impl<'buf> ServiceDescriptor<'buf> {
    pub const TAG: u8 = 0x48;
    pub fn new(tag: u8, buf: &'buf [u8]) -> Result<ServiceDescriptor<'buf>, DescriptorError> {
        if buf.len() < 3 {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: 3,
            });
        }
        let provider_len = buf[1] as usize;
        let name_len_at = 2 + provider_len;
        let name_len = buf.get(name_len_at).map(|&l| l as usize);
        match name_len {
            Some(name_len) if name_len_at + 1 + name_len <= buf.len() => {
                Ok(ServiceDescriptor { buf, provider_len })
            }
            _ => Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: name_len_at + 1 + name_len.unwrap_or(0),
            }),
        }
    }

    pub fn service_type(&self) -> u8 {
        self.buf[0]
    }

    /// Encoded as per _EN 300 468 Annex A_.
    pub fn provider_name(&self) -> &'buf [u8] {
        &self.buf[2..2 + self.provider_len]
    }

    /// Encoded as per _EN 300 468 Annex A_.
    pub fn service_name(&self) -> &'buf [u8] {
        let at = 2 + self.provider_len;
        let len = self.buf[at] as usize;
        &self.buf[at + 1..at + 1 + len]
    }
}
impl<'buf> fmt::Debug for ServiceDescriptor<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("ServiceDescriptor")
            .field("service_type", &self.service_type())
            .field("provider_name", &String::from_utf8_lossy(self.provider_name()))
            .field("service_name", &String::from_utf8_lossy(self.service_name()))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::super::{Descriptor, SiDescriptors};
    use super::*;
    use assert_matches::assert_matches;
    use hex_literal::*;

    #[test]
    fn names() {
        let data = hex!("480a 01 03424243 04 4f6e6521");
        assert_matches!(SiDescriptors::from_bytes(&data), Ok(SiDescriptors::Service(s)) => {
            assert_eq!(s.service_type(), 1);
            assert_eq!(s.provider_name(), b"BBC");
            assert_eq!(s.service_name(), b"One!");
        });
    }

    #[test]
    fn name_overruns() {
        let data = hex!("4806 01 03424243 04");
        assert_matches!(
            SiDescriptors::from_bytes(&data),
            Err(DescriptorError::NotEnoughData {
                tag: 0x48,
                actual: 6,
                expected: 10
            })
        );
    }
}
