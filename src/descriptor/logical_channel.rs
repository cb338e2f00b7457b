//! Logical channel numbers, as broadcast in the NIT by DVB-T and cable networks following the
//! EACEM / NorDig conventions.

use super::DescriptorError;
use std::fmt;

pub struct LogicalChannelDescriptor<'buf> {
    buf: &'buf [u8],
}
impl<'buf> LogicalChannelDescriptor<'buf> {
    pub const TAG: u8 = 0x83;
    pub fn new(
        tag: u8,
        buf: &'buf [u8],
    ) -> Result<LogicalChannelDescriptor<'buf>, DescriptorError> {
        if buf.len() % 4 != 0 {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: (buf.len() / 4 + 1) * 4,
            });
        }
        Ok(LogicalChannelDescriptor { buf })
    }

    pub fn channels(&self) -> impl Iterator<Item = LogicalChannel> + 'buf {
        self.buf.chunks_exact(4).map(|c| LogicalChannel {
            service_id: u16::from(c[0]) << 8 | u16::from(c[1]),
            visible: c[2] & 0b1000_0000 != 0,
            number: u16::from(c[2] & 0b11) << 8 | u16::from(c[3]),
        })
    }
}
impl<'buf> fmt::Debug for LogicalChannelDescriptor<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_list().entries(self.channels()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalChannel {
    pub service_id: u16,
    pub visible: bool,
    pub number: u16,
}
