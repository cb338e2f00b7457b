//! Private descriptors of the OpenTV guide: the channel list carried in the BAT, and the title and
//! summary descriptors of the event tables.  Text is Huffman coded and left undecoded here.

use super::DescriptorError;
use std::fmt;

/// Channel list (tag 0xb1) within a BAT transport loop.
pub struct OpenTvChannelDescriptor<'buf> {
    buf: &'buf [u8],
}
impl<'buf> OpenTvChannelDescriptor<'buf> {
    pub const TAG: u8 = 0xb1;
    const ENTRY_SIZE: usize = 9;

    pub fn new(
        tag: u8,
        buf: &'buf [u8],
    ) -> Result<OpenTvChannelDescriptor<'buf>, DescriptorError> {
        if buf.len() < 2 {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: 2,
            });
        }
        Ok(OpenTvChannelDescriptor { buf })
    }

    pub fn region_id(&self) -> u16 {
        u16::from(self.buf[0]) << 8 | u16::from(self.buf[1])
    }

    /// Complete entries only; a trailing partial entry is ignored.
    pub fn channels(&self) -> impl Iterator<Item = OpenTvChannel> + 'buf {
        self.buf[2..]
            .chunks_exact(Self::ENTRY_SIZE)
            .map(|c| OpenTvChannel {
                service_id: u16::from(c[0]) << 8 | u16::from(c[1]),
                channel_type: c[2],
                channel_id: u16::from(c[3]) << 8 | u16::from(c[4]),
                user_number: u16::from(c[5]) << 8 | u16::from(c[6]),
                flags: u16::from(c[7]) << 8 | u16::from(c[8]),
            })
    }
}
impl<'buf> fmt::Debug for OpenTvChannelDescriptor<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("OpenTvChannelDescriptor")
            .field("region_id", &self.region_id())
            .field("channels", &self.channels().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTvChannel {
    pub service_id: u16,
    pub channel_type: u8,
    pub channel_id: u16,
    pub user_number: u16,
    pub flags: u16,
}

/// Event title (tag 0xb5).  Times are in units of two seconds.
pub struct OpenTvTitleDescriptor<'buf> {
    buf: &'buf [u8],
}
impl<'buf> OpenTvTitleDescriptor<'buf> {
    pub const TAG: u8 = 0xb5;
    const HEADER_SIZE: usize = 6;

    pub fn new(
        tag: u8,
        buf: &'buf [u8],
    ) -> Result<OpenTvTitleDescriptor<'buf>, DescriptorError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(DescriptorError::NotEnoughData {
                tag,
                actual: buf.len(),
                expected: Self::HEADER_SIZE,
            });
        }
        Ok(OpenTvTitleDescriptor { buf })
    }

    /// Offset from midnight of the table's base date.
    pub fn start_offset(&self) -> chrono::Duration {
        chrono::Duration::seconds(2 * i64::from(self.word(0)))
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(2 * i64::from(self.word(2)))
    }

    pub fn theme(&self) -> u8 {
        self.buf[4]
    }

    pub fn title(&self) -> &'buf [u8] {
        &self.buf[Self::HEADER_SIZE..]
    }

    fn word(&self, at: usize) -> u16 {
        u16::from(self.buf[at]) << 8 | u16::from(self.buf[at + 1])
    }
}
impl<'buf> fmt::Debug for OpenTvTitleDescriptor<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("OpenTvTitleDescriptor")
            .field("start_offset", &self.start_offset())
            .field("duration", &self.duration())
            .field("theme", &self.theme())
            .finish()
    }
}

/// Event summary (tag 0xb9), all of it Huffman coded text.
#[derive(Debug)]
pub struct OpenTvSummaryDescriptor<'buf> {
    buf: &'buf [u8],
}
impl<'buf> OpenTvSummaryDescriptor<'buf> {
    pub const TAG: u8 = 0xb9;
    pub fn new(
        _tag: u8,
        buf: &'buf [u8],
    ) -> Result<OpenTvSummaryDescriptor<'buf>, DescriptorError> {
        Ok(OpenTvSummaryDescriptor { buf })
    }

    pub fn text(&self) -> &'buf [u8] {
        self.buf
    }
}

crate::descriptor_enum! {
    #[derive(Debug)]
    OpenTvDescriptors {
        ChannelList 0xb1 => OpenTvChannelDescriptor,
        Title 0xb5 => OpenTvTitleDescriptor,
        Summary 0xb9 => OpenTvSummaryDescriptor,
    }
}
