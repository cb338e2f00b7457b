//! Descriptors carry most of the interesting content of DVB service information: names, event
//! text, genre codes and channel numbers all arrive as descriptors attached to entries within a
//! table.
//!
//! # Extensions
//!
//! Descriptors are a point of extension: private guide formats define their own descriptor tags
//! alongside the standard ones.  Descriptor-related types therefore take a type parameter, so that
//! a decoder can supply an enum covering just the tags it understands, built with the
//! `descriptor_enum!{}` macro,
//!
//! ```
//! # use mpeg2ts_epg::descriptor::{DescriptorIter, SiDescriptors};
//! # let data = [0x4d, 0x07, b'e', b'n', b'g', 0x02, b'h', b'i', 0x00];
//! for d in DescriptorIter::<SiDescriptors<'_>>::new(&data) {
//!     if let Ok(SiDescriptors::ShortEvent(ev)) = d {
//!         assert_eq!(ev.event_name(), b"hi");
//!     }
//! }
//! ```

pub mod dish;
pub mod event;
pub mod logical_channel;
pub mod opentv;
pub mod service;
pub mod service_list;

use self::event::{
    ContentDescriptor, ContentIdentifierDescriptor, ExtendedEventDescriptor,
    ShortEventDescriptor,
};
use self::logical_channel::LogicalChannelDescriptor;
use self::service::ServiceDescriptor;
use self::service_list::ServiceListDescriptor;
use crate::decode::DecodeError;
use std::fmt;
use std::marker;

pub trait Descriptor<'buf>: Sized {
    fn from_bytes(buf: &'buf [u8]) -> Result<Self, DescriptorError>;
}

/// Builds an enum with one variant per handled descriptor tag (or set of tags), together with
/// its `Descriptor` implementation.  Tags not listed produce `DescriptorError::UnhandledTagValue`.
#[macro_export]
macro_rules! descriptor_enum {
    (
        $(#[$outer:meta])*
        $name:ident {
            $(
                $(#[$inner:ident $($args:tt)*])*
                $case_name:ident $($tags:pat_param)|* => $t:ident
            ),*,
        }
    ) => {
        $(#[$outer])*
        pub enum $name<'buf> {
            $(
                $(#[$inner $($args)*])*
                $case_name($t<'buf>),
            )*
        }
        impl<'buf> $crate::descriptor::Descriptor<'buf> for $name<'buf> {
            fn from_bytes(buf: &'buf[u8]) -> Result<Self, $crate::descriptor::DescriptorError> {
                if buf.len() < 2 {
                    return Err($crate::descriptor::DescriptorError::BufferTooShort{ buflen: buf.len() })
                }
                let tag = buf[0];
                let len = buf[1] as usize;
                let tag_end = len + 2;
                if tag_end > buf.len() {
                    return Err($crate::descriptor::DescriptorError::TagTooLongForBuffer{ taglen: len, buflen: buf.len() })
                }
                let payload = &buf[2..tag_end];
                match tag {
                    $( $( $tags )|* => Ok($name::$case_name($t::new(tag, payload)?)), )*
                    _ => Err($crate::descriptor::DescriptorError::UnhandledTagValue(tag)),
                }
            }
        }
    }
}

/// Any descriptor, undecoded.
pub struct UnknownDescriptor<'buf> {
    pub tag: u8,
    pub payload: &'buf [u8],
}
impl<'buf> UnknownDescriptor<'buf> {
    pub fn new(tag: u8, payload: &'buf [u8]) -> Result<UnknownDescriptor<'buf>, DescriptorError> {
        Ok(UnknownDescriptor { tag, payload })
    }
}
impl<'buf> Descriptor<'buf> for UnknownDescriptor<'buf> {
    fn from_bytes(buf: &'buf [u8]) -> Result<Self, DescriptorError> {
        if buf.len() < 2 {
            return Err(DescriptorError::BufferTooShort { buflen: buf.len() });
        }
        let len = buf[1] as usize;
        if len + 2 > buf.len() {
            return Err(DescriptorError::TagTooLongForBuffer {
                taglen: len,
                buflen: buf.len(),
            });
        }
        UnknownDescriptor::new(buf[0], &buf[2..len + 2])
    }
}
impl<'buf> fmt::Debug for UnknownDescriptor<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("UnknownDescriptor")
            .field("tag", &format_args!("{:#04x}", self.tag))
            .field("len", &self.payload.len())
            .finish()
    }
}

descriptor_enum! {
    /// The ETSI EN 300 468 descriptors that guide decoding makes use of.
    #[derive(Debug)]
    SiDescriptors {
        ServiceList 0x41 => ServiceListDescriptor,
        Service 0x48 => ServiceDescriptor,
        ShortEvent 0x4d => ShortEventDescriptor,
        ExtendedEvent 0x4e => ExtendedEventDescriptor,
        Content 0x54 => ContentDescriptor,
        ContentIdentifier 0x76 => ContentIdentifierDescriptor,
        /// The EACEM / NorDig logical channel descriptor, which lives in the private range.
        LogicalChannel 0x83 => LogicalChannelDescriptor,
    }
}

pub struct DescriptorIter<'buf, Desc>
where
    Desc: Descriptor<'buf>,
{
    buf: &'buf [u8],
    phantom: marker::PhantomData<Desc>,
}
impl<'buf, Desc> DescriptorIter<'buf, Desc>
where
    Desc: Descriptor<'buf>,
{
    pub fn new(buf: &'buf [u8]) -> DescriptorIter<'buf, Desc> {
        DescriptorIter {
            buf,
            phantom: marker::PhantomData,
        }
    }
}
impl<'buf, Desc> Iterator for DescriptorIter<'buf, Desc>
where
    Desc: Descriptor<'buf>,
{
    type Item = Result<Desc, DescriptorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < 2 {
            let buflen = self.buf.len();
            self.buf = &self.buf[0..0];
            return Some(Err(DescriptorError::BufferTooShort { buflen }));
        }
        let tag = self.buf[0];
        let len = self.buf[1] as usize;
        let remaining_size = self.buf.len() - 2;
        if len > remaining_size {
            // ensure another call to next() will yield None,
            self.buf = &self.buf[0..0];
            Some(Err(DescriptorError::NotEnoughData {
                tag,
                actual: remaining_size,
                expected: len,
            }))
        } else {
            let (desc, rest) = self.buf.split_at(len + 2);
            self.buf = rest;
            Some(Descriptor::from_bytes(desc))
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor {tag:#04x} needs {expected} bytes, {actual} available")]
    NotEnoughData {
        tag: u8,
        actual: usize,
        expected: usize,
    },
    #[error("descriptor length {taglen} too long for {buflen} byte buffer")]
    TagTooLongForBuffer { taglen: usize, buflen: usize },
    #[error("{buflen} bytes is too short for a descriptor")]
    BufferTooShort { buflen: usize },
    #[error("unhandled descriptor tag {0:#04x}")]
    UnhandledTagValue(u8),
}

impl From<DescriptorError> for DecodeError {
    fn from(e: DescriptorError) -> Self {
        match e {
            DescriptorError::NotEnoughData {
                actual, expected, ..
            } => DecodeError::Truncated {
                field: "descriptor",
                needed: expected,
                available: actual,
            },
            DescriptorError::TagTooLongForBuffer { taglen, buflen } => DecodeError::Truncated {
                field: "descriptor_length",
                needed: taglen + 2,
                available: buflen,
            },
            DescriptorError::BufferTooShort { buflen } => DecodeError::Truncated {
                field: "descriptor_tag",
                needed: 2,
                available: buflen,
            },
            DescriptorError::UnhandledTagValue(tag) => {
                DecodeError::invalid("descriptor_tag", format!("unhandled tag {:#04x}", tag))
            }
        }
    }
}

/// Iterate the descriptors in `buf`, skipping those with tags `Desc` doesn't handle, and stopping
/// with an error at the first malformed one.
pub fn handled<'buf, Desc>(
    buf: &'buf [u8],
) -> impl Iterator<Item = Result<Desc, DecodeError>> + 'buf
where
    Desc: Descriptor<'buf> + 'buf,
{
    DescriptorIter::<Desc>::new(buf).filter_map(|d| match d {
        Err(DescriptorError::UnhandledTagValue(_)) => None,
        other => Some(other.map_err(DecodeError::from)),
    })
}
