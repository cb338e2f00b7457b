//! A [`Packet`](./struct.Packet.html) view over 188 bytes of transport stream, exposing only the
//! header fields that section reassembly depends on.

use log::warn;
use std::convert::TryFrom;
use std::fmt;

/// The `adaptation_field_control` bits, saying which of an adaptation field and a payload follow
/// the 4-byte header.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum AdaptationControl {
    /// `0b00`, which a conforming multiplexer never emits.
    Reserved,
    PayloadOnly,
    AdaptationFieldOnly,
    AdaptationFieldAndPayload,
}

impl AdaptationControl {
    fn from_bits(bits: u8) -> AdaptationControl {
        match bits & 0b11 {
            0b01 => AdaptationControl::PayloadOnly,
            0b10 => AdaptationControl::AdaptationFieldOnly,
            0b11 => AdaptationControl::AdaptationFieldAndPayload,
            _ => AdaptationControl::Reserved,
        }
    }

    #[inline(always)]
    pub fn has_payload(self) -> bool {
        matches!(
            self,
            AdaptationControl::PayloadOnly | AdaptationControl::AdaptationFieldAndPayload
        )
    }

    fn has_adaptation_field(self) -> bool {
        matches!(
            self,
            AdaptationControl::AdaptationFieldOnly | AdaptationControl::AdaptationFieldAndPayload
        )
    }
}

/// The 4-bit counter which increments on each payload-carrying packet of a PID, so that lost
/// packets can be noticed.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct ContinuityCounter {
    val: u8,
}

impl ContinuityCounter {
    /// Panics if the given value is greater than 15.
    #[inline]
    pub fn new(count: u8) -> ContinuityCounter {
        assert!(count < 0b10000);
        ContinuityCounter { val: count }
    }

    #[inline]
    pub fn count(self) -> u8 {
        self.val
    }

    /// True if this is the value expected in the packet after one carrying `other`.  The counter
    /// wraps around after 15:
    ///
    /// ```rust
    /// # use mpeg2ts_epg::packet::ContinuityCounter;
    /// assert!(ContinuityCounter::new(0).follows(ContinuityCounter::new(15)));
    /// ```
    #[inline]
    pub fn follows(self, other: ContinuityCounter) -> bool {
        (other.val + 1) & 0b1111 == self.val
    }
}

/// A 13-bit Packet Identifier.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(u16);

impl Pid {
    pub const MAX_VALUE: u16 = 0x1fff;

    /// Size of a table indexed by PID.
    pub const PID_COUNT: usize = (Self::MAX_VALUE + 1) as usize;

    /// Program Association Table
    pub const PAT: Pid = Pid::new(0);
    /// DVB Network Information Table
    pub const NIT: Pid = Pid::new(0x10);
    /// DVB Service Description Table, and the Bouquet Association Table sharing its PID
    pub const SDT_BAT: Pid = Pid::new(0x11);
    /// DVB Event Information Table
    pub const EIT: Pid = Pid::new(0x12);
    /// ATSC PSIP base PID, carrying MGT, VCT and STT
    pub const PSIP: Pid = Pid::new(0x1ffb);

    /// Panics if the given value is greater than `Pid::MAX_VALUE`.
    pub const fn new(pid: u16) -> Pid {
        assert!(pid <= Pid::MAX_VALUE);
        Pid(pid)
    }
}

impl TryFrom<u16> for Pid {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if value <= Pid::MAX_VALUE {
            Ok(Pid(value))
        } else {
            Err(())
        }
    }
}

impl From<Pid> for u16 {
    #[inline]
    fn from(pid: Pid) -> Self {
        pid.0
    }
}

impl From<Pid> for usize {
    #[inline]
    fn from(pid: Pid) -> Self {
        usize::from(pid.0)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({:04x})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Borrows the bytes of one transport stream packet, _ISO/IEC 13818-1, Section 2.4.3.2_.
pub struct Packet<'buf> {
    buf: &'buf [u8],
}

const HEADER_SIZE: usize = 4;
// the adaptation_field_length byte comes first, and is not counted in the length
const ADAPTATION_FIELD_OFFSET: usize = HEADER_SIZE + 1;

impl<'buf> Packet<'buf> {
    pub const SYNC_BYTE: u8 = 0x47;

    pub const SIZE: usize = 188;

    #[inline(always)]
    pub fn is_sync_byte(b: u8) -> bool {
        b == Self::SYNC_BYTE
    }

    /// Panics unless `buf` is exactly `Packet::SIZE` bytes starting with `Packet::SYNC_BYTE`.
    #[inline(always)]
    pub fn new(buf: &'buf [u8]) -> Packet<'buf> {
        assert_eq!(buf.len(), Self::SIZE);
        assert!(Packet::is_sync_byte(buf[0]));
        Packet { buf }
    }

    /// `None` when the first byte is not the sync byte.  Still panics on a wrongly sized buffer.
    #[inline(always)]
    pub fn try_new(buf: &'buf [u8]) -> Option<Packet<'buf>> {
        assert_eq!(buf.len(), Self::SIZE);
        if Packet::is_sync_byte(buf[0]) {
            Some(Packet { buf })
        } else {
            None
        }
    }

    /// Set by the demodulator when the packet has uncorrectable errors.
    #[inline]
    pub fn transport_error_indicator(&self) -> bool {
        self.buf[1] & 0b1000_0000 != 0
    }

    /// The payload starts with a `pointer_field`, and a new section begins somewhere in it.
    #[inline]
    pub fn payload_unit_start_indicator(&self) -> bool {
        self.buf[1] & 0b0100_0000 != 0
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        Pid(u16::from(self.buf[1] & 0b0001_1111) << 8 | u16::from(self.buf[2]))
    }

    #[inline]
    pub fn adaptation_control(&self) -> AdaptationControl {
        AdaptationControl::from_bits(self.buf[3] >> 4)
    }

    #[inline]
    pub fn continuity_counter(&self) -> ContinuityCounter {
        ContinuityCounter::new(self.buf[3] & 0b0000_1111)
    }

    fn adaptation_field_length(&self) -> usize {
        usize::from(self.buf[HEADER_SIZE])
    }

    /// The adaptation field's `discontinuity_indicator`, announcing that a jump in continuity
    /// counter values is expected on this PID.  `false` when there is no adaptation field.
    pub fn discontinuity_indicator(&self) -> bool {
        self.adaptation_control().has_adaptation_field()
            && self.adaptation_field_length() > 0
            && self.buf[ADAPTATION_FIELD_OFFSET] & 0b1000_0000 != 0
    }

    /// The bytes following the header and any adaptation field.  Never an empty slice.
    #[inline(always)]
    pub fn payload(&self) -> Option<&'buf [u8]> {
        let offset = match self.adaptation_control() {
            AdaptationControl::Reserved | AdaptationControl::AdaptationFieldOnly => return None,
            AdaptationControl::PayloadOnly => HEADER_SIZE,
            AdaptationControl::AdaptationFieldAndPayload => {
                ADAPTATION_FIELD_OFFSET + self.adaptation_field_length()
            }
        };
        if offset >= Self::SIZE {
            warn!(
                "{:?}: adaptation_field_length {} leaves no payload",
                self.pid(),
                self.adaptation_field_length()
            );
            return None;
        }
        Some(&self.buf[offset..])
    }

    /// All 188 bytes, header included.
    pub fn buffer(&self) -> &'buf [u8] {
        self.buf
    }
}

impl<'buf> fmt::Debug for Packet<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("pid", &self.pid())
            .field("pusi", &self.payload_unit_start_indicator())
            .field("cc", &self.continuity_counter().count())
            .field("adaptation_control", &self.adaptation_control())
            .finish()
    }
}
