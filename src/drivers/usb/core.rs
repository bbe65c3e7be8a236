//! Controller-independent USB types
//!
//! These are the only types class drivers see: they open pipes from an
//! [`EndpointDescriptor`], hold the returned [`PipeHandle`], and receive
//! [`TransferError`]s through the completion path.

use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Descriptor type codes
pub mod desc_type {
    pub const ENDPOINT: u8 = 5;
}

/// USB device speed, numbered as the EHCI endpoint-speed (EPS) field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UsbSpeed {
    #[default]
    Full = 0,
    Low = 1,
    High = 2,
}

impl UsbSpeed {
    /// Default control endpoint max packet size before the device
    /// descriptor has been read
    pub fn default_max_packet_size(self) -> u16 {
        match self {
            UsbSpeed::Low => 8,
            UsbSpeed::Full => 64,
            UsbSpeed::High => 64,
        }
    }
}

/// Endpoint transfer type (bmAttributes bits 0-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }

    /// Whether pipes of this type live in the periodic schedule
    pub fn is_periodic(self) -> bool {
        matches!(self, EndpointType::Interrupt | EndpointType::Isochronous)
    }
}

/// Data direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
        }
    }
}

/// Interface class code of the driver that owns a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassCode(pub u8);

impl ClassCode {
    pub const UNSPECIFIED: ClassCode = ClassCode(0x00);
    pub const HID: ClassCode = ClassCode(0x03);
    pub const MASS_STORAGE: ClassCode = ClassCode(0x08);
}

/// Standard endpoint descriptor (USB 2.0 table 9-13), wire layout
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: U16,
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Wire size of an endpoint descriptor
    pub const SIZE: usize = 7;

    pub fn new(endpoint_address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            length: Self::SIZE as u8,
            descriptor_type: desc_type::ENDPOINT,
            endpoint_address,
            attributes,
            max_packet_size: U16::new(max_packet_size),
            interval,
        }
    }

    /// Parse an endpoint descriptor from the front of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<Self, UsbError> {
        let (desc, _) = Self::read_from_prefix(bytes).map_err(|_| UsbError::InvalidDescriptor)?;
        if desc.descriptor_type != desc_type::ENDPOINT || (desc.length as usize) < Self::SIZE {
            return Err(UsbError::InvalidDescriptor);
        }
        Ok(desc)
    }

    /// Endpoint number (0-15)
    pub fn number(&self) -> u8 {
        self.endpoint_address & 0x0F
    }

    pub fn direction(&self) -> Direction {
        if self.endpoint_address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn transfer_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }

    /// Max packet size in bytes (wMaxPacketSize bits 0-10)
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size.get() & 0x7FF
    }

    /// Transactions per microframe for high-bandwidth endpoints
    /// (wMaxPacketSize bits 11-12, plus one)
    pub fn mult(&self) -> u8 {
        (((self.max_packet_size.get() >> 11) & 0x3) as u8 + 1).min(3)
    }
}

/// Opaque handle for an open pipe
///
/// Carries enough to find the queue head again: the device address and the
/// pipe-local index into that device's queue-head slice. `generation` counts
/// reuses of that slot, so a handle kept past its pipe's reclamation never
/// resolves to a pipe opened later in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeHandle {
    pub dev_addr: u8,
    pub xfer_type: EndpointType,
    pub index: u8,
    pub generation: u8,
}

/// Synchronous errors from the pipe API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Queue-head or descriptor pool exhausted
    NoResource,
    /// Handle does not reference a live queue head
    InvalidPipe,
    /// Close on a handle that is not open
    NotFound,
    /// Pipe is being torn down
    Busy,
    /// No device attached at that address
    DeviceNotFound,
    /// Operation not supported on this pipe type
    Unsupported,
    /// Malformed endpoint descriptor
    InvalidDescriptor,
    /// Controller never acknowledged an unlink
    ReclaimTimeout,
}

/// Why a submission stopped short, reported through the completion path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// Halted without an error bit: the endpoint returned STALL
    Stall,
    Babble,
    /// Data buffer overrun/underrun
    DataBuffer,
    /// CRC, timeout or bad PID, retry budget (CERR) exhausted
    Transaction,
    MissedMicroframe,
    SplitState,
    PingState,
    /// Pipe was closed while the submission was still pending
    Aborted,
}
