//! NOFF executable format
//!
//! The simulator's object format: a magic word followed by three segment
//! descriptors (code, initialized data, uninitialized data). Images built
//! on a machine of the other endianness are detected by the byteswapped
//! magic and every header field is swapped on load.

use crate::error::ExecError;

/// Magic word identifying a NOFF image.
pub const NOFF_MAGIC: i32 = 0xbad_fad;

/// One segment descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    /// Location of the segment in virtual address space.
    pub virtual_addr: i32,
    /// Location of the segment in the image file.
    pub in_file_addr: i32,
    /// Segment size in bytes.
    pub size: i32,
}

impl Segment {
    fn parse(bytes: &[u8]) -> Self {
        Self {
            virtual_addr: read_i32(bytes, 0),
            in_file_addr: read_i32(bytes, 4),
            size: read_i32(bytes, 8),
        }
    }

    fn swap(&mut self) {
        self.virtual_addr = self.virtual_addr.swap_bytes();
        self.in_file_addr = self.in_file_addr.swap_bytes();
        self.size = self.size.swap_bytes();
    }

    fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.virtual_addr.to_ne_bytes());
        out.extend_from_slice(&self.in_file_addr.to_ne_bytes());
        out.extend_from_slice(&self.size.to_ne_bytes());
    }
}

/// The NOFF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoffHeader {
    pub magic: i32,
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

impl NoffHeader {
    /// Serialized header size in bytes.
    pub const SIZE: usize = 40;

    /// An empty image header (all segments zero-sized).
    pub fn empty() -> Self {
        Self {
            magic: NOFF_MAGIC,
            code: Segment::default(),
            init_data: Segment::default(),
            uninit_data: Segment::default(),
        }
    }

    /// Parse a header, byteswapping if the image came from the other
    /// endianness. A magic that matches neither way is a malformed image.
    pub fn parse(bytes: &[u8; Self::SIZE]) -> Result<Self, ExecError> {
        let mut header = Self {
            magic: read_i32(bytes, 0),
            code: Segment::parse(&bytes[4..16]),
            init_data: Segment::parse(&bytes[16..28]),
            uninit_data: Segment::parse(&bytes[28..40]),
        };
        if header.magic != NOFF_MAGIC && header.magic.swap_bytes() == NOFF_MAGIC {
            header.magic = header.magic.swap_bytes();
            header.code.swap();
            header.init_data.swap();
            header.uninit_data.swap();
        }
        if header.magic != NOFF_MAGIC {
            return Err(ExecError::Malformed);
        }
        Ok(header)
    }

    /// Serialize in host byte order (the native-image case).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.magic.to_ne_bytes());
        self.code.emit(&mut out);
        self.init_data.emit(&mut out);
        self.uninit_data.emit(&mut out);
        out
    }
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
