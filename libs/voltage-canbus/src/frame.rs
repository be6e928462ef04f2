//! CAN Frame
//!
//! Canonical in-memory representation of one classic CAN 2.0 message.
//!
//! The identifier follows the kernel `can_id` encoding: the low 29 bits carry
//! the identifier, the three high bits flag extended format, remote
//! transmission request and error frames.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CanBusError, Result};

/// Extended frame format flag (29-bit identifier)
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error message frame flag
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// Valid bits of a standard (11-bit) identifier
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Valid bits of an extended (29-bit) identifier
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Maximum payload of a classic CAN frame
pub const CAN_MAX_DLEN: usize = 8;

/// One CAN message
///
/// Copy value type; immutable after construction. Bytes of `data` beyond
/// `dlc` are unspecified and never interpreted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "FrameFields")]
pub struct Frame {
    id: u32,
    flags: u8,
    dlc: u8,
    data: [u8; CAN_MAX_DLEN],
}

impl Frame {
    /// Create a data frame, picking standard or extended format from the id value
    pub fn new(id: u32, data: &[u8]) -> Result<Self> {
        if id > CAN_EFF_MASK {
            return Err(CanBusError::invalid_frame(format!(
                "CAN ID 0x{id:X} exceeds 29 bits"
            )));
        }
        let raw_id = if id > CAN_SFF_MASK {
            id | CAN_EFF_FLAG
        } else {
            id
        };
        Self::from_raw_parts(raw_id, 0, data)
    }

    /// Create a data frame with an extended (29-bit) identifier
    pub fn extended(id: u32, data: &[u8]) -> Result<Self> {
        if id > CAN_EFF_MASK {
            return Err(CanBusError::invalid_frame(format!(
                "Extended CAN ID 0x{id:X} exceeds 29 bits"
            )));
        }
        Self::from_raw_parts(id | CAN_EFF_FLAG, 0, data)
    }

    /// Create a remote transmission request for `dlc` bytes
    pub fn remote(id: u32, dlc: u8) -> Result<Self> {
        if dlc as usize > CAN_MAX_DLEN {
            return Err(CanBusError::invalid_frame(format!(
                "RTR length {dlc} exceeds {CAN_MAX_DLEN}"
            )));
        }
        let mut frame = Self::new(id, &[])?;
        frame.id |= CAN_RTR_FLAG;
        frame.dlc = dlc;
        Ok(frame)
    }

    /// Build a frame from a raw kernel identifier (flag bits included)
    pub fn from_raw_parts(raw_id: u32, flags: u8, data: &[u8]) -> Result<Self> {
        if data.len() > CAN_MAX_DLEN {
            return Err(CanBusError::invalid_frame(format!(
                "CAN 2.0 data must be <= {CAN_MAX_DLEN} bytes, got {}",
                data.len()
            )));
        }
        let mut buf = [0u8; CAN_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id: raw_id,
            flags,
            dlc: data.len() as u8,
            data: buf,
        })
    }

    /// Build a frame from its decoded fields; `dlc` must not exceed 8
    pub(crate) fn from_fields(
        raw_id: u32,
        flags: u8,
        dlc: u8,
        data: [u8; CAN_MAX_DLEN],
    ) -> Result<Self> {
        if dlc as usize > CAN_MAX_DLEN {
            return Err(CanBusError::invalid_frame(format!(
                "DLC {dlc} exceeds {CAN_MAX_DLEN}"
            )));
        }
        Ok(Self {
            id: raw_id,
            flags,
            dlc,
            data,
        })
    }

    /// Return a copy carrying the given protocol-level flags byte
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Identifier including the EFF/RTR/ERR flag bits
    #[inline]
    pub fn raw_id(&self) -> u32 {
        self.id
    }

    /// Identifier with the flag bits masked off
    #[inline]
    pub fn id(&self) -> u32 {
        if self.is_extended() {
            self.id & CAN_EFF_MASK
        } else {
            self.id & CAN_SFF_MASK
        }
    }

    #[inline]
    pub fn is_extended(&self) -> bool {
        self.id & CAN_EFF_FLAG != 0
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        self.id & CAN_RTR_FLAG != 0
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.id & CAN_ERR_FLAG != 0
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    #[inline]
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Payload bytes up to `dlc`
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Full 8-byte data field, including unspecified bytes beyond `dlc`
    #[inline]
    pub fn raw_data(&self) -> &[u8; CAN_MAX_DLEN] {
        &self.data
    }
}

/// Unchecked field set; deserialized frames are validated through it
#[derive(Deserialize)]
struct FrameFields {
    id: u32,
    flags: u8,
    dlc: u8,
    data: [u8; CAN_MAX_DLEN],
}

impl TryFrom<FrameFields> for Frame {
    type Error = CanBusError;

    fn try_from(fields: FrameFields) -> Result<Self> {
        Frame::from_fields(fields.id, fields.flags, fields.dlc, fields.data)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &format_args!("0x{:X}", self.id()))
            .field("extended", &self.is_extended())
            .field("remote", &self.is_remote())
            .field("flags", &self.flags)
            .field("dlc", &self.dlc)
            .field("data", &self.data())
            .finish()
    }
}

/// candump-style rendering: `123#DEADBEEF`, `12345678#00`, `123#R2`
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "{:08X}#", self.id())?;
        } else {
            write!(f, "{:03X}#", self.id())?;
        }
        if self.is_remote() {
            return write!(f, "R{}", self.dlc);
        }
        for byte in self.data() {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Parse candump syntax; identifiers longer than 3 digits are extended
impl std::str::FromStr for Frame {
    type Err = CanBusError;

    fn from_str(s: &str) -> Result<Self> {
        let (id_part, data_part) = s
            .split_once('#')
            .ok_or_else(|| CanBusError::invalid_frame(format!("missing '#' in {s:?}")))?;
        let id = u32::from_str_radix(id_part, 16)
            .map_err(|_| CanBusError::invalid_frame(format!("bad identifier {id_part:?}")))?;
        let extended = id_part.len() > 3;
        if !extended && id > CAN_SFF_MASK {
            return Err(CanBusError::invalid_frame(format!(
                "standard identifier {id_part:?} exceeds 0x7FF; use 8 digits for extended"
            )));
        }

        if let Some(dlc) = data_part.strip_prefix('R') {
            let dlc = if dlc.is_empty() {
                0
            } else {
                dlc.parse::<u8>()
                    .map_err(|_| CanBusError::invalid_frame(format!("bad remote length {dlc:?}")))?
            };
            if extended {
                // Extended format forced by the digit count, not the value
                let base = Frame::extended(id, &[])?;
                return Frame::from_fields(base.raw_id() | CAN_RTR_FLAG, 0, dlc, [0; CAN_MAX_DLEN]);
            }
            return Frame::remote(id, dlc);
        }

        let hex: String = data_part.chars().filter(|c| *c != '.').collect();
        if !hex.is_ascii() || hex.len() % 2 != 0 {
            return Err(CanBusError::invalid_frame(format!(
                "data must be pairs of hex digits: {data_part:?}"
            )));
        }
        let data = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| CanBusError::invalid_frame(format!("bad data {data_part:?}")))?;

        if extended {
            Frame::extended(id, &data)
        } else {
            Frame::new(id, &data)
        }
    }
}
