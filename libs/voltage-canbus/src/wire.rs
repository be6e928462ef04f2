//! Wire Frame Codec
//!
//! Field-by-field encoding of the 16-byte kernel `struct can_frame`:
//!
//! ```text
//! 0        4     5       6       8                16
//! ┌────────┬─────┬───────┬───────┬────────────────┐
//! │ can_id │ len │ flags │ 0 0   │ data[8]        │
//! └────────┴─────┴───────┴───────┴────────────────┘
//! ```
//!
//! `can_id` is in host byte order. Byte 5 is padding in the classic layout and
//! the flags byte in the CAN FD layout; the frame flags travel there. Bytes 6
//! and 7 are written as zero and ignored on decode.
//!
//! Every transport goes through this pair of functions, so the same frame is
//! byte-identical on every transport.

use crate::error::{CanBusError, Result};
use crate::frame::{Frame, CAN_MAX_DLEN};

/// Size of one wire frame (`CAN_MTU`)
pub const WIRE_FRAME_SIZE: usize = 16;

const ID_OFFSET: usize = 0;
const LEN_OFFSET: usize = 4;
const FLAGS_OFFSET: usize = 5;
const DATA_OFFSET: usize = 8;

/// Raw wire frame buffer
pub type WireFrame = [u8; WIRE_FRAME_SIZE];

/// Encode a frame into its 16-byte wire layout
pub fn encode(frame: &Frame) -> WireFrame {
    let mut buf = [0u8; WIRE_FRAME_SIZE];
    buf[ID_OFFSET..LEN_OFFSET].copy_from_slice(&frame.raw_id().to_ne_bytes());
    buf[LEN_OFFSET] = frame.dlc();
    buf[FLAGS_OFFSET] = frame.flags();
    buf[DATA_OFFSET..].copy_from_slice(frame.raw_data());
    buf
}

/// Encode into a caller-provided buffer of at least 16 bytes
pub fn encode_into(frame: &Frame, out: &mut [u8]) -> Result<()> {
    let Some(slot) = out.get_mut(..WIRE_FRAME_SIZE) else {
        return Err(CanBusError::invalid_frame(format!(
            "wire buffer of {} bytes cannot hold a {WIRE_FRAME_SIZE}-byte frame",
            out.len()
        )));
    };
    slot.copy_from_slice(&encode(frame));
    Ok(())
}

/// Decode exactly one wire frame
///
/// A buffer that is not exactly 16 bytes is a `ShortRead` (transport-level
/// corruption); a length byte above 8 is an `InvalidFrame` (bad record).
pub fn decode(buf: &[u8]) -> Result<Frame> {
    if buf.len() != WIRE_FRAME_SIZE {
        return Err(CanBusError::ShortRead {
            read: buf.len(),
            expected: WIRE_FRAME_SIZE,
        });
    }

    let mut id = [0u8; 4];
    id.copy_from_slice(&buf[ID_OFFSET..LEN_OFFSET]);
    let mut data = [0u8; CAN_MAX_DLEN];
    data.copy_from_slice(&buf[DATA_OFFSET..WIRE_FRAME_SIZE]);

    Frame::from_fields(
        u32::from_ne_bytes(id),
        buf[FLAGS_OFFSET],
        buf[LEN_OFFSET],
        data,
    )
}
