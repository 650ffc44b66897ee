//! Register map and PM4 command-stream encoding for A2xx-class Adreno GPUs.
//!
//! This crate only covers what the command-processor supervision layer emits
//! itself: ring submission frames, page-table synchronisation sequences and
//! the registers it touches directly.

pub mod frame;
pub mod packets;
pub mod regs;
pub mod writer;

pub use frame::{
    encode_frame, frame_size, Frame, FrameParams, FrameScanner, CMD_IDENTIFIER, CONTEXT_NONE,
};
pub use packets::{decode_header, Pm4DecodeError, Pm4Header, Pm4Opcode, Pm4Packet, Pm4PacketIter};
pub use writer::Pm4Writer;
