// src/core/protocol/mod.rs

pub mod frame_reader;
pub mod resp_frame;
pub use frame_reader::{RawCommand, RawReply, read_command, read_reply};
pub use resp_frame::{RespFrame, RespFrameCodec};
