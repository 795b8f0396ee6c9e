// src/core/protocol/mod.rs

pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{Document, DocumentExt, ErrCode, Frame, FrameType, fields, matches_document};
