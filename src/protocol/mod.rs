//! Wire protocol: incremental parser, frame encoders, header codec.

pub mod frame_buffer;
pub mod headers;
pub mod parser;
pub mod wire;

pub use frame_buffer::FrameBuffer;
pub use headers::{HeaderMap, STATUS_NO_RESPONDERS};
pub use parser::{MsgArgs, ParseState, Parser, ServerOp};
pub use wire::{ConnectInfo, ServerInfo};
