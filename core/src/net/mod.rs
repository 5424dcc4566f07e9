pub mod client;
pub mod frame;
pub mod messages;

pub use client::{NetEvent, RelayClient};
pub use frame::{encode_frame, FrameDecoder, FrameError};
pub use messages::Message;
