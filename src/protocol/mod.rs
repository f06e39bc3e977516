pub mod frame;
pub mod handshake;
pub mod query;
pub mod response;

pub use frame::{FrameDecoder, FrameHeader};
pub use response::Response;
