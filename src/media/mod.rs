pub mod color;
pub mod frame;
pub mod nalu;

pub use frame::RawFrame;
pub use nalu::{AccessUnit, Nalu};
