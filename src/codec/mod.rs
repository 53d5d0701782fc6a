pub mod errors;
pub mod frame;

pub use errors::FrameError;
pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
