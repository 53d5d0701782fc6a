pub mod client;
pub mod codec;
pub mod control;
pub mod crypto;
pub mod daemon;
pub mod device;
pub mod network;
pub mod proto;
pub mod server;
pub mod store;
pub mod topology;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

/// Crate version, reported in handshakes and over the control surface.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Overlay MTU. Frames on the wire may not exceed twice this.
/// The server always owns `.1` of the overlay subnet.
pub const MTU: u16 = 1400;
