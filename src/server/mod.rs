pub mod engine;
pub mod session;

pub use engine::{ServerEngine, ServerEngineConfig};
pub use session::{Session, SessionTable};
