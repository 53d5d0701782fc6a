pub mod engine;

pub use engine::{ClientEngine, ClientEngineConfig, ClientStatus};
