//! memoryfixd — HTTP daemon for the MemoryFix try-on pipeline.

pub mod config;
pub mod engine;
pub mod error;
pub mod http_interface;

pub use engine::Engine;
pub use http_interface::router;
