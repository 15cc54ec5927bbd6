pub mod config;
pub mod detection;
pub mod factory;
pub mod message;
pub mod runtime;
pub mod server;
pub mod shm;
pub mod source;
pub mod tracking;
pub mod video;

// Re-export the error type so callers only need `blobserver_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
