//! Folio Core Library
//!
//! Shared configuration, errors, and logging setup for the Folio offline worker.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{NotificationConfig, StorageBackend, StorageConfig, WorkerConfig};
pub use error::{FolioError, FolioResult};
pub use logging::{init_logging, LogConfig, LogFormat};
