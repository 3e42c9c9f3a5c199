pub mod error;
pub mod fsutil;
pub mod simfile;

pub use error::{Error, Result};
pub use fsutil::{atomic_write_bytes, ensure_dir};
pub use simfile::SimParams;
