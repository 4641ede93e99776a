//! Shared types for the snapvol workspace.

mod error;

pub use error::{Result, SnapError};
