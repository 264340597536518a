//! Common types for the quota crawler workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, mask};
