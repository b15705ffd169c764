//! Common types shared across the switchboard workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
