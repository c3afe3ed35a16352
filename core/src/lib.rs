pub mod codec;
pub mod error;
pub mod namespace;

pub use error::{Error, Result};
