// A set of helper structs for common operations
pub mod fdwatch;
pub mod geom;
pub mod log;
#[macro_use]
pub mod logging;
pub mod timing;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};
