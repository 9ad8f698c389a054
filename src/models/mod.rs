//! Data models

mod container;
mod server;

pub use container::*;
pub use server::*;
