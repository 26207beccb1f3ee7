//! Data models for calls and signaling records

mod call;
mod signal;

pub use call::*;
pub use signal::*;
