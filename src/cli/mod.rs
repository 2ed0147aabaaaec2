//! Command logic behind `rollgatectl`
//!
//! The binary only parses arguments and prints; everything that can be
//! tested without a terminal lives here.

pub mod lint;
pub mod restart;
pub mod server;
