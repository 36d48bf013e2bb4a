#![deny(
  unsafe_code,
  // reason = "Let's just not do it"
)]
#![deny(
  clippy::unwrap_used,
  clippy::expect_used,
  clippy::panic,
  clippy::unreachable,
  // reason = "We have to handle errors properly"
)]

pub mod config;
pub mod error;
pub mod modbus;

pub use error::Error;
pub use modbus::{Change, Engine, Observer, Transport, Value};
