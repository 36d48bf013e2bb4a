use crate::config::ConfigError;
use crate::modbus::{ConnectError, ConversionError, ReadError, WriteError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("Configuration error")]
  Configuration(#[from] ConfigError),

  #[error("Connection error")]
  Connection(#[from] ConnectError),

  #[error("Read error")]
  Read(#[from] ReadError),

  #[error("Write error")]
  Write(#[from] WriteError),

  #[error("Data conversion error")]
  Conversion(#[from] ConversionError),
}
