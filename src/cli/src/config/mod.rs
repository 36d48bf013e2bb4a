pub mod args;
pub mod env;
pub mod file;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use itertools::Itertools;
use tokio_modbus::{Address, Quantity};

use crate::modbus::{RegisterKind, Scaling, WordOrder};

/// Modbus transactions can carry at most this many registers.
pub const MAX_REGISTERS_PER_READ: Quantity = 125;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Parity {
  None,
  Even,
  Odd,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Serial {
  pub port_name: String,
  pub baud_rate: u32,
  pub parity: Parity,
  pub stop_bits: u8,
  pub byte_size: u8,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Transport {
  Tcp { host: String, port: u16 },
  Rtu(Serial),
}

#[derive(Debug, Clone)]
pub struct Connection {
  pub transport: Transport,
  pub timeout: chrono::Duration,
  pub retry_on_empty: bool,
  pub retry_delay: chrono::Duration,
  pub device_id: u8,
}

/// Register tables of the Modbus data model.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Table {
  Coils,
  DiscreteInputs,
  HoldingRegisters,
  InputRegisters,
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum FunctionCode {
  ReadCoils,
  ReadDiscreteInputs,
  ReadHoldingRegisters,
  ReadInputRegisters,
  WriteSingleCoil,
  WriteSingleRegister,
  WriteMultipleCoils,
  WriteMultipleRegisters,
}

impl FunctionCode {
  pub fn code(&self) -> u8 {
    match self {
      FunctionCode::ReadCoils => 1,
      FunctionCode::ReadDiscreteInputs => 2,
      FunctionCode::ReadHoldingRegisters => 3,
      FunctionCode::ReadInputRegisters => 4,
      FunctionCode::WriteSingleCoil => 5,
      FunctionCode::WriteSingleRegister => 6,
      FunctionCode::WriteMultipleCoils => 15,
      FunctionCode::WriteMultipleRegisters => 16,
    }
  }

  pub fn table(&self) -> Table {
    match self {
      FunctionCode::ReadCoils
      | FunctionCode::WriteSingleCoil
      | FunctionCode::WriteMultipleCoils => Table::Coils,
      FunctionCode::ReadDiscreteInputs => Table::DiscreteInputs,
      FunctionCode::ReadHoldingRegisters
      | FunctionCode::WriteSingleRegister
      | FunctionCode::WriteMultipleRegisters => Table::HoldingRegisters,
      FunctionCode::ReadInputRegisters => Table::InputRegisters,
    }
  }
}

impl TryFrom<u8> for FunctionCode {
  type Error = u8;

  fn try_from(code: u8) -> Result<Self, Self::Error> {
    Ok(match code {
      1 => FunctionCode::ReadCoils,
      2 => FunctionCode::ReadDiscreteInputs,
      3 => FunctionCode::ReadHoldingRegisters,
      4 => FunctionCode::ReadInputRegisters,
      5 => FunctionCode::WriteSingleCoil,
      6 => FunctionCode::WriteSingleRegister,
      15 => FunctionCode::WriteMultipleCoils,
      16 => FunctionCode::WriteMultipleRegisters,
      other => return Err(other),
    })
  }
}

impl std::fmt::Display for FunctionCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.code())
  }
}

#[derive(Debug, Clone)]
pub struct Register {
  pub name: String,
  pub address: Address,
  pub kind: RegisterKind,
  pub unit: Option<String>,
  pub function_code: FunctionCode,
  pub poll_interval: Option<chrono::Duration>,
  pub description: Option<String>,
  pub order: WordOrder,
  pub writable: bool,
  pub scaling: Scaling,
}

#[derive(Debug, Clone)]
pub struct Limits {
  pub max_registers_per_read: Quantity,
  pub min_request_interval: chrono::Duration,
  pub max_retries: u32,
  pub reconnect_delay: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct Values {
  pub connection: Connection,
  pub registers: Vec<Register>,
  pub limits: Limits,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed loading configuration document")]
  Document(#[from] file::ParseError),

  #[error("Unknown connection type {0:?}")]
  UnknownConnectionType(String),

  #[error("TCP connections require a host")]
  MissingHost,

  #[error("RTU connections require a serial port name")]
  MissingPortName,

  #[error("Invalid parity {0:?}")]
  InvalidParity(String),

  #[error("Invalid stop bits {0}")]
  InvalidStopBits(u8),

  #[error("Invalid byte size {0}")]
  InvalidByteSize(u8),

  #[error("Invalid duration {value} for {field}")]
  InvalidDuration { field: String, value: f64 },

  #[error("Register {name:?} has invalid type {kind:?}")]
  InvalidRegisterType { name: String, kind: String },

  #[error("String register {0:?} requires a length")]
  MissingLength(String),

  #[error("Register {name:?} has invalid function code {code}")]
  InvalidFunctionCode { name: String, code: u8 },

  #[error("Register {name:?} has invalid byte order {order:?}")]
  InvalidByteOrder { name: String, order: String },

  #[error("Duplicate register name {0:?}")]
  DuplicateName(String),

  #[error("String register {0:?} cannot be scaled")]
  ScaledString(String),

  #[error("Max registers per read must be within 1..={} but is {0}", MAX_REGISTERS_PER_READ)]
  InvalidMaxRegisters(Quantity),

  #[error("Register {name:?} spans {quantity} words which exceeds the limit of {limit}")]
  RegisterTooLarge {
    name: String,
    quantity: Quantity,
    limit: Quantity,
  },

  #[error("Register {name:?} at {address} with {quantity} words exceeds the address space")]
  AddressOverflow {
    name: String,
    address: Address,
    quantity: Quantity,
  },

  #[error("Registers {first:?} and {second:?} overlap")]
  OverlappingRegisters { first: String, second: String },

  #[error("Unknown register {0:?}")]
  UnknownRegister(String),
}

impl Values {
  /// Loads and validates a document from a file.
  ///
  /// Without a location the platform configuration directory is used.
  pub async fn from_file(location: Option<&Path>) -> Result<Self, ConfigError> {
    let raw = file::parse_file(location).await?;
    Self::parse(raw)
  }

  pub fn parse_str(raw: &str, format: file::Format) -> Result<Self, ConfigError> {
    let raw = file::parse_str(raw, format)?;
    Self::parse(raw)
  }

  pub fn parse(raw: file::Values) -> Result<Self, ConfigError> {
    let limits = parse_limits(raw.limits)?;
    let connection = parse_connection(raw.connection)?;

    let mut names = HashSet::new();
    let mut registers = Vec::with_capacity(raw.registers.len());
    for register in raw.registers {
      let register = parse_register(register, &limits)?;
      if !names.insert(register.name.clone()) {
        return Err(ConfigError::DuplicateName(register.name));
      }
      registers.push(register);
    }
    check_overlaps(&registers)?;

    Ok(Self {
      connection,
      registers,
      limits,
    })
  }

  pub fn register(&self, name: &str) -> Result<&Register, ConfigError> {
    self
      .registers
      .iter()
      .find(|register| register.name == name)
      .ok_or_else(|| ConfigError::UnknownRegister(name.to_owned()))
  }
}

impl FromStr for Values {
  type Err = ConfigError;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    Self::parse_str(raw, file::Format::Json)
  }
}

fn parse_limits(raw: file::Limits) -> Result<Limits, ConfigError> {
  let max_registers_per_read =
    raw.max_registers_per_read.unwrap_or(MAX_REGISTERS_PER_READ);
  if max_registers_per_read == 0
    || max_registers_per_read > MAX_REGISTERS_PER_READ
  {
    return Err(ConfigError::InvalidMaxRegisters(max_registers_per_read));
  }

  Ok(Limits {
    max_registers_per_read,
    min_request_interval: parse_duration(
      "min_request_interval",
      raw.min_request_interval.unwrap_or(0.1),
    )?,
    max_retries: raw.max_retries.unwrap_or(3),
    reconnect_delay: parse_duration(
      "reconnect_delay",
      raw.reconnect_delay.unwrap_or(5.0),
    )?,
  })
}

fn parse_connection(raw: file::Connection) -> Result<Connection, ConfigError> {
  let transport = match raw.kind.as_str() {
    "tcp" => Transport::Tcp {
      host: raw.host.ok_or(ConfigError::MissingHost)?,
      port: raw.port.unwrap_or(502),
    },
    "rtu" => {
      let parity = match raw.parity.as_deref().unwrap_or("N") {
        "N" => Parity::None,
        "E" => Parity::Even,
        "O" => Parity::Odd,
        other => return Err(ConfigError::InvalidParity(other.to_owned())),
      };
      let stop_bits = raw.stopbits.unwrap_or(1);
      if !matches!(stop_bits, 1 | 2) {
        return Err(ConfigError::InvalidStopBits(stop_bits));
      }
      let byte_size = raw.bytesize.unwrap_or(8);
      if !(5..=8).contains(&byte_size) {
        return Err(ConfigError::InvalidByteSize(byte_size));
      }

      Transport::Rtu(Serial {
        port_name: raw.port_name.ok_or(ConfigError::MissingPortName)?,
        baud_rate: raw.baudrate.unwrap_or(9600),
        parity,
        stop_bits,
        byte_size,
      })
    }
    other => return Err(ConfigError::UnknownConnectionType(other.to_owned())),
  };

  Ok(Connection {
    transport,
    timeout: parse_duration("timeout", raw.timeout.unwrap_or(3.0))?,
    retry_on_empty: raw.retry_on_empty.unwrap_or(true),
    retry_delay: parse_duration(
      "retry_delay",
      raw.retry_delay.unwrap_or(1.0),
    )?,
    device_id: raw.device_id.unwrap_or(1),
  })
}

fn parse_register(
  raw: file::Register,
  limits: &Limits,
) -> Result<Register, ConfigError> {
  let kind = match raw.kind.as_str() {
    "string" => match raw.length {
      Some(length) if length > 0 => RegisterKind::String { length },
      _ => return Err(ConfigError::MissingLength(raw.name)),
    },
    other => RegisterKind::from_name(other, raw.length).map_err(|_| {
      ConfigError::InvalidRegisterType {
        name: raw.name.clone(),
        kind: other.to_owned(),
      }
    })?,
  };

  let function_code = FunctionCode::try_from(raw.function_code.unwrap_or(3))
    .map_err(|code| ConfigError::InvalidFunctionCode {
      name: raw.name.clone(),
      code,
    })?;

  let order = match raw.byte_order.as_deref().unwrap_or("big") {
    "big" => WordOrder::Big,
    "little" => WordOrder::Little,
    other => {
      return Err(ConfigError::InvalidByteOrder {
        name: raw.name,
        order: other.to_owned(),
      })
    }
  };

  let scaling = Scaling {
    factor: raw.scale_factor,
    offset: raw.offset,
  };
  if !kind.is_numeric() && !scaling.is_identity() {
    return Err(ConfigError::ScaledString(raw.name));
  }

  let quantity = kind.quantity();
  if quantity > limits.max_registers_per_read {
    return Err(ConfigError::RegisterTooLarge {
      name: raw.name,
      quantity,
      limit: limits.max_registers_per_read,
    });
  }
  if raw.address as u32 + quantity as u32 > u16::MAX as u32 + 1 {
    return Err(ConfigError::AddressOverflow {
      name: raw.name,
      address: raw.address,
      quantity,
    });
  }

  let poll_interval = match raw.poll_interval {
    Some(seconds) if seconds > 0.0 => {
      Some(parse_duration(&format!("{}.poll_interval", raw.name), seconds)?)
    }
    Some(seconds) => {
      return Err(ConfigError::InvalidDuration {
        field: format!("{}.poll_interval", raw.name),
        value: seconds,
      })
    }
    None => None,
  };

  Ok(Register {
    name: raw.name,
    address: raw.address,
    kind,
    unit: raw.unit,
    function_code,
    poll_interval,
    description: raw.description,
    order,
    writable: raw.writable.unwrap_or(false),
    scaling,
  })
}

fn parse_duration(
  field: &str,
  seconds: f64,
) -> Result<chrono::Duration, ConfigError> {
  if !seconds.is_finite() || seconds < 0.0 {
    return Err(ConfigError::InvalidDuration {
      field: field.to_owned(),
      value: seconds,
    });
  }

  Ok(chrono::Duration::milliseconds((seconds * 1000.0).round() as i64))
}

fn check_overlaps(registers: &[Register]) -> Result<(), ConfigError> {
  let tables = registers
    .iter()
    .into_group_map_by(|register| register.function_code.table());

  for (_, mut registers) in tables {
    registers.sort_by_key(|register| register.address);
    let mut previous: Option<&Register> = None;
    for register in registers {
      if let Some(previous) = previous {
        let previous_end =
          previous.address as u32 + previous.kind.quantity() as u32;
        if (register.address as u32) < previous_end {
          return Err(ConfigError::OverlappingRegisters {
            first: previous.name.clone(),
            second: register.name.clone(),
          });
        }
      }
      previous = Some(register);
    }
  }

  Ok(())
}

/// Collects configuration from arguments, environment and file.
#[derive(Debug, Clone)]
pub struct Manager {
  from_args: args::Values,
  from_env: env::Values,
}

impl Manager {
  pub fn new() -> Self {
    Self {
      from_args: args::parse(),
      from_env: env::parse(),
    }
  }

  pub fn command(&self) -> &args::Command {
    &self.from_args.command
  }

  pub fn log_level(&self) -> tracing::level_filters::LevelFilter {
    if self.from_args.trace {
      return tracing::level_filters::LevelFilter::TRACE;
    }

    self
      .from_env
      .log_level
      .as_deref()
      .and_then(|level| {
        tracing::level_filters::LevelFilter::from_str(level).ok()
      })
      .unwrap_or({
        #[cfg(debug_assertions)]
        {
          tracing::level_filters::LevelFilter::DEBUG
        }
        #[cfg(not(debug_assertions))]
        {
          tracing::level_filters::LevelFilter::INFO
        }
      })
  }

  pub fn location(&self) -> Option<PathBuf> {
    self
      .from_args
      .config
      .as_ref()
      .or(self.from_env.config.as_ref())
      .map(PathBuf::from)
  }

  pub async fn values(&self) -> Result<Values, ConfigError> {
    Values::from_file(self.location().as_deref()).await
  }
}

impl Default for Manager {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use assert_matches::assert_matches;
  use rust_decimal_macros::dec;

  use super::*;

  const DOCUMENT: &str = r#"{
    "connection": { "type": "tcp", "host": "10.0.0.5" },
    "registers": [
      { "name": "temperature", "address": 100, "type": "int16",
        "scale_factor": 0.1, "poll_interval": 1.5, "unit": "C" },
      { "name": "energy", "address": 101, "type": "uint32",
        "byte_order": "little", "function_code": 4 },
      { "name": "serial", "address": 200, "type": "string", "length": 4 }
    ]
  }"#;

  fn document(edit: impl FnOnce(&mut serde_json::Value)) -> String {
    let mut value = serde_json::from_str::<serde_json::Value>(DOCUMENT)
      .expect("valid fixture");
    edit(&mut value);
    value.to_string()
  }

  #[test]
  fn applies_defaults() {
    let values = Values::from_str(DOCUMENT).unwrap();

    assert_eq!(
      values.connection.transport,
      Transport::Tcp {
        host: "10.0.0.5".to_owned(),
        port: 502
      }
    );
    assert_eq!(values.connection.timeout, chrono::Duration::seconds(3));
    assert!(values.connection.retry_on_empty);
    assert_eq!(values.connection.device_id, 1);
    assert_eq!(values.limits.max_registers_per_read, 125);
    assert_eq!(
      values.limits.min_request_interval,
      chrono::Duration::milliseconds(100)
    );
    assert_eq!(values.limits.max_retries, 3);

    let temperature = values.register("temperature").unwrap();
    assert_eq!(temperature.kind, RegisterKind::S16);
    assert_eq!(
      temperature.function_code,
      FunctionCode::ReadHoldingRegisters
    );
    assert_eq!(temperature.order, WordOrder::Big);
    assert_eq!(temperature.scaling.factor, Some(dec!(0.1)));
    assert_eq!(
      temperature.poll_interval,
      Some(chrono::Duration::milliseconds(1500))
    );
    assert!(!temperature.writable);

    let energy = values.register("energy").unwrap();
    assert_eq!(energy.order, WordOrder::Little);
    assert_eq!(energy.function_code, FunctionCode::ReadInputRegisters);
    assert_eq!(energy.poll_interval, None);

    let serial = values.register("serial").unwrap();
    assert_eq!(serial.kind, RegisterKind::String { length: 4 });
  }

  #[test]
  fn rejects_connection_errors() {
    let raw = document(|value| {
      value["connection"] = serde_json::json!({ "type": "udp" })
    });
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::UnknownConnectionType(kind)) if kind == "udp"
    );

    let raw = document(|value| {
      value["connection"] = serde_json::json!({ "type": "tcp" })
    });
    assert_matches!(Values::from_str(&raw), Err(ConfigError::MissingHost));

    let raw = document(|value| {
      value["connection"] = serde_json::json!({ "type": "rtu" })
    });
    assert_matches!(Values::from_str(&raw), Err(ConfigError::MissingPortName));

    let raw = document(|value| {
      value["connection"] = serde_json::json!({
        "type": "rtu", "port_name": "/dev/ttyUSB0", "parity": "X"
      })
    });
    assert_matches!(Values::from_str(&raw), Err(ConfigError::InvalidParity(_)));
  }

  #[test]
  fn rejects_register_errors() {
    let raw = document(|value| value["registers"][0]["type"] = "int64".into());
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::InvalidRegisterType { kind, .. }) if kind == "int64"
    );

    let raw = document(|value| {
      value["registers"][0]["function_code"] = 7.into()
    });
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::InvalidFunctionCode { code: 7, .. })
    );

    let raw = document(|value| {
      value["registers"][0]["byte_order"] = "middle".into()
    });
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::InvalidByteOrder { .. })
    );

    let raw = document(|value| {
      value["registers"][2]
        .as_object_mut()
        .expect("object")
        .remove("length");
    });
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::MissingLength(name)) if name == "serial"
    );

    let raw = document(|value| {
      value["registers"][1]["name"] = "temperature".into()
    });
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::DuplicateName(name)) if name == "temperature"
    );

    let raw = document(|value| {
      value["registers"][2]["scale_factor"] = 2.into()
    });
    assert_matches!(Values::from_str(&raw), Err(ConfigError::ScaledString(_)));

    let raw = document(|value| {
      value["registers"][0]["poll_interval"] = 0.into()
    });
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::InvalidDuration { .. })
    );

    let raw = document(|value| value["registers"][2]["address"] = 65534.into());
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::AddressOverflow { .. })
    );
  }

  #[test]
  fn rejects_invalid_limits() {
    let raw = document(|value| {
      value["limits"] = serde_json::json!({ "max_registers_per_read": 126 })
    });
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::InvalidMaxRegisters(126))
    );

    let raw = document(|value| {
      value["limits"] = serde_json::json!({ "max_registers_per_read": 2 })
    });
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::RegisterTooLarge { quantity: 4, limit: 2, .. })
    );
  }

  #[test]
  fn rejects_overlaps_within_a_table_only() {
    let raw = document(|value| value["registers"][2]["address"] = 101.into());
    assert_matches!(Values::from_str(&raw), Ok(_));

    let raw = document(|value| value["registers"][2]["address"] = 99.into());
    assert_matches!(
      Values::from_str(&raw),
      Err(ConfigError::OverlappingRegisters { first, second })
        if first == "serial" && second == "temperature"
    );
  }

  #[test]
  fn rejects_malformed_documents() {
    assert_matches!(
      Values::from_str("{ not json"),
      Err(ConfigError::Document(file::ParseError::DeserializationJson(_)))
    );

    let raw = document(|value| value["registers"][0]["address"] = (-1).into());
    assert_matches!(Values::from_str(&raw), Err(ConfigError::Document(_)));
  }

  #[test]
  fn parses_yaml_and_toml() {
    let yaml = r#"
connection:
  type: rtu
  port_name: /dev/ttyUSB0
  parity: E
registers:
  - name: voltage
    address: 0
    type: float32
"#;
    let values = Values::parse_str(yaml, file::Format::Yaml).unwrap();
    assert_matches!(
      values.connection.transport,
      Transport::Rtu(Serial { parity: Parity::Even, baud_rate: 9600, .. })
    );

    let toml = r#"
[connection]
type = "tcp"
host = "localhost"
port = 5020

[[registers]]
name = "voltage"
address = 0
type = "float32"

[limits]
max_registers_per_read = 10
"#;
    let values = Values::parse_str(toml, file::Format::Toml).unwrap();
    assert_eq!(values.limits.max_registers_per_read, 10);
    assert_matches!(
      values.connection.transport,
      Transport::Tcp { port: 5020, .. }
    );
  }

  #[test]
  fn looks_up_registers_by_name() {
    let values = Values::from_str(DOCUMENT).unwrap();
    assert_matches!(
      values.register("missing"),
      Err(ConfigError::UnknownRegister(name)) if name == "missing"
    );
  }
}
