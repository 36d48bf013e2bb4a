use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// NOTE: everything optional here gets its default in the parent module

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
  #[serde(rename = "type")]
  pub kind: String,
  pub host: Option<String>,
  pub port: Option<u16>,
  pub timeout: Option<f64>,
  pub retry_on_empty: Option<bool>,
  pub retry_delay: Option<f64>,
  pub device_id: Option<u8>,
  pub port_name: Option<String>,
  pub baudrate: Option<u32>,
  pub parity: Option<String>,
  pub stopbits: Option<u8>,
  pub bytesize: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
  pub name: String,
  pub address: u16,
  #[serde(rename = "type")]
  pub kind: String,
  pub unit: Option<String>,
  pub function_code: Option<u8>,
  pub poll_interval: Option<f64>,
  pub description: Option<String>,
  pub length: Option<u16>,
  pub byte_order: Option<String>,
  pub writable: Option<bool>,
  pub scale_factor: Option<Decimal>,
  pub offset: Option<Decimal>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
  pub max_registers_per_read: Option<u16>,
  pub min_request_interval: Option<f64>,
  pub max_retries: Option<u32>,
  pub reconnect_delay: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Values {
  pub connection: Connection,
  pub registers: Vec<Register>,
  #[serde(default)]
  pub limits: Limits,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Format {
  Json,
  Yaml,
  Toml,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
  #[error("Failed creating project directories")]
  MissingProjectDirs,

  #[error("Failed reading config file {0:?}")]
  Read(PathBuf, #[source] std::io::Error),

  #[error("Config file is missing an extension")]
  MissingExtension,

  #[error("Config file has invalid extension {0:?}")]
  InvalidExtension(String),

  #[error("Failed deserializing config from yaml")]
  DeserializationYaml(#[from] serde_yaml::Error),

  #[error("Failed deserializing config from toml")]
  DeserializationToml(#[from] toml::de::Error),

  #[error("Failed deserializing config from json")]
  DeserializationJson(#[from] serde_json::Error),
}

impl Format {
  pub fn from_path(path: &Path) -> Result<Self, ParseError> {
    match path.extension().and_then(|str| str.to_str()) {
      None => Err(ParseError::MissingExtension),
      Some("yaml" | "yml") => Ok(Format::Yaml),
      Some("toml") => Ok(Format::Toml),
      Some("json") => Ok(Format::Json),
      Some(other) => Err(ParseError::InvalidExtension(other.to_owned())),
    }
  }
}

pub fn default_location() -> Result<PathBuf, ParseError> {
  match directories::ProjectDirs::from("com", "regmap", "regmap") {
    Some(project_dirs) => Ok(project_dirs.config_dir().join("config.json")),
    None => Err(ParseError::MissingProjectDirs),
  }
}

pub fn parse_str(raw: &str, format: Format) -> Result<Values, ParseError> {
  let values = match format {
    Format::Json => serde_json::from_str::<Values>(raw)?,
    Format::Yaml => serde_yaml::from_str::<Values>(raw)?,
    Format::Toml => toml::from_str::<Values>(raw)?,
  };

  Ok(values)
}

pub async fn parse_file(location: Option<&Path>) -> Result<Values, ParseError> {
  let location = match location {
    Some(location) => location.to_path_buf(),
    None => default_location()?,
  };

  let format = Format::from_path(&location)?;
  let raw = tokio::fs::read_to_string(&location)
    .await
    .map_err(|error| ParseError::Read(location.clone(), error))?;

  parse_str(raw.as_str(), format)
}
