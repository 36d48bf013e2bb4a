use std::fmt::Display;
use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio_modbus::{Address, Quantity};

use super::encoding::*;
use super::span::{Span, SpanParser};
use crate::config;

/// Data type of a register together with its on-wire footprint.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum RegisterKind {
  U16,
  S16,
  U32,
  S32,
  F32,
  String { length: Quantity },
}

/// A typed, user facing register value.
///
/// Float32 readings a [`Decimal`] cannot hold exactly, like `1e30` or
/// `1e-30`, are kept as [`Value::Float`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Number(Decimal),
  Float(f64),
  Text(String),
}

/// Linear transform between raw device values and engineering units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scaling {
  pub factor: Option<Decimal>,
  pub offset: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
  #[error("Expected {expected} words for {kind} but got {actual}")]
  WordCount {
    kind: RegisterKind,
    expected: usize,
    actual: usize,
  },

  #[error("Value {value} is out of range for {kind}")]
  OutOfRange { kind: RegisterKind, value: Decimal },

  #[error("Value {value} is not an integer as required by {kind}")]
  NotAnInteger { kind: RegisterKind, value: Decimal },

  #[error("Float {0} is not finite")]
  NonFinite(f64),

  #[error("Value {value} does not match register type {kind}")]
  Mismatch { kind: RegisterKind, value: Value },

  #[error("String {0:?} contains non ASCII characters")]
  NotAscii(String),

  #[error("Scaling {value} overflowed")]
  Overflow { value: Decimal },

  #[error("Unsupported register type {0:?}")]
  UnsupportedType(String),

  #[error("String registers require a length")]
  MissingLength,
}

impl RegisterKind {
  /// Parses a type name as used in configuration documents.
  pub fn from_name(
    name: &str,
    length: Option<Quantity>,
  ) -> Result<Self, ConversionError> {
    let kind = match name {
      "uint16" => RegisterKind::U16,
      "int16" => RegisterKind::S16,
      "uint32" => RegisterKind::U32,
      "int32" => RegisterKind::S32,
      "float32" => RegisterKind::F32,
      "string" => match length {
        Some(length) if length > 0 => RegisterKind::String { length },
        _ => return Err(ConversionError::MissingLength),
      },
      other => return Err(ConversionError::UnsupportedType(other.to_owned())),
    };

    Ok(kind)
  }

  pub fn name(&self) -> &'static str {
    match self {
      RegisterKind::U16 => "uint16",
      RegisterKind::S16 => "int16",
      RegisterKind::U32 => "uint32",
      RegisterKind::S32 => "int32",
      RegisterKind::F32 => "float32",
      RegisterKind::String { .. } => "string",
    }
  }

  /// Number of words the register occupies on the device.
  pub fn quantity(&self) -> Quantity {
    match self {
      RegisterKind::U16 => 1,
      RegisterKind::S16 => 1,
      RegisterKind::U32 => 2,
      RegisterKind::S32 => 2,
      RegisterKind::F32 => 2,
      RegisterKind::String { length } => *length,
    }
  }

  pub fn is_integer(&self) -> bool {
    matches!(
      self,
      RegisterKind::U16
        | RegisterKind::S16
        | RegisterKind::U32
        | RegisterKind::S32
    )
  }

  pub fn is_numeric(&self) -> bool {
    !matches!(self, RegisterKind::String { .. })
  }
}

impl Display for RegisterKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// Word count of a register type given by name.
pub fn word_count(
  name: &str,
  length: Option<Quantity>,
) -> Result<Quantity, ConversionError> {
  Ok(RegisterKind::from_name(name, length)?.quantity())
}

impl Value {
  pub fn as_number(&self) -> Option<Decimal> {
    match self {
      Value::Number(number) => Some(*number),
      Value::Float(float) => Decimal::from_f64(*float),
      Value::Text(_) => None,
    }
  }

  pub fn as_float(&self) -> Option<f64> {
    match self {
      Value::Number(number) => number.to_f64(),
      Value::Float(float) => Some(*float),
      Value::Text(_) => None,
    }
  }

  pub fn as_text(&self) -> Option<&str> {
    match self {
      Value::Text(text) => Some(text.as_str()),
      _ => None,
    }
  }

  pub fn to_json(&self) -> serde_json::Value {
    match self {
      Value::Number(number) => serde_json::json!(number),
      Value::Float(float) => serde_json::json!(float),
      Value::Text(text) => serde_json::json!(text),
    }
  }
}

impl Display for Value {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Value::Number(number) => Display::fmt(&number.normalize(), f),
      Value::Float(float) => Display::fmt(float, f),
      Value::Text(text) => std::fmt::Debug::fmt(text, f),
    }
  }
}

impl FromStr for Value {
  type Err = std::convert::Infallible;

  fn from_str(string: &str) -> Result<Self, Self::Err> {
    Ok(match Decimal::from_str(string) {
      Ok(number) => Value::Number(number),
      Err(_) => Value::Text(string.to_owned()),
    })
  }
}

macro_rules! impl_from_number {
  ($($type: ty),*) => {
    $(
      impl From<$type> for Value {
        fn from(value: $type) -> Self {
          Value::Number(Decimal::from(value))
        }
      }
    )*
  };
}

impl_from_number!(u16, i16, u32, i32, i64);

impl From<Decimal> for Value {
  fn from(value: Decimal) -> Self {
    Value::Number(value)
  }
}

impl From<&str> for Value {
  fn from(value: &str) -> Self {
    Value::Text(value.to_owned())
  }
}

impl From<String> for Value {
  fn from(value: String) -> Self {
    Value::Text(value)
  }
}

impl Scaling {
  pub fn is_identity(&self) -> bool {
    self.factor.is_none() && self.offset.is_none()
  }

  /// Raw device value to engineering units.
  pub fn apply(&self, raw: Decimal) -> Result<Decimal, ConversionError> {
    let mut value = raw;
    if let Some(factor) = self.factor {
      value = value
        .checked_mul(factor)
        .ok_or(ConversionError::Overflow { value: raw })?;
    }
    if let Some(offset) = self.offset {
      value = value
        .checked_add(offset)
        .ok_or(ConversionError::Overflow { value: raw })?;
    }

    Ok(value)
  }

  /// Engineering units back to the raw device value.
  ///
  /// Callers must reject a zero factor beforehand.
  pub fn invert(&self, value: Decimal) -> Result<Decimal, ConversionError> {
    let mut raw = value;
    if let Some(offset) = self.offset {
      raw = raw
        .checked_sub(offset)
        .ok_or(ConversionError::Overflow { value })?;
    }
    if let Some(factor) = self.factor {
      raw = raw
        .checked_div(factor)
        .ok_or(ConversionError::Overflow { value })?;
    }

    Ok(raw)
  }

  /// [`Scaling::apply`] for values outside the decimal range.
  pub fn apply_float(&self, raw: f64) -> Result<f64, ConversionError> {
    let factor = self.factor.and_then(|factor| factor.to_f64()).unwrap_or(1.0);
    let offset = self.offset.and_then(|offset| offset.to_f64()).unwrap_or(0.0);
    finite(raw * factor + offset)
  }

  /// [`Scaling::invert`] for values outside the decimal range.
  pub fn invert_float(&self, value: f64) -> Result<f64, ConversionError> {
    let factor = self.factor.and_then(|factor| factor.to_f64()).unwrap_or(1.0);
    let offset = self.offset.and_then(|offset| offset.to_f64()).unwrap_or(0.0);
    finite((value - offset) / factor)
  }
}

fn finite(value: f64) -> Result<f64, ConversionError> {
  if value.is_finite() {
    Ok(value)
  } else {
    Err(ConversionError::NonFinite(value))
  }
}

/// Decodes exactly `kind.quantity()` words into a value.
pub fn decode(
  words: &[u16],
  kind: RegisterKind,
  order: WordOrder,
) -> Result<Value, ConversionError> {
  let expected = kind.quantity() as usize;
  if words.len() != expected {
    return Err(ConversionError::WordCount {
      kind,
      expected,
      actual: words.len(),
    });
  }

  let value = match kind {
    RegisterKind::U16 => Value::from(words[0]),
    RegisterKind::S16 => Value::from(words[0] as i16),
    RegisterKind::U32 => Value::from(join_words([words[0], words[1]], order)),
    RegisterKind::S32 => {
      Value::from(join_words([words[0], words[1]], order) as i32)
    }
    RegisterKind::F32 => {
      let float = f32::from_bits(join_words([words[0], words[1]], order));
      let float = finite(float as f64)? as f32;
      match Decimal::from_f32(float)
        .filter(|number| number.to_f32() == Some(float))
      {
        Some(number) => Value::Number(number),
        None => Value::Float(float as f64),
      }
    }
    RegisterKind::String { .. } => {
      let text = decode_string_bytes(words.iter().cloned())
        .into_iter()
        .filter(u8::is_ascii)
        .map(char::from)
        .collect::<String>();
      Value::Text(text.trim_end_matches(['\0', ' ']).to_owned())
    }
  };

  Ok(value)
}

/// Encodes a value into exactly `kind.quantity()` words.
pub fn encode(
  value: &Value,
  kind: RegisterKind,
  order: WordOrder,
) -> Result<Vec<u16>, ConversionError> {
  match (kind, value) {
    (RegisterKind::String { length }, Value::Text(text)) => {
      if !text.is_ascii() {
        return Err(ConversionError::NotAscii(text.clone()));
      }

      let target = length as usize * 2;
      let bytes = text
        .bytes()
        .chain(std::iter::repeat(b' '))
        .take(target)
        .collect::<Vec<_>>();
      Ok(encode_string_bytes(bytes))
    }
    (RegisterKind::F32, Value::Number(number)) => {
      let float = number.to_f32().ok_or(ConversionError::OutOfRange {
        kind,
        value: *number,
      })?;
      Ok(split_words(float.to_bits(), order).to_vec())
    }
    (RegisterKind::F32, Value::Float(float)) => {
      let single = finite(*float as f32 as f64)? as f32;
      Ok(split_words(single.to_bits(), order).to_vec())
    }
    (kind, Value::Number(number)) if kind.is_integer() => {
      if !number.fract().is_zero() {
        return Err(ConversionError::NotAnInteger {
          kind,
          value: *number,
        });
      }
      let out_of_range = || ConversionError::OutOfRange {
        kind,
        value: *number,
      };
      let integer = number.to_i64().ok_or_else(out_of_range)?;

      let words = match kind {
        RegisterKind::U16 => vec![u16::try_from(integer)
          .map_err(|_| out_of_range())?],
        RegisterKind::S16 => vec![i16::try_from(integer)
          .map_err(|_| out_of_range())?
          as u16],
        RegisterKind::U32 => split_words(
          u32::try_from(integer).map_err(|_| out_of_range())?,
          order,
        )
        .to_vec(),
        _ => split_words(
          i32::try_from(integer).map_err(|_| out_of_range())? as u32,
          order,
        )
        .to_vec(),
      };

      Ok(words)
    }
    (kind, value) => Err(ConversionError::Mismatch {
      kind,
      value: value.clone(),
    }),
  }
}

impl Span for config::Register {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.kind.quantity()
  }
}

impl SpanParser<Value> for config::Register {
  type Error = ConversionError;

  fn parse(&self, data: &[u16]) -> Result<Value, Self::Error> {
    let value = decode(data, self.kind, self.order)?;
    match value {
      Value::Number(raw) if !self.scaling.is_identity() => {
        Ok(Value::Number(self.scaling.apply(raw)?))
      }
      Value::Float(raw) if !self.scaling.is_identity() => {
        Ok(Value::Float(self.scaling.apply_float(raw)?))
      }
      value => Ok(value),
    }
  }
}
