use tokio_modbus::{Address, Quantity};

use super::span::Span;

/// Words written to consecutive registers in one transaction.
pub trait Record: Span {
  fn values(&self) -> &[u16];

  /// Whether a single register write carries the whole record.
  fn is_single(&self) -> bool {
    self.quantity() == 1
  }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct WriteRecord {
  pub address: Address,
  pub values: Vec<u16>,
}

impl Span for WriteRecord {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.values.len() as Quantity
  }
}

impl Record for WriteRecord {
  fn values(&self) -> &[u16] {
    &self.values
  }
}
