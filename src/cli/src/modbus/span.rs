use tokio_modbus::{Address, Quantity};

/// A contiguous run of words in the device address space.
pub trait Span {
  fn address(&self) -> Address;

  fn quantity(&self) -> Quantity;

  /// First address past the end of the span.
  fn end(&self) -> u32 {
    self.address() as u32 + self.quantity() as u32
  }
}

/// Turns the words covered by a span into a typed value.
pub trait SpanParser<TParsed>: Span {
  type Error;

  fn parse(&self, data: &[u16]) -> Result<TParsed, Self::Error>;
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SimpleSpan {
  pub address: Address,
  pub quantity: Quantity,
}

impl Span for SimpleSpan {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.quantity
  }
}

impl<TSpan: Span> Span for &TSpan {
  fn address(&self) -> Address {
    (*self).address()
  }

  fn quantity(&self) -> Quantity {
    (*self).quantity()
  }
}

impl<TParsed, TSpanParser: SpanParser<TParsed>> SpanParser<TParsed>
  for &TSpanParser
{
  type Error = TSpanParser::Error;

  fn parse(&self, data: &[u16]) -> Result<TParsed, Self::Error> {
    (*self).parse(data)
  }
}
