use tokio_modbus::{Address, Quantity};

use super::span::*;

/// Consecutive spans read with a single transaction.
#[derive(Clone, Debug)]
pub struct Batch<TSpan: Span> {
  pub address: Address,
  pub quantity: Quantity,
  pub spans: Vec<TSpan>,
}

impl<TSpan: Span> Span for Batch<TSpan> {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.quantity
  }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchParseError<E: std::error::Error + 'static> {
  #[error("Expected {expected} words in response but got {actual}")]
  Truncated { expected: usize, actual: usize },

  #[error("Failed parsing span at address {address}")]
  Span {
    address: Address,
    #[source]
    source: E,
  },
}

impl<TSpan: Span> Batch<TSpan> {
  /// Slices the batch response into per span parts and parses each of them.
  pub fn parse<TParsed>(
    &self,
    data: &[u16],
  ) -> Result<Vec<TParsed>, BatchParseError<<TSpan as SpanParser<TParsed>>::Error>>
  where
    TSpan: SpanParser<TParsed>,
    <TSpan as SpanParser<TParsed>>::Error: std::error::Error + 'static,
  {
    if data.len() < self.quantity as usize {
      return Err(BatchParseError::Truncated {
        expected: self.quantity as usize,
        actual: data.len(),
      });
    }

    let mut parsed = Vec::with_capacity(self.spans.len());
    for span in &self.spans {
      let start = (span.address() - self.address) as usize;
      let end = start + span.quantity() as usize;
      let value = span.parse(&data[start..end]).map_err(|source| {
        BatchParseError::Span {
          address: span.address(),
          source,
        }
      })?;
      parsed.push(value);
    }

    Ok(parsed)
  }
}

/// Groups spans into batches of strictly consecutive spans.
///
/// Spans are sorted by address and walked once. A span joins the current
/// batch only when it starts exactly where the batch ends and the grown
/// batch still fits in `max_quantity` words. Anything else closes the batch.
pub fn batch_spans<TSpan: Span, TIntoIterator: IntoIterator<Item = TSpan>>(
  spans: TIntoIterator,
  max_quantity: Quantity,
) -> Vec<Batch<TSpan>> {
  let mut spans = spans.into_iter().collect::<Vec<_>>();
  spans.sort_by_key(|span| span.address());

  let mut iter = spans.into_iter();
  let first = match iter.by_ref().next() {
    Some(first) => first,
    None => return Vec::new(),
  };
  let mut batches = Vec::new();
  let mut current = Batch::<TSpan> {
    address: first.address(),
    quantity: first.quantity(),
    spans: vec![first],
  };

  for span in iter {
    let end = current.end();
    let total = span.end() - current.address as u32;
    if span.address() as u32 == end && total <= max_quantity as u32 {
      current.quantity = total as Quantity;
      current.spans.push(span);
    } else {
      batches.push(current);
      current = Batch::<TSpan> {
        address: span.address(),
        quantity: span.quantity(),
        spans: vec![span],
      }
    }
  }
  batches.push(current);

  batches
}

#[cfg(test)]
mod tests {
  use super::*;

  fn span(address: Address, quantity: Quantity) -> SimpleSpan {
    SimpleSpan { address, quantity }
  }

  fn assert_well_formed(
    input: &[SimpleSpan],
    batches: &[Batch<SimpleSpan>],
    max_quantity: Quantity,
  ) {
    let mut seen = batches
      .iter()
      .flat_map(|batch| batch.spans.iter().cloned())
      .collect::<Vec<_>>();
    let mut expected = input.to_vec();
    seen.sort_by_key(|span| (span.address, span.quantity));
    expected.sort_by_key(|span| (span.address, span.quantity));
    assert_eq!(seen, expected);

    for batch in batches {
      let first = batch.spans[0];
      assert_eq!(batch.address, first.address);
      let mut end = first.end();
      for span in batch.spans.iter().skip(1) {
        assert_eq!(span.address as u32, end);
        end = span.end();
      }
      assert_eq!(batch.end(), end);
      if batch.spans.len() > 1 {
        assert!(batch.quantity <= max_quantity);
      }
    }
  }

  #[test]
  fn merges_contiguous_spans_into_one_batch() {
    let batches = batch_spans(vec![span(102, 2), span(100, 1), span(101, 1)], 125);

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].address, 100);
    assert_eq!(batches[0].quantity, 4);
    assert_eq!(
      batches[0].spans.iter().map(|span| span.address).collect::<Vec<_>>(),
      vec![100, 101, 102]
    );
  }

  #[test]
  fn splits_on_gap() {
    let batches = batch_spans(vec![span(0, 1), span(2, 1), span(3, 2)], 125);

    assert_eq!(batches.len(), 2);
    assert_eq!((batches[0].address, batches[0].quantity), (0, 1));
    assert_eq!((batches[1].address, batches[1].quantity), (2, 3));
  }

  #[test]
  fn splits_when_limit_would_be_exceeded() {
    let batches = batch_spans(vec![span(0, 2), span(2, 2), span(4, 2)], 4);

    assert_eq!(batches.len(), 2);
    assert_eq!((batches[0].address, batches[0].quantity), (0, 4));
    assert_eq!((batches[1].address, batches[1].quantity), (4, 2));
  }

  #[test]
  fn empty_input_gives_no_batches() {
    assert!(batch_spans(Vec::<SimpleSpan>::new(), 125).is_empty());
  }

  #[test]
  fn partitions_every_layout() {
    for max_quantity in [1u16, 2, 3, 5, 8, 125] {
      for seed in 0u32..64 {
        let mut address = 0u16;
        let mut input = Vec::new();
        for step in 0..12u32 {
          let bits = seed.rotate_left(step) ^ (step * 7);
          let gap = (bits % 3) as u16;
          let quantity = 1 + (bits % 2) as u16;
          address += gap;
          input.push(span(address, quantity));
          address += quantity;
        }

        let batches = batch_spans(input.clone(), max_quantity);
        assert_well_formed(&input, &batches, max_quantity);
      }
    }
  }

  #[test]
  fn parses_each_span_from_its_offset() {
    struct Word(SimpleSpan);

    impl Span for Word {
      fn address(&self) -> Address {
        self.0.address
      }

      fn quantity(&self) -> Quantity {
        self.0.quantity
      }
    }

    impl SpanParser<Vec<u16>> for Word {
      type Error = std::fmt::Error;

      fn parse(&self, data: &[u16]) -> Result<Vec<u16>, Self::Error> {
        Ok(data.to_vec())
      }
    }

    let batches =
      batch_spans(vec![Word(span(10, 1)), Word(span(11, 2))], 125);
    let parsed: Vec<Vec<u16>> = batches[0].parse(&[1, 2, 3]).unwrap();
    assert_eq!(parsed, vec![vec![1], vec![2, 3]]);

    let truncated = batches[0].parse::<Vec<u16>>(&[1, 2]);
    assert!(matches!(
      truncated,
      Err(BatchParseError::Truncated {
        expected: 3,
        actual: 2
      })
    ));
  }
}
