use itertools::Itertools;

/// Order of the two words of a 32-bit value on the wire.
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq)]
pub enum WordOrder {
  /// High word first.
  #[default]
  Big,
  /// Low word first.
  Little,
}

impl std::fmt::Display for WordOrder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WordOrder::Big => f.write_str("big"),
      WordOrder::Little => f.write_str("little"),
    }
  }
}

pub(crate) fn join_words(words: [u16; 2], order: WordOrder) -> u32 {
  let [first, second] = words;
  match order {
    WordOrder::Big => ((first as u32) << 16) | second as u32,
    WordOrder::Little => ((second as u32) << 16) | first as u32,
  }
}

pub(crate) fn split_words(value: u32, order: WordOrder) -> [u16; 2] {
  let high = (value >> 16) as u16;
  let low = (value & 0xFFFF) as u16;
  match order {
    WordOrder::Big => [high, low],
    WordOrder::Little => [low, high],
  }
}

pub(crate) fn decode_string_bytes<TIntoIterator>(data: TIntoIterator) -> Vec<u8>
where
  TIntoIterator: IntoIterator<Item = u16>,
{
  data
    .into_iter()
    .flat_map(|value| [(value >> 8) as u8, (value & 0xFF) as u8])
    .collect()
}

pub(crate) fn encode_string_bytes<TIntoIterator>(
  data: TIntoIterator,
) -> Vec<u16>
where
  TIntoIterator: IntoIterator<Item = u8>,
{
  data
    .into_iter()
    .chunks(2)
    .into_iter()
    .map(|mut chunk| {
      let first = chunk.next().unwrap_or(b' ');
      let second = chunk.next().unwrap_or(b' ');
      u16::from_be_bytes([first, second])
    })
    .collect()
}
