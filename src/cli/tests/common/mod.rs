#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use regmap::config;
use regmap::modbus::{Transport, TransportError};
use tokio_modbus::{Address, Quantity};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Table {
  Holding,
  Input,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Request {
  Read {
    table: Table,
    address: Address,
    quantity: Quantity,
  },
  Write {
    address: Address,
    values: Vec<u16>,
  },
}

#[derive(Debug, Default)]
pub struct State {
  pub connected: bool,
  pub refuse_connect: bool,
  pub fail_requests: bool,
  pub truncate_reads: bool,
  pub connects: usize,
  pub closes: usize,
  pub holding: HashMap<Address, u16>,
  pub input: HashMap<Address, u16>,
  /// Values handed out by successive reads of a holding address.
  pub scripted: HashMap<Address, VecDeque<u16>>,
  pub requests: Vec<Request>,
  /// When each recorded request reached the device.
  pub times: Vec<tokio::time::Instant>,
}

/// In-memory device shared between the engine and the test.
#[derive(Debug, Clone, Default)]
pub struct Device {
  state: Arc<Mutex<State>>,
}

impl Device {
  pub fn state(&self) -> std::sync::MutexGuard<'_, State> {
    self.state.lock().unwrap()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.state().requests.clone()
  }

  pub fn script(&self, address: Address, values: impl IntoIterator<Item = u16>) {
    self
      .state()
      .scripted
      .insert(address, values.into_iter().collect());
  }

  fn read(
    &self,
    table: Table,
    address: Address,
    quantity: Quantity,
  ) -> Result<Vec<u16>, TransportError> {
    let mut state = self.state();
    if !state.connected {
      return Err(TransportError::NotConnected);
    }
    if state.fail_requests {
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "device exception",
      )));
    }
    state.times.push(tokio::time::Instant::now());
    state.requests.push(Request::Read {
      table,
      address,
      quantity,
    });

    let mut words = Vec::new();
    for address in address..address + quantity {
      let word = match table {
        Table::Holding => {
          let scripted = state
            .scripted
            .get_mut(&address)
            .and_then(|values| {
              if values.len() > 1 {
                values.pop_front()
              } else {
                values.front().copied()
              }
            });
          match scripted {
            Some(word) => word,
            None => state.holding.get(&address).copied().unwrap_or_default(),
          }
        }
        Table::Input => state.input.get(&address).copied().unwrap_or_default(),
      };
      words.push(word);
    }
    if state.truncate_reads {
      words.pop();
    }

    Ok(words)
  }

  fn write(
    &self,
    address: Address,
    values: &[u16],
  ) -> Result<(), TransportError> {
    let mut state = self.state();
    if !state.connected {
      return Err(TransportError::NotConnected);
    }
    if state.fail_requests {
      return Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "device exception",
      )));
    }
    state.times.push(tokio::time::Instant::now());
    state.requests.push(Request::Write {
      address,
      values: values.to_vec(),
    });
    for (offset, value) in values.iter().enumerate() {
      state.holding.insert(address + offset as Address, *value);
    }

    Ok(())
  }
}

#[async_trait::async_trait]
impl Transport for Device {
  async fn connect(&mut self) -> Result<bool, TransportError> {
    let mut state = self.state();
    state.connects += 1;
    state.connected = !state.refuse_connect;
    Ok(state.connected)
  }

  async fn close(&mut self) {
    let mut state = self.state();
    state.closes += 1;
    state.connected = false;
  }

  fn is_connected(&self) -> bool {
    self.state().connected
  }

  async fn read_holding_registers(
    &mut self,
    address: Address,
    quantity: Quantity,
    _device: u8,
  ) -> Result<Vec<u16>, TransportError> {
    self.read(Table::Holding, address, quantity)
  }

  async fn read_input_registers(
    &mut self,
    address: Address,
    quantity: Quantity,
    _device: u8,
  ) -> Result<Vec<u16>, TransportError> {
    self.read(Table::Input, address, quantity)
  }

  async fn write_register(
    &mut self,
    address: Address,
    value: u16,
    _device: u8,
  ) -> Result<(), TransportError> {
    self.write(address, &[value])
  }

  async fn write_registers(
    &mut self,
    address: Address,
    values: &[u16],
    _device: u8,
  ) -> Result<(), TransportError> {
    self.write(address, values)
  }
}

/// Parses a document with a tcp connection, no request spacing and the
/// given registers.
pub fn values(registers: serde_json::Value) -> config::Values {
  let document = serde_json::json!({
    "connection": { "type": "tcp", "host": "127.0.0.1" },
    "registers": registers,
    "limits": { "min_request_interval": 0 }
  });
  document.to_string().parse().unwrap()
}
