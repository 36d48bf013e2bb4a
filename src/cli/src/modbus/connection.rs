use futures_time::future::FutureExt;
use tokio::net::TcpStream;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, SlaveContext, Writer};
use tokio_modbus::{Address, Quantity, Slave};

use crate::config;

pub type Response = Vec<u16>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error("Transport is not connected")]
  NotConnected,

  #[error("Request timed out")]
  Timeout(#[source] std::io::Error),

  #[error("Failed resolving {0:?}")]
  Resolve(String),

  #[error("Failed opening serial port")]
  Serial(#[from] tokio_serial::Error),

  #[error("Request failed")]
  Io(#[from] std::io::Error),
}

/// Frames and transmits Modbus requests for the engine.
///
/// Implementations report failures as [`TransportError`] and never retry
/// on their own beyond what their configuration asks for.
#[async_trait::async_trait]
pub trait Transport: Send + std::fmt::Debug {
  /// Opens the link and reports whether it is usable afterwards.
  async fn connect(&mut self) -> Result<bool, TransportError>;

  async fn close(&mut self);

  fn is_connected(&self) -> bool;

  async fn read_holding_registers(
    &mut self,
    address: Address,
    quantity: Quantity,
    device: u8,
  ) -> Result<Response, TransportError>;

  async fn read_input_registers(
    &mut self,
    address: Address,
    quantity: Quantity,
    device: u8,
  ) -> Result<Response, TransportError>;

  async fn write_register(
    &mut self,
    address: Address,
    value: u16,
    device: u8,
  ) -> Result<(), TransportError>;

  async fn write_registers(
    &mut self,
    address: Address,
    values: &[u16],
    device: u8,
  ) -> Result<(), TransportError>;
}

/// Transport over TCP or a serial line backed by `tokio-modbus`.
#[derive(Debug)]
pub struct Connection {
  transport: config::Transport,
  timeout: futures_time::time::Duration,
  retry_on_empty: bool,
  retry_delay: tokio::time::Duration,
  device: u8,
  ctx: Option<Context>,
}

#[derive(Clone, Copy, Debug)]
enum Table {
  Holding,
  Input,
}

impl Connection {
  pub fn new(config: &config::Connection) -> Self {
    Self {
      transport: config.transport.clone(),
      timeout: timeout_from_chrono(config.timeout),
      retry_on_empty: config.retry_on_empty,
      retry_delay: delay_from_chrono(config.retry_delay),
      device: config.device_id,
      ctx: None,
    }
  }

  async fn attach(&mut self) -> Result<Context, TransportError> {
    let slave = Slave(self.device);
    let ctx = match &self.transport {
      config::Transport::Tcp { host, port } => {
        let endpoint = format!("{host}:{port}");
        let socket = tokio::net::lookup_host(endpoint.as_str())
          .await?
          .next()
          .ok_or_else(|| TransportError::Resolve(endpoint.clone()))?;
        let stream = flatten_result(
          TcpStream::connect(socket).timeout(self.timeout).await,
        )
        .map_err(TransportError::Io)?;
        tokio_modbus::client::tcp::attach_slave(stream, slave)
      }
      config::Transport::Rtu(serial) => {
        let builder = serial_port_builder(serial);
        let stream = tokio_serial::SerialStream::open(&builder)?;
        tokio_modbus::client::rtu::attach_slave(stream, slave)
      }
    };

    Ok(ctx)
  }

  fn context(&mut self, device: u8) -> Result<&mut Context, TransportError> {
    let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
    ctx.set_slave(Slave(device));
    Ok(ctx)
  }

  fn finish<T>(
    &mut self,
    result: Result<std::io::Result<T>, std::io::Error>,
  ) -> Result<T, TransportError> {
    let error = match result {
      Ok(Ok(response)) => return Ok(response),
      Ok(Err(error)) if is_broken_link(&error) => TransportError::Io(error),
      Ok(Err(error)) => return Err(TransportError::Io(error)),
      Err(error) => TransportError::Timeout(error),
    };

    // NOTE: a late or partial frame would be read as the next response
    tracing::debug!("Dropping modbus context after {}", error);
    self.ctx = None;

    Err(error)
  }

  async fn read_once(
    &mut self,
    table: Table,
    address: Address,
    quantity: Quantity,
    device: u8,
  ) -> Result<Response, TransportError> {
    let timeout = self.timeout;
    let ctx = self.context(device)?;
    let result = match table {
      Table::Holding => {
        ctx
          .read_holding_registers(address, quantity)
          .timeout(timeout)
          .await
      }
      Table::Input => {
        ctx
          .read_input_registers(address, quantity)
          .timeout(timeout)
          .await
      }
    };

    self.finish(result)
  }

  #[tracing::instrument(skip(self))]
  async fn read(
    &mut self,
    table: Table,
    address: Address,
    quantity: Quantity,
    device: u8,
  ) -> Result<Response, TransportError> {
    let response = self.read_once(table, address, quantity, device).await?;
    if !response.is_empty() || !self.retry_on_empty {
      return Ok(response);
    }

    tracing::debug!("Empty response, retrying once");
    tokio::time::sleep(self.retry_delay).await;
    self.read_once(table, address, quantity, device).await
  }
}

#[async_trait::async_trait]
impl Transport for Connection {
  #[tracing::instrument(skip(self))]
  async fn connect(&mut self) -> Result<bool, TransportError> {
    if self.ctx.is_none() {
      self.ctx = Some(self.attach().await?);
      tracing::debug!("Attached to {:?}", self.transport);
    }

    Ok(self.ctx.is_some())
  }

  #[tracing::instrument(skip(self))]
  async fn close(&mut self) {
    if let Some(mut ctx) = self.ctx.take() {
      if let Err(error) = ctx.disconnect().await {
        tracing::debug!("Failed disconnecting cleanly {}", error);
      }
    }
  }

  fn is_connected(&self) -> bool {
    self.ctx.is_some()
  }

  async fn read_holding_registers(
    &mut self,
    address: Address,
    quantity: Quantity,
    device: u8,
  ) -> Result<Response, TransportError> {
    self.read(Table::Holding, address, quantity, device).await
  }

  async fn read_input_registers(
    &mut self,
    address: Address,
    quantity: Quantity,
    device: u8,
  ) -> Result<Response, TransportError> {
    self.read(Table::Input, address, quantity, device).await
  }

  #[tracing::instrument(skip(self))]
  async fn write_register(
    &mut self,
    address: Address,
    value: u16,
    device: u8,
  ) -> Result<(), TransportError> {
    let timeout = self.timeout;
    let ctx = self.context(device)?;
    let result = ctx
      .write_single_register(address, value)
      .timeout(timeout)
      .await;

    self.finish(result)
  }

  #[tracing::instrument(skip(self))]
  async fn write_registers(
    &mut self,
    address: Address,
    values: &[u16],
    device: u8,
  ) -> Result<(), TransportError> {
    let timeout = self.timeout;
    let ctx = self.context(device)?;
    let result = ctx
      .write_multiple_registers(address, values)
      .timeout(timeout)
      .await;

    self.finish(result)
  }
}

fn serial_port_builder(serial: &config::Serial) -> tokio_serial::SerialPortBuilder {
  let parity = match serial.parity {
    config::Parity::None => tokio_serial::Parity::None,
    config::Parity::Even => tokio_serial::Parity::Even,
    config::Parity::Odd => tokio_serial::Parity::Odd,
  };
  let stop_bits = match serial.stop_bits {
    2 => tokio_serial::StopBits::Two,
    _ => tokio_serial::StopBits::One,
  };
  let data_bits = match serial.byte_size {
    5 => tokio_serial::DataBits::Five,
    6 => tokio_serial::DataBits::Six,
    7 => tokio_serial::DataBits::Seven,
    _ => tokio_serial::DataBits::Eight,
  };

  tokio_serial::new(serial.port_name.as_str(), serial.baud_rate)
    .parity(parity)
    .stop_bits(stop_bits)
    .data_bits(data_bits)
    .flow_control(tokio_serial::FlowControl::None)
}

fn is_broken_link(error: &std::io::Error) -> bool {
  matches!(
    error.kind(),
    std::io::ErrorKind::BrokenPipe
      | std::io::ErrorKind::ConnectionReset
      | std::io::ErrorKind::ConnectionAborted
      | std::io::ErrorKind::NotConnected
      | std::io::ErrorKind::UnexpectedEof
  )
}

fn timeout_from_chrono(
  timeout: chrono::Duration,
) -> futures_time::time::Duration {
  futures_time::time::Duration::from_millis(timeout.num_milliseconds() as u64)
}

pub(crate) fn delay_from_chrono(delay: chrono::Duration) -> tokio::time::Duration {
  tokio::time::Duration::from_millis(delay.num_milliseconds() as u64)
}

fn flatten_result<T, E1, E2>(result: Result<Result<T, E1>, E2>) -> Result<T, E1>
where
  E1: From<E2>,
{
  result?
}
