use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use itertools::Itertools;
use rust_decimal::RoundingStrategy;
use tokio::sync::Mutex;
use tokio_modbus::{Address, Quantity};

use crate::config::{self, ConfigError, FunctionCode};
use crate::error::Error;

use super::batch::*;
use super::connection::{Connection, Transport, TransportError};
use super::gate::Gate;
use super::monitor;
use super::observer::*;
use super::record::*;
use super::register::*;
use super::span::*;

/// Last known value of a register.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
  pub value: Value,
  /// Time of the last successful read, absent when only written so far.
  pub read_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
  #[error("Transport failed connecting")]
  Transport(#[from] TransportError),

  #[error("Transport is still disconnected after connecting")]
  NotConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
  #[error("Failed reading {quantity} registers at {address}")]
  Transport {
    address: Address,
    quantity: Quantity,
    #[source]
    source: TransportError,
  },

  #[error("Function code {function_code} at {address} is not a register read")]
  UnsupportedFunction {
    address: Address,
    function_code: FunctionCode,
  },

  #[error("Failed parsing response for registers at {address}")]
  Parse {
    address: Address,
    #[source]
    source: BatchParseError<ConversionError>,
  },
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
  #[error("Register {0:?} has a zero scale factor")]
  ZeroScaleFactor(String),

  #[error("Failed writing register {name:?}")]
  Transport {
    name: String,
    #[source]
    source: TransportError,
  },
}

/// Outcome of reading a single register.
#[derive(Debug, Clone)]
pub(crate) struct Reading {
  pub(crate) name: String,
  pub(crate) value: Value,
  pub(crate) previous: Option<Value>,
  pub(crate) timestamp: chrono::DateTime<chrono::Utc>,
}

impl Reading {
  pub(crate) fn change(&self) -> Option<Change> {
    if self.previous.as_ref() == Some(&self.value) {
      return None;
    }

    Some(Change {
      name: self.name.clone(),
      old: self.previous.clone(),
      new: self.value.clone(),
      timestamp: self.timestamp,
    })
  }
}

/// Named register access on top of a [`Transport`].
///
/// Every device transaction passes through one [`Gate`] so that calls from
/// any number of clones and the monitor are strictly serialized.
#[derive(Clone, Debug)]
pub struct Engine {
  inner: Arc<Inner>,
}

#[derive(Debug)]
pub(crate) struct Inner {
  config: config::Values,
  transport: Arc<Mutex<Box<dyn Transport>>>,
  gate: Gate,
  cache: Arc<Mutex<HashMap<String, CachedValue>>>,
  monitor: Arc<Mutex<Option<monitor::Handle>>>,
  subscribers: Arc<Mutex<Subscribers>>,
}

/// Engine reference that does not keep the engine alive.
#[derive(Clone, Debug)]
pub(crate) struct WeakEngine {
  inner: Weak<Inner>,
}

impl WeakEngine {
  pub(crate) fn upgrade(&self) -> Option<Engine> {
    self.inner.upgrade().map(|inner| Engine { inner })
  }
}

impl Engine {
  pub fn new<TTransport: Transport + 'static>(
    config: config::Values,
    transport: TTransport,
  ) -> Self {
    let gate = Gate::new(config.limits.min_request_interval);
    Self {
      inner: Arc::new(Inner {
        config,
        transport: Arc::new(Mutex::new(Box::new(transport))),
        gate,
        cache: Arc::new(Mutex::new(HashMap::new())),
        monitor: Arc::new(Mutex::new(None)),
        subscribers: Arc::new(Mutex::new(Subscribers::default())),
      }),
    }
  }

  /// Engine talking to the configured device through `tokio-modbus`.
  pub fn from_config(config: config::Values) -> Self {
    let connection = Connection::new(&config.connection);
    Self::new(config, connection)
  }

  pub fn config(&self) -> &config::Values {
    &self.inner.config
  }

  pub(crate) fn downgrade(&self) -> WeakEngine {
    WeakEngine {
      inner: Arc::downgrade(&self.inner),
    }
  }

  #[tracing::instrument(skip(self))]
  pub async fn connect(&self) -> Result<(), ConnectError> {
    let mut transport = self.inner.transport.clone().lock_owned().await;
    if transport.is_connected() {
      tracing::debug!("Already connected");
      return Ok(());
    }

    Self::connect_transport(&mut transport).await
  }

  /// Stops monitoring and closes the transport.
  #[tracing::instrument(skip(self))]
  pub async fn disconnect(&self) {
    self.stop_monitoring().await;

    let mut transport = self.inner.transport.clone().lock_owned().await;
    transport.close().await;
    tracing::debug!("Disconnected");
  }

  pub async fn is_connected(&self) -> bool {
    self.inner.transport.clone().lock_owned().await.is_connected()
  }

  /// Connects, runs `f` and disconnects whatever `f` returned.
  pub async fn session<T, TFn, TFuture>(&self, f: TFn) -> Result<T, Error>
  where
    TFn: FnOnce(Engine) -> TFuture,
    TFuture: Future<Output = Result<T, Error>>,
  {
    if let Err(error) = self.connect().await {
      self.disconnect().await;
      return Err(error.into());
    }

    let result = f(self.clone()).await;
    self.disconnect().await;

    result
  }

  #[tracing::instrument(skip(self))]
  pub async fn read_all(&self) -> Result<HashMap<String, Value>, Error> {
    let mut values = HashMap::new();
    for batch in self.group(self.inner.config.registers.iter()) {
      for reading in self.read_batch(&batch).await? {
        values.insert(reading.name, reading.value);
      }
    }

    Ok(values)
  }

  #[tracing::instrument(skip(self))]
  pub async fn read_register(&self, name: &str) -> Result<Value, Error> {
    let register = self.inner.config.register(name)?;
    let batch = Batch {
      address: register.address(),
      quantity: register.quantity(),
      spans: vec![register],
    };

    self
      .read_batch(&batch)
      .await?
      .into_iter()
      .next()
      .map(|reading| reading.value)
      .ok_or_else(|| ConfigError::UnknownRegister(name.to_owned()).into())
  }

  #[tracing::instrument(skip(self, value))]
  pub async fn write_register<TValue: Into<Value>>(
    &self,
    name: &str,
    value: TValue,
  ) -> Result<(), Error> {
    let value = value.into();
    let register = self.inner.config.register(name)?;
    if !register.writable {
      tracing::debug!("Writing register {} which is not marked writable", name);
    }

    let record = WriteRecord {
      address: register.address,
      values: Self::encode_for_write(register, &value)?,
    };

    let permit = self.inner.gate.acquire().await;
    let result = self.write_record(name, &record).await;
    if result.is_ok() {
      let mut cache = self.inner.cache.clone().lock_owned().await;
      match cache.get_mut(name) {
        Some(cached) => cached.value = value,
        None => {
          cache.insert(
            name.to_owned(),
            CachedValue {
              value,
              read_at: None,
            },
          );
        }
      }
    }
    permit.release().await;

    result
  }

  pub async fn last_value(&self, name: &str) -> Option<Value> {
    self.cached(name).await.map(|cached| cached.value)
  }

  pub async fn cached(&self, name: &str) -> Option<CachedValue> {
    self.inner.cache.clone().lock_owned().await.get(name).cloned()
  }

  pub async fn last_values(&self) -> HashMap<String, Value> {
    self
      .inner
      .cache
      .clone()
      .lock_owned()
      .await
      .iter()
      .map(|(name, cached)| (name.clone(), cached.value.clone()))
      .collect()
  }

  /// Channel receiving every change seen while monitoring.
  pub async fn subscribe(&self) -> flume::Receiver<Change> {
    self.inner.subscribers.clone().lock_owned().await.subscribe()
  }

  /// Starts polling registers with a poll interval in the background.
  ///
  /// Does nothing but warn when monitoring is already running.
  #[tracing::instrument(skip(self, observer))]
  pub async fn start_monitoring<TObserver: Observer + 'static>(
    &self,
    observer: TObserver,
  ) {
    let mut monitor = self.inner.monitor.clone().lock_owned().await;
    if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
      tracing::warn!("Monitoring is already running");
      return;
    }

    *monitor = Some(monitor::spawn(self.downgrade(), Arc::new(observer)));
    tracing::info!("Monitoring started");
  }

  /// Signals the monitor and waits for it to finish.
  #[tracing::instrument(skip(self))]
  pub async fn stop_monitoring(&self) {
    let handle = self.inner.monitor.clone().lock_owned().await.take();
    if let Some(handle) = handle {
      handle.stop().await;
      tracing::info!("Monitoring stopped");
    }
  }

  pub async fn is_monitoring(&self) -> bool {
    self
      .inner
      .monitor
      .clone()
      .lock_owned()
      .await
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }

  /// Reads every register that is due at `now` and publishes changes.
  ///
  /// Cancellation is honored only while waiting for the gate. Failing groups
  /// are logged and the last failure is returned after all groups were tried.
  pub(crate) async fn poll(
    &self,
    now: chrono::DateTime<chrono::Utc>,
    observer: &dyn Observer,
    token: &tokio_util::sync::CancellationToken,
  ) -> Result<(), Error> {
    let due = self.due(now).await;
    let mut last_error = None;
    for batch in self.group(due) {
      let permit = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        permit = self.inner.gate.acquire() => permit,
      };
      let result = self.read_batch_with(&batch).await;
      permit.release().await;

      let readings = match result {
        Ok(readings) => readings,
        Err(error) => {
          tracing::error! {
            %error,
            "Failed reading {} registers at {}",
            batch.quantity,
            batch.address
          };
          last_error = Some(error);
          continue;
        }
      };

      let changes = readings
        .iter()
        .filter_map(Reading::change)
        .collect::<Vec<_>>();
      if changes.is_empty() {
        continue;
      }

      let mut subscribers = self.inner.subscribers.clone().lock_owned().await;
      for change in &changes {
        tracing::debug!("{} changed to {}", change.name, change.new);
        notify(observer, change);
        subscribers.publish(change);
      }
    }

    match last_error {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }

  async fn due(
    &self,
    now: chrono::DateTime<chrono::Utc>,
  ) -> Vec<&config::Register> {
    let cache = self.inner.cache.clone().lock_owned().await;
    self
      .inner
      .config
      .registers
      .iter()
      .filter(|register| {
        let Some(interval) = register.poll_interval else {
          return false;
        };
        match cache.get(&register.name).and_then(|cached| cached.read_at) {
          Some(read_at) => now.signed_duration_since(read_at) >= interval,
          None => true,
        }
      })
      .collect()
  }

  /// Batches registers per function code.
  fn group<'a, TIntoIterator>(
    &self,
    registers: TIntoIterator,
  ) -> Vec<Batch<&'a config::Register>>
  where
    TIntoIterator: IntoIterator<Item = &'a config::Register>,
  {
    let max_quantity = self.inner.config.limits.max_registers_per_read;
    registers
      .into_iter()
      .into_group_map_by(|register| register.function_code)
      .into_iter()
      .sorted_by_key(|(function_code, _)| *function_code)
      .flat_map(|(_, registers)| batch_spans(registers, max_quantity))
      .collect()
  }

  async fn read_batch(
    &self,
    batch: &Batch<&config::Register>,
  ) -> Result<Vec<Reading>, Error> {
    let permit = self.inner.gate.acquire().await;
    let result = self.read_batch_with(batch).await;
    permit.release().await;

    result
  }

  /// Reads a batch while the caller holds the gate.
  #[tracing::instrument(skip(self, batch), fields(address = batch.address, quantity = batch.quantity))]
  async fn read_batch_with(
    &self,
    batch: &Batch<&config::Register>,
  ) -> Result<Vec<Reading>, Error> {
    let function_code = match batch.spans.first() {
      Some(register) => register.function_code,
      None => return Ok(Vec::new()),
    };
    let device = self.inner.config.connection.device_id;

    let input = match function_code {
      FunctionCode::ReadHoldingRegisters => false,
      FunctionCode::ReadInputRegisters => true,
      function_code => {
        return Err(
          ReadError::UnsupportedFunction {
            address: batch.address,
            function_code,
          }
          .into(),
        )
      }
    };

    let response = {
      let mut transport = self.inner.transport.clone().lock_owned().await;
      Self::ensure_connected(&mut transport).await?;
      let response = if input {
        transport
          .read_input_registers(batch.address, batch.quantity, device)
          .await
      } else {
        transport
          .read_holding_registers(batch.address, batch.quantity, device)
          .await
      };
      response.map_err(|source| ReadError::Transport {
        address: batch.address,
        quantity: batch.quantity,
        source,
      })?
    };

    let values: Vec<Value> =
      batch
        .parse(&response)
        .map_err(|source| ReadError::Parse {
          address: batch.address,
          source,
        })?;
    let timestamp = chrono::Utc::now();

    let mut cache = self.inner.cache.clone().lock_owned().await;
    let readings = batch
      .spans
      .iter()
      .zip(values)
      .map(|(register, value)| {
        let previous = cache
          .insert(
            register.name.clone(),
            CachedValue {
              value: value.clone(),
              read_at: Some(timestamp),
            },
          )
          .map(|cached| cached.value);
        Reading {
          name: register.name.clone(),
          value,
          previous,
          timestamp,
        }
      })
      .collect::<Vec<_>>();
    tracing::trace!("Read {} registers", readings.len());

    Ok(readings)
  }

  /// Writes a record while the caller holds the gate.
  async fn write_record(
    &self,
    name: &str,
    record: &WriteRecord,
  ) -> Result<(), Error> {
    let device = self.inner.config.connection.device_id;
    let mut transport = self.inner.transport.clone().lock_owned().await;
    Self::ensure_connected(&mut transport).await?;

    let result = if record.is_single() {
      transport
        .write_register(record.address(), record.values()[0], device)
        .await
    } else {
      transport
        .write_registers(record.address(), record.values(), device)
        .await
    };

    result.map_err(|source| {
      WriteError::Transport {
        name: name.to_owned(),
        source,
      }
      .into()
    })
  }

  fn encode_for_write(
    register: &config::Register,
    value: &Value,
  ) -> Result<Vec<u16>, Error> {
    if register.scaling.factor.is_some_and(|factor| factor.is_zero()) {
      return Err(WriteError::ZeroScaleFactor(register.name.clone()).into());
    }

    let raw = match value {
      Value::Number(number) if !register.scaling.is_identity() => {
        let raw = register.scaling.invert(*number)?;
        if register.kind.is_integer() {
          Value::Number(
            raw.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero),
          )
        } else {
          Value::Number(raw)
        }
      }
      Value::Float(float) if !register.scaling.is_identity() => {
        Value::Float(register.scaling.invert_float(*float)?)
      }
      value => value.clone(),
    };

    Ok(encode(&raw, register.kind, register.order)?)
  }

  async fn ensure_connected(
    transport: &mut Box<dyn Transport>,
  ) -> Result<(), ConnectError> {
    if transport.is_connected() {
      return Ok(());
    }

    tracing::warn!("Not connected, reconnecting");
    Self::connect_transport(transport).await
  }

  async fn connect_transport(
    transport: &mut Box<dyn Transport>,
  ) -> Result<(), ConnectError> {
    if transport.connect().await? {
      tracing::info!("Connected");
      Ok(())
    } else {
      Err(ConnectError::NotConnected)
    }
  }
}
