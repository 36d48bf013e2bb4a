#![deny(
  unsafe_code,
  // reason = "Let's just not do it"
)]
#![deny(
  clippy::unwrap_used,
  clippy::expect_used,
  clippy::panic,
  clippy::unreachable,
  // reason = "We have to handle errors properly"
)]

use std::future::Future;
use std::str::FromStr;

use regmap::config::{self, args::Command};
use regmap::modbus::{ReadError, RegisterKind, WriteError};
use regmap::{Change, Engine, Error, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let manager = config::Manager::new();

  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::builder()
        .with_default_directive(manager.log_level().into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let values = manager.values().await?;
  let limits = values.limits.clone();
  let engine = Engine::from_config(values);

  match manager.command().clone() {
    Command::Validate => validate(engine.config()),
    Command::ReadAll => {
      let values = with_retries(&limits, || {
        engine.session(|engine| async move { engine.read_all().await })
      })
      .await?;
      let json = values
        .into_iter()
        .map(|(name, value)| (name, value.to_json()))
        .collect::<serde_json::Map<_, _>>();
      println!("{}", serde_json::to_string_pretty(&json)?);
    }
    Command::Read { name } => {
      let value = with_retries(&limits, || {
        let name = name.clone();
        engine.session(|engine| async move {
          engine.read_register(&name).await
        })
      })
      .await?;
      println!("{} = {}", name, value);
    }
    Command::Write { name, value } => {
      let register = engine.config().register(&name)?;
      let value = if !register.kind.is_numeric() {
        Value::Text(value)
      } else {
        match rust_decimal::Decimal::from_str(&value) {
          Ok(number) => Value::Number(number),
          Err(error) if register.kind == RegisterKind::F32 => {
            Value::Float(f64::from_str(&value).map_err(|_| error)?)
          }
          Err(error) => return Err(error.into()),
        }
      };
      with_retries(&limits, || {
        let name = name.clone();
        let value = value.clone();
        engine.session(|engine| async move {
          engine.write_register(&name, value).await
        })
      })
      .await?;
      println!("{} <- {}", name, value);
    }
    Command::Monitor => monitor(&engine, &limits).await?,
  }

  Ok(())
}

fn validate(values: &config::Values) {
  println!(
    "Configuration is valid: {:?} with {} registers",
    values.connection.transport,
    values.registers.len()
  );
  for register in &values.registers {
    println!(
      "  {} @ {} {} fc {}{}{}",
      register.name,
      register.address,
      register.kind,
      register.function_code,
      register
        .unit
        .as_ref()
        .map(|unit| format!(" [{unit}]"))
        .unwrap_or_default(),
      register
        .poll_interval
        .map(|interval| format!(" every {}ms", interval.num_milliseconds()))
        .unwrap_or_default(),
    );
  }
}

async fn monitor(
  engine: &Engine,
  limits: &config::Limits,
) -> anyhow::Result<()> {
  with_retries(limits, || async {
    engine.connect().await.map_err(Error::from)
  })
  .await?;

  let changes = engine.subscribe().await;
  engine
    .start_monitoring(|change: &Change| -> anyhow::Result<()> {
      tracing::trace!("Observed change of {}", change.name);
      Ok(())
    })
    .await;

  loop {
    tokio::select! {
      signal = tokio::signal::ctrl_c() => {
        signal?;
        break;
      }
      change = changes.recv_async() => {
        let Ok(change) = change else {
          break;
        };
        match change.old {
          Some(old) => println!("{}: {} -> {}", change.name, old, change.new),
          None => println!("{}: {}", change.name, change.new),
        }
      }
    }
  }

  engine.disconnect().await;

  Ok(())
}

/// Retries transport level failures of one-shot commands.
async fn with_retries<T, TFn, TFuture>(
  limits: &config::Limits,
  mut f: TFn,
) -> Result<T, Error>
where
  TFn: FnMut() -> TFuture,
  TFuture: Future<Output = Result<T, Error>>,
{
  let delay = tokio::time::Duration::from_millis(
    limits.reconnect_delay.num_milliseconds() as u64,
  );
  let mut attempt = 0;
  loop {
    match f().await {
      Ok(value) => return Ok(value),
      Err(
        error @ (Error::Connection(_)
        | Error::Read(ReadError::Transport { .. })
        | Error::Write(WriteError::Transport { .. })),
      ) if attempt < limits.max_retries => {
        attempt += 1;
        tracing::warn! {
          %error,
          "Attempt {} of {} failed, retrying in {}ms",
          attempt,
          limits.max_retries + 1,
          delay.as_millis()
        };
        tokio::time::sleep(delay).await;
      }
      Err(error) => return Err(error),
    }
  }
}
