use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::observer::Observer;
use super::service::WeakEngine;

const TICK: tokio::time::Duration = tokio::time::Duration::from_millis(100);

const ERROR_PAUSE: tokio::time::Duration = tokio::time::Duration::from_secs(1);

#[derive(Debug)]
pub(crate) struct Handle {
  token: CancellationToken,
  join: tokio::task::JoinHandle<()>,
}

impl Handle {
  pub(crate) fn is_finished(&self) -> bool {
    self.join.is_finished()
  }

  pub(crate) async fn stop(self) {
    self.token.cancel();
    if let Err(error) = self.join.await {
      tracing::error! {
        %error,
        "Joining monitor failed"
      }
    }
  }
}

pub(crate) fn spawn(engine: WeakEngine, observer: Arc<dyn Observer>) -> Handle {
  let token = CancellationToken::new();
  let child_token = token.child_token();
  let join = tokio::spawn(async move {
    run(engine, observer, child_token).await;
  });

  Handle { token, join }
}

#[tracing::instrument(skip_all)]
async fn run(
  engine: WeakEngine,
  observer: Arc<dyn Observer>,
  token: CancellationToken,
) {
  loop {
    if token.is_cancelled() {
      break;
    }

    // NOTE: dropped engines end the loop
    let Some(engine) = engine.upgrade() else {
      break;
    };
    let pause = match engine
      .poll(chrono::Utc::now(), observer.as_ref(), &token)
      .await
    {
      Ok(()) => TICK,
      Err(error) => {
        tracing::warn! {
          %error,
          "Monitoring iteration failed"
        };
        ERROR_PAUSE
      }
    };
    drop(engine);

    tokio::select! {
      _ = token.cancelled() => break,
      _ = tokio::time::sleep(pause) => {}
    }
  }

  tracing::debug!("Monitor exited");
}
