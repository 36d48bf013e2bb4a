use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes device transactions and spaces them out.
///
/// Waiters are served in arrival order. A permit keeps the gate closed until
/// [`Permit::release`] has waited out the minimum request interval.
#[derive(Clone, Debug)]
pub struct Gate {
  lock: Arc<Mutex<()>>,
  interval: tokio::time::Duration,
}

#[derive(Debug)]
pub struct Permit {
  guard: OwnedMutexGuard<()>,
  interval: tokio::time::Duration,
}

impl Gate {
  pub fn new(interval: chrono::Duration) -> Self {
    Self {
      lock: Arc::new(Mutex::new(())),
      interval: super::connection::delay_from_chrono(interval),
    }
  }

  pub async fn acquire(&self) -> Permit {
    Permit {
      guard: self.lock.clone().lock_owned().await,
      interval: self.interval,
    }
  }
}

impl Permit {
  pub async fn release(self) {
    tokio::time::sleep(self.interval).await;
    drop(self.guard);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn spaces_out_transactions() {
    let gate = Gate::new(chrono::Duration::milliseconds(100));
    let start = tokio::time::Instant::now();

    gate.acquire().await.release().await;
    gate.acquire().await.release().await;

    assert!(start.elapsed() >= tokio::time::Duration::from_millis(200));
  }

  #[tokio::test(start_paused = true)]
  async fn serves_waiters_in_order() {
    let gate = Gate::new(chrono::Duration::milliseconds(10));
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = gate.acquire().await;
    let mut handles = Vec::new();
    for index in 0..3 {
      let gate = gate.clone();
      let order = order.clone();
      handles.push(tokio::spawn(async move {
        let permit = gate.acquire().await;
        order.lock().await.push(index);
        permit.release().await;
      }));
      tokio::task::yield_now().await;
    }
    first.release().await;

    for handle in handles {
      handle.await.unwrap();
    }
    assert_eq!(*order.lock().await, vec![0, 1, 2]);
  }
}
