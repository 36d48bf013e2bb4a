use rust_decimal::Decimal;

use super::register::Value;

/// Subscribers that fall this far behind start missing changes.
const SUBSCRIBER_CAPACITY: usize = 1024;

/// Transition of a register value observed while monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
  pub name: String,
  pub old: Option<Value>,
  pub new: Value,
  pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Change {
  /// Numeric difference for numeric transitions.
  pub fn delta(&self) -> Option<Decimal> {
    let old = self.old.as_ref()?.as_number()?;
    let new = self.new.as_number()?;
    new.checked_sub(old)
  }
}

pub trait Observer: Send + Sync {
  fn notify(&self, change: &Change) -> anyhow::Result<()>;
}

impl<TFn> Observer for TFn
where
  TFn: Fn(&Change) -> anyhow::Result<()> + Send + Sync,
{
  fn notify(&self, change: &Change) -> anyhow::Result<()> {
    self(change)
  }
}

/// Channel subscribers fed with every published change.
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
  senders: Vec<flume::Sender<Change>>,
}

impl Subscribers {
  pub(crate) fn subscribe(&mut self) -> flume::Receiver<Change> {
    let (sender, receiver) = flume::bounded(SUBSCRIBER_CAPACITY);
    self.senders.push(sender);
    receiver
  }

  pub(crate) fn publish(&mut self, change: &Change) {
    self
      .senders
      .retain(|sender| match sender.try_send(change.clone()) {
        Ok(()) => true,
        Err(flume::TrySendError::Full(_)) => {
          tracing::warn!("Subscriber is full, dropping change of {}", change.name);
          true
        }
        Err(flume::TrySendError::Disconnected(_)) => false,
      });
  }

  pub(crate) fn len(&self) -> usize {
    self.senders.len()
  }
}

pub(crate) fn notify(observer: &dyn Observer, change: &Change) {
  if let Err(error) = observer.notify(change) {
    tracing::error! {
      %error,
      "Observer failed handling change of {}",
      change.name
    }
  }
}
