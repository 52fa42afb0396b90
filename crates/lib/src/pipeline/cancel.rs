//! Cooperative cancellation shared between the caller and running builds.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable cancellation flag. Every clone observes the same state.
#[derive(Debug, Clone)]
pub struct Cancellation {
  sender: Arc<watch::Sender<bool>>,
  receiver: watch::Receiver<bool>,
}

impl Default for Cancellation {
  fn default() -> Self {
    Self::new()
  }
}

impl Cancellation {
  pub fn new() -> Self {
    let (sender, receiver) = watch::channel(false);
    Self {
      sender: Arc::new(sender),
      receiver,
    }
  }

  /// Request cancellation. Idempotent.
  pub fn cancel(&self) {
    self.sender.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.receiver.borrow()
  }

  /// Resolves once cancellation has been requested.
  pub async fn cancelled(&self) {
    let mut receiver = self.receiver.clone();
    // The sender lives as long as `self`, so this only returns on cancel
    let _ = receiver.wait_for(|cancelled| *cancelled).await;
  }
}
