// blpmux/src/base.rs
// Base types and error definitions shared by handlers, requests and the dispatcher.

use crate::error_set::ErrorSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;


/// Errors that can occur while talking to the provider session.
///
/// `ProtocolViolation` and `DataError` are deliberately separate variants: the
/// first one means the event taxonomy was broken and is always fatal, the
/// second one carries per-security/per-field errors and is only produced when
/// the request's `ErrorBehaviour` is `Raise`.
#[derive(Error, Debug, Clone)]
pub enum BlpError {
  #[error("Protocol violation: {0}")]
  ProtocolViolation(String),

  #[error("Data error: {0}")]
  DataError(ErrorSet),

  #[error("Configuration error: {0}")]
  ConfigurationError(String),

  #[error("Session error: {0}")]
  SessionError(String),

  #[error("Session not started")]
  NotStarted,

  #[error("Service error: {0}")]
  ServiceError(String),

  #[error("Message parse error: {0}")]
  ParseError(String),

  #[error("Element not found: {0}")]
  ElementNotFound(String),

  #[error("Invalid parameter: {0}")]
  InvalidParameter(String),

  #[error("Internal error: {0}")]
  InternalError(String),
}

impl BlpError {
  /// True for errors that signal a client/provider contract mismatch.
  pub fn is_protocol_violation(&self) -> bool {
    matches!(self, BlpError::ProtocolViolation(_))
  }
}


/// One-shot signal that can be set from any thread and awaited on the scheduler.
///
/// Backed by a `watch` channel, so `set` needs no runtime handle.
#[derive(Debug, Clone)]
pub struct Signal {
  tx: Arc<watch::Sender<bool>>,
}

impl Signal {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Signal { tx: Arc::new(tx) }
  }

  /// Set the signal. Idempotent.
  pub fn set(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_set(&self) -> bool {
    *self.tx.borrow()
  }

  /// Wait until the signal is set. Returns immediately if it already is.
  pub async fn wait(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives as long as `self`, so this can't observe a closed channel.
    let _ = rx.wait_for(|is_set| *is_set).await;
  }
}

impl Default for Signal {
  fn default() -> Self {
    Self::new()
  }
}
