// blpmux/src/request.rs
// Common request plumbing: options, the inbound message queue and the trait
// handlers use to route messages.

use crate::base::BlpError;
use crate::data::Overrides;
use crate::element::Value;
use crate::event::Message;
use crate::session::{Service, WireRequest};
use log::trace;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

/// Queue item: a message, or `None` as the terminal sentinel.
pub type QueueItem = Option<Arc<Message>>;

// --- Request options ---

/// Value of one request option.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
  Scalar(Value),
  List(Vec<Value>),
}

impl From<Value> for OptionValue {
  fn from(v: Value) -> Self {
    OptionValue::Scalar(v)
  }
}

impl From<Vec<String>> for OptionValue {
  fn from(items: Vec<String>) -> Self {
    OptionValue::List(items.into_iter().map(Value::String).collect())
  }
}

/// Ordered top-level options used to build the wire request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestOptions {
  options: Vec<(String, OptionValue)>,
}

impl RequestOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert or replace an option, keeping first-insertion order.
  pub fn insert(&mut self, name: &str, value: impl Into<OptionValue>) {
    let value = value.into();
    match self.options.iter_mut().find(|(n, _)| n == name) {
      Some((_, slot)) => *slot = value,
      None => self.options.push((name.to_string(), value)),
    }
  }

  /// Merge caller overrides as scalar options.
  pub fn extend_overrides(&mut self, overrides: &Overrides) {
    for (name, value) in overrides {
      self.insert(name, value.clone());
    }
  }

  pub fn get(&self, name: &str) -> Option<&OptionValue> {
    self.options.iter().find(|(n, _)| n == name).map(|(_, v)| v)
  }

  pub fn iter(&self) -> impl Iterator<Item = &(String, OptionValue)> {
    self.options.iter()
  }
}

// --- Inbox ---

/// Unbounded FIFO between the provider thread (producer) and `process()`.
///
/// `push` is safe to call from any thread and never blocks; consumers take
/// the reader half through an async lock so only one `process()` drains at a
/// time.
#[derive(Debug)]
pub struct Inbox {
  tx: UnboundedSender<QueueItem>,
  rx: AsyncMutex<UnboundedReceiver<QueueItem>>,
}

impl Inbox {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Inbox { tx, rx: AsyncMutex::new(rx) }
  }

  pub fn push(&self, item: QueueItem) {
    if self.tx.send(item).is_err() {
      trace!("Inbox: receiver gone, message dropped");
    }
  }

  pub async fn reader(&self) -> InboxReader<'_> {
    InboxReader { rx: self.rx.lock().await }
  }

  /// Non-blocking reader; `None` if another consumer holds the queue.
  pub fn try_reader(&self) -> Option<InboxReader<'_>> {
    self.rx.try_lock().ok().map(|rx| InboxReader { rx })
  }
}

impl Default for Inbox {
  fn default() -> Self {
    Self::new()
  }
}

/// Exclusive read access to an `Inbox`.
pub struct InboxReader<'a> {
  rx: AsyncMutexGuard<'a, UnboundedReceiver<QueueItem>>,
}

/// Result of a non-blocking read.
#[derive(Debug)]
pub enum TryNext {
  Message(Arc<Message>),
  Sentinel,
  Empty,
}

impl InboxReader<'_> {
  /// Next message, or `None` once the sentinel has been received.
  pub async fn next(&mut self) -> Option<Arc<Message>> {
    // The channel can't close while the Inbox (and its sender) is alive, so a
    // `None` from recv() is treated like the sentinel.
    self.rx.recv().await.flatten()
  }

  pub fn try_next(&mut self) -> TryNext {
    match self.rx.try_recv() {
      Ok(Some(msg)) => TryNext::Message(msg),
      Ok(None) => TryNext::Sentinel,
      Err(TryRecvError::Empty) => TryNext::Empty,
      Err(TryRecvError::Disconnected) => TryNext::Sentinel,
    }
  }
}

// --- Request trait ---

/// Handler-facing side of a request.
///
/// Each concrete request additionally exposes an async `process()` reducer
/// returning its own result type.
pub trait Request: Send + Sync {
  /// Service the request must be sent to.
  fn service_name(&self) -> &str;

  /// Operation name on that service.
  fn request_name(&self) -> &str;

  fn options(&self) -> &RequestOptions;

  fn inbox(&self) -> &Inbox;

  /// Approximate response size; used only to balance handler load.
  fn weight(&self) -> u64;

  /// Thread-safe: enqueue a message (or the `None` sentinel).
  fn send_queue_message(&self, item: QueueItem) {
    trace!("{}: message queued (sentinel={})", self.request_name(), item.is_none());
    self.inbox().push(item);
  }

  /// Build the wire request on an opened service.
  fn create(&self, service: &Service) -> Result<WireRequest, BlpError> {
    let mut request = service.create_request(self.request_name());
    for (name, value) in self.options().iter() {
      match value {
        OptionValue::List(items) => {
          for item in items {
            request.append(name, item.clone());
          }
        }
        OptionValue::Scalar(v) => request.set(name, v.clone()),
      }
    }
    Ok(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::element::Element;
  use crate::session::WireField;

  struct Dummy {
    options: RequestOptions,
    inbox: Inbox,
  }

  impl Request for Dummy {
    fn service_name(&self) -> &str { "//blp/refdata" }
    fn request_name(&self) -> &str { "ReferenceDataRequest" }
    fn options(&self) -> &RequestOptions { &self.options }
    fn inbox(&self) -> &Inbox { &self.inbox }
    fn weight(&self) -> u64 { 1 }
  }

  #[test]
  fn test_create_appends_lists_and_sets_scalars() {
    let mut options = RequestOptions::new();
    options.insert("securities", vec!["IBM Equity".to_string(), "F Equity".to_string()]);
    options.insert("fields", vec!["PX_LAST".to_string()]);
    let mut overrides = Overrides::new();
    overrides.insert("periodicitySelection".into(), Value::from("MONTHLY"));
    options.extend_overrides(&overrides);

    let dummy = Dummy { options, inbox: Inbox::new() };
    let wire = dummy.create(&Service::new("//blp/refdata")).unwrap();
    assert_eq!(wire.get_list_as_strings("securities"), vec!["IBM Equity", "F Equity"]);
    assert_eq!(wire.get("periodicitySelection"), Some(&WireField::Value(Value::from("MONTHLY"))));
  }

  #[tokio::test]
  async fn test_inbox_preserves_order_across_threads() {
    let inbox = Arc::new(Inbox::new());
    let producer = {
      let inbox = inbox.clone();
      std::thread::spawn(move || {
        for i in 0..10i64 {
          inbox.push(Some(Arc::new(Message::new(Element::scalar("n", i)))));
        }
        inbox.push(None);
      })
    };

    let mut reader = inbox.reader().await;
    let mut seen = Vec::new();
    while let Some(msg) = reader.next().await {
      seen.push(msg.as_element().value().clone());
    }
    producer.join().unwrap();
    assert_eq!(seen, (0..10i64).map(Value::Int).collect::<Vec<_>>());
  }

  #[tokio::test]
  async fn test_try_next_reports_empty_and_sentinel() {
    let inbox = Inbox::new();
    let mut reader = inbox.try_reader().unwrap();
    assert!(matches!(reader.try_next(), TryNext::Empty));
    inbox.push(Some(Arc::new(Message::new(Element::scalar("x", 1i64)))));
    inbox.push(None);
    assert!(matches!(reader.try_next(), TryNext::Message(_)));
    assert!(matches!(reader.try_next(), TryNext::Sentinel));
  }
}
