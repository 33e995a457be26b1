// blpmux/src/session.rs
// Boundary with the provider session: the capability we consume and the
// callback interface we expose to it.

use crate::base::BlpError;
use crate::element::Value;
use crate::event::{CorrelationId, Event};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Weak;

/// Where to find the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
  pub server_host: String,
  pub server_port: u16,
}

impl Default for SessionOptions {
  fn default() -> Self {
    SessionOptions { server_host: "127.0.0.1".to_string(), server_port: 8194 }
  }
}

/// An opened provider service. Only obtainable once the service is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
  name: String,
}

impl Service {
  pub(crate) fn new(name: &str) -> Self {
    Service { name: name.to_string() }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Start building a request for `operation` on this service.
  pub fn create_request(&self, operation: &str) -> WireRequest {
    WireRequest { service: self.name.clone(), operation: operation.to_string(), elements: Vec::new() }
  }
}

/// Value of a top-level request element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireField {
  Value(Value),
  List(Vec<Value>),
}

/// Request as handed to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
  service: String,
  operation: String,
  elements: Vec<(String, WireField)>,
}

impl WireRequest {
  pub fn service(&self) -> &str {
    &self.service
  }

  pub fn operation(&self) -> &str {
    &self.operation
  }

  /// Set a scalar element, replacing any previous value.
  pub fn set(&mut self, name: &str, value: Value) {
    match self.elements.iter_mut().find(|(n, _)| n == name) {
      Some((_, slot)) => *slot = WireField::Value(value),
      None => self.elements.push((name.to_string(), WireField::Value(value))),
    }
  }

  /// Append one value to a list element, creating it if needed.
  pub fn append(&mut self, name: &str, value: Value) {
    match self.elements.iter_mut().find(|(n, _)| n == name) {
      Some((_, WireField::List(values))) => values.push(value),
      Some((_, slot)) => *slot = WireField::List(vec![value]),
      None => self.elements.push((name.to_string(), WireField::List(vec![value]))),
    }
  }

  pub fn get(&self, name: &str) -> Option<&WireField> {
    self.elements.iter().find(|(n, _)| n == name).map(|(_, f)| f)
  }

  /// String items of a list element; empty if absent.
  pub fn get_list_as_strings(&self, name: &str) -> Vec<String> {
    match self.get(name) {
      Some(WireField::List(values)) => values.iter().map(|v| v.to_string()).collect(),
      Some(WireField::Value(v)) => vec![v.to_string()],
      None => Vec::new(),
    }
  }

  pub fn elements(&self) -> &[(String, WireField)] {
    &self.elements
  }
}

impl fmt::Display for WireRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "{} ({}) = {{", self.operation, self.service)?;
    for (name, field) in &self.elements {
      match field {
        WireField::Value(v) => writeln!(f, "  {} = {}", name, v)?,
        WireField::List(values) => {
          let items: Vec<String> = values.iter().map(|v| format!("\"{}\"", v)).collect();
          writeln!(f, "  {}[] = {{ {} }}", name, items.join(", "))?
        }
      }
    }
    write!(f, "}}")
  }
}

/// One streaming subscription entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
  pub topic: String,
  pub fields: Vec<String>,
  pub options: Vec<(String, Value)>,
  pub correlation_id: CorrelationId,
}

/// Batch of subscriptions issued in one `subscribe` call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscriptionList {
  entries: Vec<SubscriptionEntry>,
}

impl SubscriptionList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, topic: &str, fields: &[String], options: Vec<(String, Value)>, correlation_id: CorrelationId) {
    self.entries.push(SubscriptionEntry {
      topic: topic.to_string(),
      fields: fields.to_vec(),
      options,
      correlation_id,
    });
  }

  pub fn entries(&self) -> &[SubscriptionEntry] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

/// The provider session capability. All calls are non-blocking; results come
/// back later as events delivered to the session's `EventHandler`.
#[cfg_attr(test, mockall::automock)]
pub trait Session: Send {
  fn start_async(&mut self) -> Result<(), BlpError>;
  fn open_service_async(&mut self, service_name: &str) -> Result<(), BlpError>;
  fn send_request(&mut self, request: WireRequest, correlation_id: CorrelationId) -> Result<(), BlpError>;
  fn subscribe(&mut self, subscriptions: SubscriptionList) -> Result<(), BlpError>;
  fn stop_async(&mut self) -> Result<(), BlpError>;
}

/// Receives events on the provider's own thread.
///
/// An `Err` return means the event broke the expected taxonomy; the session is
/// expected to surface it (log/abort), never to retry the event.
pub trait EventHandler: Send + Sync {
  fn process_event(&self, event: &Event) -> Result<(), BlpError>;
}

/// Creates sessions bound to a handler. The handler is held weakly so that a
/// session never keeps its owner alive.
pub trait SessionFactory: Send + Sync {
  fn create_session(
    &self,
    options: &SessionOptions,
    handler: Weak<dyn EventHandler>,
  ) -> Result<Box<dyn Session>, BlpError>;
}
