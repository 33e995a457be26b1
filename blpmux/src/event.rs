// blpmux/src/event.rs
// Events and messages emitted by the provider session.

use crate::base::BlpError;
use crate::element::Element;
use crate::names;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque key attached to an outgoing request and echoed on its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
  /// Fresh random key. Unique for all practical purposes.
  pub fn new() -> Self {
    CorrelationId(Uuid::new_v4())
  }

  pub fn value(&self) -> Uuid {
    self.0
  }
}

impl Default for CorrelationId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for CorrelationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Kind of an incoming event. Every kind maps to exactly one handler method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
  Admin,
  SessionStatus,
  SubscriptionStatus,
  RequestStatus,
  Response,
  PartialResponse,
  SubscriptionData,
  ServiceStatus,
  AuthorizationStatus,
  ResolutionStatus,
  TopicStatus,
  TokenStatus,
  Request,
  Unknown,
}

/// One message inside an event: a payload tree plus the correlation ids it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
  element: Element,
  #[serde(default)]
  correlation_ids: Vec<CorrelationId>,
}

impl Message {
  pub fn new(element: Element) -> Self {
    Message { element, correlation_ids: Vec::new() }
  }

  pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
    self.correlation_ids.push(id);
    self
  }

  /// Replace all correlation ids. Used by replay/mocked sessions that learn
  /// the key only when the request is sent.
  pub fn set_correlation_ids(&mut self, ids: Vec<CorrelationId>) {
    self.correlation_ids = ids;
  }

  pub fn name(&self) -> &str {
    self.element.name()
  }

  pub fn as_element(&self) -> &Element {
    &self.element
  }

  pub fn correlation_ids(&self) -> &[CorrelationId] {
    &self.correlation_ids
  }

  pub fn has_element(&self, name: &str) -> bool {
    self.element.has_element(name)
  }

  pub fn get_element(&self, name: &str) -> Result<&Element, BlpError> {
    self.element.get_element(name)
  }
}

impl fmt::Display for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.element)
  }
}

/// A batch of messages of the same kind, delivered on the provider thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  event_type: EventType,
  messages: Vec<Message>,
}

impl Event {
  pub fn new(event_type: EventType, messages: Vec<Message>) -> Self {
    Event { event_type, messages }
  }

  pub fn event_type(&self) -> EventType {
    self.event_type
  }

  pub fn messages(&self) -> &[Message] {
    &self.messages
  }

  pub fn messages_mut(&mut self) -> &mut [Message] {
    &mut self.messages
  }

  // --- Status event constructors ---

  fn status(event_type: EventType, name: &str) -> Self {
    Event::new(event_type, vec![Message::new(Element::sequence(name, vec![]))])
  }

  pub fn session_started() -> Self {
    Self::status(EventType::SessionStatus, names::SESSION_STARTED)
  }

  pub fn session_terminated() -> Self {
    Self::status(EventType::SessionStatus, names::SESSION_TERMINATED)
  }

  pub fn service_opened(service_name: &str) -> Self {
    let element = Element::sequence(names::SERVICE_OPENED, vec![
      Element::scalar(names::SERVICE_NAME, service_name),
    ]);
    Event::new(EventType::ServiceStatus, vec![Message::new(element)])
  }

  pub fn subscription_started(id: CorrelationId) -> Self {
    let msg = Message::new(Element::sequence(names::SUBSCRIPTION_STARTED, vec![]))
      .with_correlation_id(id);
    Event::new(EventType::SubscriptionStatus, vec![msg])
  }
}
