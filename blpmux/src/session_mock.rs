// blpmux/src/session_mock.rs
// In-process session that answers requests from a `Responder` and delivers
// events on its own provider thread, the way a native SDK would.

use crate::base::BlpError;
use crate::element::Element;
use crate::event::{CorrelationId, Event, EventType, Message};
use crate::names;
use crate::session::{EventHandler, Session, SessionFactory, SessionOptions, SubscriptionList, WireRequest};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread;

// --- Responders ---

/// Produces the events a provider would emit for a request.
pub trait Responder: Send + Sync {
  fn respond(&self, request: &WireRequest, correlation_id: CorrelationId) -> Vec<Event>;

  /// Default: acknowledge every entry with `SubscriptionStarted`.
  fn on_subscribe(&self, subscriptions: &SubscriptionList) -> Vec<Event> {
    subscriptions
      .entries()
      .iter()
      .map(|entry| Event::subscription_started(entry.correlation_id))
      .collect()
  }
}

impl<F> Responder for F
where
  F: Fn(&WireRequest, CorrelationId) -> Vec<Event> + Send + Sync,
{
  fn respond(&self, request: &WireRequest, correlation_id: CorrelationId) -> Vec<Event> {
    self(request, correlation_id)
  }
}

/// Final response carrying a `responseError`, closing the request.
pub fn response_error(correlation_id: CorrelationId, message: &str) -> Event {
  let element = Element::sequence("Response", vec![
    Element::sequence(names::RESPONSE_ERROR, vec![
      Element::scalar(names::CATEGORY, "BAD_ARGS"),
      Element::scalar(names::MESSAGE, message),
    ]),
  ]);
  Event::new(EventType::Response, vec![Message::new(element).with_correlation_id(correlation_id)])
}

/// Canned events keyed by request operation name, loaded from JSON.
///
/// Correlation ids in the script are ignored and replaced by the id of the
/// request being answered. For requests carrying `securities`, security data
/// for other securities is dropped, so a chunked query gets back exactly its
/// own part of the script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponder {
  script: HashMap<String, Vec<Event>>,
}

impl ScriptedResponder {
  pub fn new(script: HashMap<String, Vec<Event>>) -> Self {
    ScriptedResponder { script }
  }

  pub fn from_json_str(json: &str) -> Result<Self, BlpError> {
    let script = serde_json::from_str(json)
      .map_err(|e| BlpError::ParseError(format!("invalid responder script: {}", e)))?;
    Ok(Self::new(script))
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BlpError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
      .map_err(|e| BlpError::ConfigurationError(format!("cannot read {}: {}", path.display(), e)))?;
    Self::from_json_str(&json)
  }

  pub fn operations(&self) -> Vec<&str> {
    self.script.keys().map(String::as_str).collect()
  }

  fn retarget(message: &Message, wanted: &HashSet<String>) -> Option<Element> {
    let root = message.as_element();
    if wanted.is_empty() || !root.has_element(names::SECURITY_DATA) {
      return Some(root.clone());
    }
    let is_wanted = |sd: &Element| {
      sd.get_element_as_string(names::SECURITY).map(|s| wanted.contains(&s)).unwrap_or(false)
    };
    let mut children = Vec::with_capacity(root.elements().len());
    for child in root.elements() {
      if child.name() != names::SECURITY_DATA {
        children.push(child.clone());
      } else if child.is_array() {
        let kept = child.values().iter().filter(|sd| is_wanted(sd)).cloned().collect();
        children.push(Element::array(names::SECURITY_DATA, kept));
      } else if is_wanted(child) {
        children.push(child.clone());
      } else {
        return None;
      }
    }
    Some(Element::sequence(root.name(), children))
  }
}

impl Responder for ScriptedResponder {
  fn respond(&self, request: &WireRequest, correlation_id: CorrelationId) -> Vec<Event> {
    let Some(events) = self.script.get(request.operation()) else {
      warn!("ScriptedResponder: no script for {}", request.operation());
      return vec![response_error(correlation_id, "no scripted response")];
    };
    let wanted: HashSet<String> = request.get_list_as_strings(names::SECURITIES).into_iter().collect();

    events
      .iter()
      .map(|event| {
        let messages = event
          .messages()
          .iter()
          .filter_map(|msg| Self::retarget(msg, &wanted))
          .map(|element| Message::new(element).with_correlation_id(correlation_id))
          .collect();
        Event::new(event.event_type(), messages)
      })
      .collect()
  }
}

// --- Session ---

enum Command {
  Deliver(Event),
  Shutdown,
}

/// What a mock session has been asked to do so far.
#[derive(Default)]
struct Recorded {
  sent_requests: Mutex<Vec<(WireRequest, CorrelationId)>>,
  opened_services: Mutex<Vec<String>>,
  subscriptions: Mutex<Vec<SubscriptionList>>,
  fatal_errors: Mutex<Vec<BlpError>>,
}

/// Inspection handle for one created `MockSession`.
#[derive(Clone)]
pub struct MockSessionHandle {
  tx: Sender<Command>,
  recorded: Arc<Recorded>,
}

impl MockSessionHandle {
  /// Deliver an arbitrary event on the provider thread.
  pub fn inject(&self, event: Event) -> Result<(), BlpError> {
    self.tx
      .send(Command::Deliver(event))
      .map_err(|_| BlpError::SessionError("provider thread has exited".into()))
  }

  pub fn sent_requests(&self) -> Vec<(WireRequest, CorrelationId)> {
    self.recorded.sent_requests.lock().clone()
  }

  pub fn opened_services(&self) -> Vec<String> {
    self.recorded.opened_services.lock().clone()
  }

  pub fn subscriptions(&self) -> Vec<SubscriptionList> {
    self.recorded.subscriptions.lock().clone()
  }

  /// Errors the handler returned from `process_event`.
  pub fn fatal_errors(&self) -> Vec<BlpError> {
    self.recorded.fatal_errors.lock().clone()
  }
}

/// Session whose events come from a `Responder`.
pub struct MockSession {
  tx: Sender<Command>,
  responder: Arc<dyn Responder>,
  recorded: Arc<Recorded>,
  stopped: bool,
}

impl MockSession {
  fn spawn(
    name: String,
    responder: Arc<dyn Responder>,
    handler: Weak<dyn EventHandler>,
  ) -> Result<(Self, MockSessionHandle), BlpError> {
    let (tx, rx) = unbounded();
    let recorded = Arc::new(Recorded::default());
    let thread_recorded = recorded.clone();
    thread::Builder::new()
      .name(name)
      .spawn(move || provider_loop(rx, handler, thread_recorded))
      .map_err(|e| BlpError::SessionError(format!("cannot spawn provider thread: {}", e)))?;

    let handle = MockSessionHandle { tx: tx.clone(), recorded: recorded.clone() };
    Ok((MockSession { tx, responder, recorded, stopped: false }, handle))
  }

  fn deliver(&self, event: Event) -> Result<(), BlpError> {
    if self.stopped {
      return Err(BlpError::SessionError("session is stopped".into()));
    }
    self.tx
      .send(Command::Deliver(event))
      .map_err(|_| BlpError::SessionError("provider thread has exited".into()))
  }
}

fn provider_loop(rx: Receiver<Command>, handler: Weak<dyn EventHandler>, recorded: Arc<Recorded>) {
  debug!("MockSession: provider thread started");
  while let Ok(command) = rx.recv() {
    match command {
      Command::Deliver(event) => {
        let Some(handler) = handler.upgrade() else {
          debug!("MockSession: handler dropped, provider thread exiting");
          break;
        };
        trace!("MockSession: delivering {:?}", event.event_type());
        if let Err(e) = handler.process_event(&event) {
          error!("MockSession: handler rejected {:?} event: {}", event.event_type(), e);
          recorded.fatal_errors.lock().push(e);
        }
      }
      Command::Shutdown => break,
    }
  }
  debug!("MockSession: provider thread finished");
}

impl Session for MockSession {
  fn start_async(&mut self) -> Result<(), BlpError> {
    self.deliver(Event::session_started())
  }

  fn open_service_async(&mut self, service_name: &str) -> Result<(), BlpError> {
    self.recorded.opened_services.lock().push(service_name.to_string());
    self.deliver(Event::service_opened(service_name))
  }

  fn send_request(&mut self, request: WireRequest, correlation_id: CorrelationId) -> Result<(), BlpError> {
    let events = self.responder.respond(&request, correlation_id);
    self.recorded.sent_requests.lock().push((request, correlation_id));
    for event in events {
      self.deliver(event)?;
    }
    Ok(())
  }

  fn subscribe(&mut self, subscriptions: SubscriptionList) -> Result<(), BlpError> {
    let events = self.responder.on_subscribe(&subscriptions);
    self.recorded.subscriptions.lock().push(subscriptions);
    for event in events {
      self.deliver(event)?;
    }
    Ok(())
  }

  fn stop_async(&mut self) -> Result<(), BlpError> {
    self.deliver(Event::session_terminated())?;
    self.stopped = true;
    // Shutdown is queued behind SessionTerminated, so it is still delivered.
    let _ = self.tx.send(Command::Shutdown);
    Ok(())
  }
}

impl Drop for MockSession {
  fn drop(&mut self) {
    // Never join here: the last handler reference may be dropped on the
    // provider thread itself.
    let _ = self.tx.send(Command::Shutdown);
  }
}

/// Creates `MockSession`s sharing one responder and keeps a handle to each.
pub struct MockSessionFactory {
  responder: Arc<dyn Responder>,
  sessions: Mutex<Vec<MockSessionHandle>>,
}

impl MockSessionFactory {
  pub fn new(responder: impl Responder + 'static) -> Self {
    MockSessionFactory { responder: Arc::new(responder), sessions: Mutex::new(Vec::new()) }
  }

  /// Handles in creation order.
  pub fn sessions(&self) -> Vec<MockSessionHandle> {
    self.sessions.lock().clone()
  }
}

impl SessionFactory for MockSessionFactory {
  fn create_session(
    &self,
    options: &SessionOptions,
    handler: Weak<dyn EventHandler>,
  ) -> Result<Box<dyn Session>, BlpError> {
    let mut sessions = self.sessions.lock();
    let name = format!("mock-provider-{}", sessions.len());
    info!("MockSessionFactory: creating {} for {}:{}", name, options.server_host, options.server_port);
    let (session, handle) = MockSession::spawn(name, self.responder.clone(), handler)?;
    sessions.push(handle);
    Ok(Box::new(session))
  }
}
