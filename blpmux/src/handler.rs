// blpmux/src/handler.rs
// Handlers for events delivered by the provider session.
//
// Every method named `on_*` runs on the provider's callback thread. Anything
// it touches is either behind a `parking_lot::Mutex` (correlation table,
// service registry) or a thread-safe handoff (`Inbox`, `Signal`). The async
// side (`send_requests`, `subscribe`, `get_service`) never holds a lock across
// an `.await`.

use crate::base::{BlpError, Signal};
use crate::data::DataTable;
use crate::event::{CorrelationId, Event, EventType, Message};
use crate::names;
use crate::request::Request;
use crate::session::{EventHandler, Service, Session, SessionFactory, SessionOptions, SubscriptionList};
use crate::subscription::Subscription;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

// --- Shared handler state ---

/// State common to every handler: one session, its correlation table and the
/// readiness of each service opened on it.
pub struct HandlerCore<R: Request + ?Sized> {
  name: String,
  session: Mutex<Option<Box<dyn Session>>>,
  current_requests: Mutex<HashMap<CorrelationId, Arc<R>>>,
  services: Mutex<HashMap<String, Signal>>,
  session_started: Signal,
  session_stopped: Signal,
}

impl<R: Request + ?Sized> HandlerCore<R> {
  fn new(name: &str) -> Self {
    HandlerCore {
      name: name.to_string(),
      session: Mutex::new(None),
      current_requests: Mutex::new(HashMap::new()),
      services: Mutex::new(HashMap::new()),
      session_started: Signal::new(),
      session_stopped: Signal::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Install the session and ask it to start. Readiness arrives later as a
  /// `SessionStarted` event.
  fn attach_session(&self, session: Box<dyn Session>) -> Result<(), BlpError> {
    *self.session.lock() = Some(session);
    info!("Handler {}: starting session", self.name);
    self.with_session(|session| session.start_async())
  }

  /// Run `f` against the session. Never call this while holding another lock
  /// of this handler.
  pub fn with_session<T>(
    &self,
    f: impl FnOnce(&mut Box<dyn Session>) -> Result<T, BlpError>,
  ) -> Result<T, BlpError> {
    let mut guard = self.session.lock();
    match guard.as_mut() {
      Some(session) => f(session),
      None => Err(BlpError::NotStarted),
    }
  }

  /// Add `request` to the correlation table under a fresh key.
  pub fn register(&self, request: Arc<R>) -> CorrelationId {
    let id = CorrelationId::new();
    trace!("Handler {}: registered {} as {}", self.name, request.request_name(), id);
    self.current_requests.lock().insert(id, request);
    id
  }

  pub fn get_request(&self, id: &CorrelationId) -> Option<Arc<R>> {
    self.current_requests.lock().get(id).cloned()
  }

  pub fn registered(&self) -> Vec<(CorrelationId, Arc<R>)> {
    self.current_requests.lock().iter().map(|(id, r)| (*id, r.clone())).collect()
  }

  /// Sum of the weights of all in-flight requests.
  pub fn current_load(&self) -> u64 {
    self.current_requests.lock().values().map(|r| r.weight()).sum()
  }

  /// Remove `ids` from the table and push the sentinel to each request found.
  /// Unknown ids are ignored, so closing twice is harmless.
  pub fn close_requests(&self, ids: impl IntoIterator<Item = CorrelationId>) {
    let closed: Vec<(CorrelationId, Arc<R>)> = {
      let mut table = self.current_requests.lock();
      ids.into_iter().filter_map(|id| table.remove(&id).map(|r| (id, r))).collect()
    };
    for (id, request) in closed {
      debug!("Handler {}: closing {} ({})", self.name, request.request_name(), id);
      request.send_queue_message(None);
    }
  }

  pub fn close_all(&self) {
    let ids: Vec<CorrelationId> = self.current_requests.lock().keys().copied().collect();
    if !ids.is_empty() {
      info!("Handler {}: closing {} pending request(s)", self.name, ids.len());
    }
    self.close_requests(ids);
  }

  pub fn is_started(&self) -> bool {
    self.session_started.is_set()
  }

  pub fn is_stopped(&self) -> bool {
    self.session_stopped.is_set()
  }

  /// Wait for `SessionStarted`. Fails if the session stops first.
  pub async fn wait_started(&self) -> Result<(), BlpError> {
    tokio::select! {
      biased;
      _ = self.session_stopped.wait() => {
        Err(BlpError::SessionError(format!("session of handler {} stopped", self.name)))
      }
      _ = self.session_started.wait() => Ok(()),
    }
  }

  pub async fn wait_stopped(&self) {
    self.session_stopped.wait().await
  }

  /// Opened service `name`, opening it on first use.
  pub async fn get_service(&self, service_name: &str) -> Result<Service, BlpError> {
    let (signal, must_open) = {
      let mut services = self.services.lock();
      match services.get(service_name) {
        Some(signal) => (signal.clone(), false),
        None => {
          let signal = Signal::new();
          services.insert(service_name.to_string(), signal.clone());
          (signal, true)
        }
      }
    };

    if must_open {
      debug!("Handler {}: opening service {}", self.name, service_name);
      if let Err(e) = self.with_session(|session| session.open_service_async(service_name)) {
        self.services.lock().remove(service_name);
        return Err(e);
      }
    }

    tokio::select! {
      biased;
      _ = signal.wait() => Ok(Service::new(service_name)),
      _ = self.session_stopped.wait() => {
        Err(BlpError::ServiceError(format!("session stopped before {} opened", service_name)))
      }
    }
  }

  pub fn stop_session(&self) -> Result<(), BlpError> {
    info!("Handler {}: stopping session", self.name);
    self.close_all();
    self.with_session(|session| session.stop_async())
  }

  // --- Event kinds shared by all handlers ---

  pub fn session_status(&self, event: &Event) -> Result<(), BlpError> {
    for msg in event.messages() {
      match msg.name() {
        names::SESSION_STARTED => {
          info!("Handler {}: session started", self.name);
          self.session_started.set();
        }
        names::SESSION_TERMINATED | names::SESSION_CONNECTION_DOWN => {
          info!("Handler {}: session stopped ({})", self.name, msg.name());
          self.session_stopped.set();
          self.close_all();
        }
        names::SESSION_CONNECTION_UP | names::SESSION_CLUSTER_INFO | names::SESSION_CLUSTER_UPDATE => {
          debug!("Handler {}: {}", self.name, msg.name());
        }
        names::SESSION_STARTUP_FAILURE => {
          // Nobody would ever see SessionStarted; release the waiters.
          self.session_stopped.set();
          self.close_all();
          return Err(unexpected_message(&self.name, event, msg));
        }
        _ => return Err(unexpected_message(&self.name, event, msg)),
      }
    }
    Ok(())
  }

  pub fn service_status(&self, event: &Event) -> Result<(), BlpError> {
    for msg in event.messages() {
      if msg.name() != names::SERVICE_OPENED {
        return Err(unexpected_message(&self.name, event, msg));
      }
      let service_name = msg.get_element(names::SERVICE_NAME)?.value().to_string();
      info!("Handler {}: service {} opened", self.name, service_name);
      self.services.lock().entry(service_name).or_default().set();
    }
    Ok(())
  }

  pub fn admin(&self, event: &Event) -> Result<(), BlpError> {
    for msg in event.messages() {
      match msg.name() {
        names::SLOW_CONSUMER_WARNING | names::SLOW_CONSUMER_WARNING_CLEARED | names::DATA_LOSS => {
          warn!("Handler {}: {}", self.name, msg);
        }
        names::REQUEST_TEMPLATE_AVAILABLE | names::REQUEST_TEMPLATE_PENDING | names::REQUEST_TEMPLATE_TERMINATED => {
          debug!("Handler {}: {}", self.name, msg.name());
        }
        _ => return Err(unexpected_message(&self.name, event, msg)),
      }
    }
    Ok(())
  }
}

fn unexpected_message(handler: &str, event: &Event, msg: &Message) -> BlpError {
  BlpError::ProtocolViolation(format!(
    "handler {} received unexpected {:?} message {}", handler, event.event_type(), msg.name()
  ))
}

fn unexpected_event(handler: &str, event: &Event) -> BlpError {
  BlpError::ProtocolViolation(format!("handler {} cannot handle {:?} events", handler, event.event_type()))
}

// --- Per-kind event dispatch ---

/// One method per event kind. The defaults accept what every handler
/// understands and reject the rest as a protocol violation.
pub trait HandlerEvents: Send + Sync {
  type Target: Request + ?Sized;

  fn core(&self) -> &HandlerCore<Self::Target>;

  fn on_admin(&self, event: &Event) -> Result<(), BlpError> {
    self.core().admin(event)
  }

  fn on_session_status(&self, event: &Event) -> Result<(), BlpError> {
    self.core().session_status(event)
  }

  fn on_service_status(&self, event: &Event) -> Result<(), BlpError> {
    self.core().service_status(event)
  }

  fn on_subscription_status(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_subscription_data(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_partial_response(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_response(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_request_status(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_authorization_status(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_resolution_status(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_topic_status(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_token_status(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_request(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }

  fn on_unknown(&self, event: &Event) -> Result<(), BlpError> {
    Err(unexpected_event(self.core().name(), event))
  }
}

/// Route `event` to the matching `on_*` method and log protocol violations.
pub fn dispatch_event<H: HandlerEvents + ?Sized>(handler: &H, event: &Event) -> Result<(), BlpError> {
  trace!("Handler {}: {:?} event with {} message(s)", handler.core().name(), event.event_type(), event.messages().len());
  let result = match event.event_type() {
    EventType::Admin => handler.on_admin(event),
    EventType::SessionStatus => handler.on_session_status(event),
    EventType::ServiceStatus => handler.on_service_status(event),
    EventType::SubscriptionStatus => handler.on_subscription_status(event),
    EventType::SubscriptionData => handler.on_subscription_data(event),
    EventType::PartialResponse => handler.on_partial_response(event),
    EventType::Response => handler.on_response(event),
    EventType::RequestStatus => handler.on_request_status(event),
    EventType::AuthorizationStatus => handler.on_authorization_status(event),
    EventType::ResolutionStatus => handler.on_resolution_status(event),
    EventType::TopicStatus => handler.on_topic_status(event),
    EventType::TokenStatus => handler.on_token_status(event),
    EventType::Request => handler.on_request(event),
    EventType::Unknown => handler.on_unknown(event),
  };
  if let Err(e) = &result {
    error!("Handler {}: {}", handler.core().name(), e);
  }
  result
}

// --- RequestHandler ---

/// Handler for request/response traffic on one session.
pub struct RequestHandler {
  core: HandlerCore<dyn Request>,
}

impl RequestHandler {
  /// Create a session bound to a new handler and start it.
  pub fn start(
    name: &str,
    options: &SessionOptions,
    factory: &dyn SessionFactory,
  ) -> Result<Arc<Self>, BlpError> {
    let handler = Arc::new(RequestHandler { core: HandlerCore::new(name) });
    let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler) as Weak<dyn EventHandler>;
    let session = factory.create_session(options, weak)?;
    handler.core.attach_session(session)?;
    Ok(handler)
  }

  pub fn name(&self) -> &str {
    self.core.name()
  }

  pub fn current_load(&self) -> u64 {
    self.core.current_load()
  }

  /// Register `requests` now and return a future that sends them once the
  /// session and their services are ready.
  ///
  /// Registration happens before the future is polled, so the load of
  /// requests queued here is visible to the pool immediately. If a send
  /// fails, every request not yet sent is closed.
  pub fn send_requests(
    self: &Arc<Self>,
    requests: Vec<Arc<dyn Request>>,
  ) -> impl Future<Output = Result<(), BlpError>> + Send + 'static {
    let keyed: Vec<(CorrelationId, Arc<dyn Request>)> = requests
      .into_iter()
      .map(|request| (self.core.register(request.clone()), request))
      .collect();
    let handler = Arc::clone(self);

    async move {
      for (pos, (id, request)) in keyed.iter().enumerate() {
        if let Err(e) = handler.send_one(*id, request.as_ref()).await {
          error!("RequestHandler {}: failed to send {}: {}", handler.name(), request.request_name(), e);
          handler.core.close_requests(keyed[pos..].iter().map(|(id, _)| *id));
          return Err(e);
        }
      }
      Ok(())
    }
  }

  async fn send_one(&self, id: CorrelationId, request: &dyn Request) -> Result<(), BlpError> {
    self.core.wait_started().await?;
    let service = self.core.get_service(request.service_name()).await?;
    let wire = request.create(&service)?;
    debug!("RequestHandler {}: sending {} ({})", self.name(), wire.operation(), id);
    self.core.with_session(|session| session.send_request(wire, id))
  }

  /// True when `msg` is a request-level provider error.
  pub fn is_error_message(msg: &Message) -> bool {
    msg.has_element(names::RESPONSE_ERROR)
  }

  /// Forward each message to its request(s); on a final response, close
  /// every request touched afterwards.
  fn route_response(&self, event: &Event, is_final: bool) -> Result<(), BlpError> {
    let mut touched = Vec::new();
    for msg in event.messages() {
      let shared = Arc::new(msg.clone());
      for id in msg.correlation_ids() {
        let Some(request) = self.core.get_request(id) else {
          warn!("RequestHandler {}: {} for unknown correlation id {}", self.name(), msg.name(), id);
          continue;
        };
        if Self::is_error_message(msg) {
          warn!("RequestHandler {}: {} failed: {}", self.name(), request.request_name(), msg);
          self.core.close_requests([*id]);
          continue;
        }
        request.send_queue_message(Some(shared.clone()));
        if is_final {
          touched.push(*id);
        }
      }
    }
    self.core.close_requests(touched);
    Ok(())
  }

  pub fn stop_session(&self) -> Result<(), BlpError> {
    self.core.stop_session()
  }

  pub fn is_stopped(&self) -> bool {
    self.core.is_stopped()
  }

  pub async fn wait_stopped(&self) {
    self.core.wait_stopped().await
  }
}

impl HandlerEvents for RequestHandler {
  type Target = dyn Request;

  fn core(&self) -> &HandlerCore<dyn Request> {
    &self.core
  }

  fn on_partial_response(&self, event: &Event) -> Result<(), BlpError> {
    self.route_response(event, false)
  }

  fn on_response(&self, event: &Event) -> Result<(), BlpError> {
    self.route_response(event, true)
  }
}

impl EventHandler for RequestHandler {
  fn process_event(&self, event: &Event) -> Result<(), BlpError> {
    dispatch_event(self, event)
  }
}

// --- SubscriptionHandler ---

/// Handler for streaming subscriptions on one session.
pub struct SubscriptionHandler {
  core: HandlerCore<Subscription>,
  // Everything subscribed here, live or closed, until its last read.
  readable: Mutex<Vec<Arc<Subscription>>>,
}

impl SubscriptionHandler {
  pub fn start(
    name: &str,
    options: &SessionOptions,
    factory: &dyn SessionFactory,
  ) -> Result<Arc<Self>, BlpError> {
    let handler = Arc::new(SubscriptionHandler { core: HandlerCore::new(name), readable: Mutex::new(Vec::new()) });
    let weak: Weak<dyn EventHandler> = Arc::downgrade(&handler) as Weak<dyn EventHandler>;
    let session = factory.create_session(options, weak)?;
    handler.core.attach_session(session)?;
    Ok(handler)
  }

  pub fn name(&self) -> &str {
    self.core.name()
  }

  pub fn current_load(&self) -> u64 {
    self.core.current_load()
  }

  pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
    self.core.registered().into_iter().map(|(_, s)| s).collect()
  }

  /// Register `subscriptions` now and return a future that subscribes them
  /// in one batch once the session has started.
  ///
  /// No service is opened first: the provider opens streaming services on
  /// its own when the subscription list arrives.
  pub fn subscribe(
    self: &Arc<Self>,
    subscriptions: Vec<Arc<Subscription>>,
  ) -> impl Future<Output = Result<(), BlpError>> + Send + 'static {
    self.readable.lock().extend(subscriptions.iter().cloned());
    let keyed: Vec<(CorrelationId, Arc<Subscription>)> = subscriptions
      .into_iter()
      .map(|sub| (self.core.register(sub.clone()), sub))
      .collect();
    let handler = Arc::clone(self);

    async move {
      let result = handler.subscribe_all(&keyed).await;
      if let Err(e) = &result {
        error!("SubscriptionHandler {}: subscribe failed: {}", handler.name(), e);
        handler.core.close_requests(keyed.iter().map(|(id, _)| *id));
      }
      result
    }
  }

  async fn subscribe_all(&self, keyed: &[(CorrelationId, Arc<Subscription>)]) -> Result<(), BlpError> {
    self.core.wait_started().await?;
    let mut list = SubscriptionList::new();
    for (id, sub) in keyed {
      for entry in sub.create_subscription(*id).entries() {
        list.add(&entry.topic, &entry.fields, entry.options.clone(), entry.correlation_id);
      }
    }
    debug!("SubscriptionHandler {}: subscribing {} topic(s)", self.name(), list.len());
    self.core.with_session(|session| session.subscribe(list))
  }

  /// Snapshot every subscription into one table.
  ///
  /// A subscription closed by the handler (session stopped, subscribe
  /// failed) is read one last time, so ticks buffered before the close are
  /// not lost, and is then forgotten.
  pub async fn read_subscriptions(&self) -> Result<DataTable<String>, BlpError> {
    let subscriptions = self.readable.lock().clone();
    let mut table = DataTable::new();
    for sub in &subscriptions {
      table.merge(sub.process().await?);
    }

    let drained: Vec<&Arc<Subscription>> = subscriptions.iter().filter(|sub| sub.is_closed()).collect();
    if !drained.is_empty() {
      debug!("SubscriptionHandler {}: forgetting {} closed subscription(s)", self.name(), drained.len());
      self.readable.lock().retain(|sub| !drained.iter().any(|done| Arc::ptr_eq(done, sub)));
    }
    Ok(table)
  }

  pub fn stop_session(&self) -> Result<(), BlpError> {
    self.core.stop_session()
  }

  pub fn is_stopped(&self) -> bool {
    self.core.is_stopped()
  }

  pub async fn wait_stopped(&self) {
    self.core.wait_stopped().await
  }
}

impl HandlerEvents for SubscriptionHandler {
  type Target = Subscription;

  fn core(&self) -> &HandlerCore<Subscription> {
    &self.core
  }

  fn on_subscription_status(&self, event: &Event) -> Result<(), BlpError> {
    for msg in event.messages() {
      match msg.name() {
        names::SUBSCRIPTION_STARTED | names::SUBSCRIPTION_STREAMS_ACTIVATED => {
          debug!("SubscriptionHandler {}: {} for {:?}", self.name(), msg.name(), msg.correlation_ids());
        }
        _ => return Err(unexpected_message(self.name(), event, msg)),
      }
    }
    Ok(())
  }

  /// Ticks go to the subscriptions whose keys they carry. A tick without a
  /// known key is broadcast to every subscription.
  fn on_subscription_data(&self, event: &Event) -> Result<(), BlpError> {
    for msg in event.messages() {
      let shared = Arc::new(msg.clone());
      let mut targets: Vec<Arc<Subscription>> = msg
        .correlation_ids()
        .iter()
        .filter_map(|id| self.core.get_request(id))
        .collect();
      if targets.is_empty() {
        trace!("SubscriptionHandler {}: broadcasting {}", self.name(), msg.name());
        targets = self.subscriptions();
      }
      for sub in targets {
        sub.send_queue_message(Some(shared.clone()));
      }
    }
    Ok(())
  }
}

impl EventHandler for SubscriptionHandler {
  fn process_event(&self, event: &Event) -> Result<(), BlpError> {
    dispatch_event(self, event)
  }
}
