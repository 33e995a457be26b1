// blpmux/src/dispatcher.rs
// Pool of request handlers plus the bulk entry points built on top of it.

use crate::base::BlpError;
use crate::config::Config;
use crate::data::{DataTable, Overrides, SecurityIdType};
use crate::element::Value;
use crate::error_set::ErrorSet;
use crate::handler::{RequestHandler, SubscriptionHandler};
use crate::request::Request;
use crate::request_lookup::{FieldSearchRequest, InstrumentLookupRequest, LookupKind};
use crate::request_refdata::{HistoricalDataRequest, ReferenceDataRequest};
use crate::session::SessionFactory;
use crate::subscription::Subscription;
use chrono::NaiveDate;
use futures::future::{join, join_all};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Split `items` into chunks of at most `size` (the last one may be shorter).
pub fn split_into_chunks<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
  items.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

/// Fold chunk results into `table`, merging their error sets.
fn merge_results<K: Eq + Hash + Clone>(
  mut table: DataTable<K>,
  results: Vec<(DataTable<K>, ErrorSet)>,
) -> (DataTable<K>, ErrorSet) {
  let mut errors = ErrorSet::new();
  for (chunk, chunk_errors) in results {
    table.merge(chunk);
    errors += chunk_errors;
  }
  (table, errors)
}

/// Spreads bulk queries over at most `max_sessions` request sessions.
///
/// Handlers are created lazily and dropped once their session stops.
/// Subscriptions use one separate session.
pub struct Dispatcher {
  config: Config,
  session_factory: Arc<dyn SessionFactory>,
  request_handlers: Mutex<Vec<Arc<RequestHandler>>>,
  handlers_started: AtomicUsize,
  subscription_handler: Mutex<Option<Arc<SubscriptionHandler>>>,
  // Stopped subscription handlers whose buffered ticks are still unread.
  retired_subscriptions: Mutex<Vec<Arc<SubscriptionHandler>>>,
}

impl Dispatcher {
  pub fn new(config: Config, session_factory: Arc<dyn SessionFactory>) -> Result<Self, BlpError> {
    config.validate()?;
    info!(
      "Dispatcher: up to {} session(s) on {}:{}, chunks of {} securities x {} fields",
      config.max_sessions, config.host, config.port,
      config.max_securities_per_request, config.max_fields_per_request
    );
    Ok(Dispatcher {
      config,
      session_factory,
      request_handlers: Mutex::new(Vec::new()),
      handlers_started: AtomicUsize::new(0),
      subscription_handler: Mutex::new(None),
      retired_subscriptions: Mutex::new(Vec::new()),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn handlers(&self) -> Vec<Arc<RequestHandler>> {
    self.request_handlers.lock().clone()
  }

  // --- Pool ---

  /// Pick the handler for the next request: the first idle one, else a new
  /// one while the pool has room, else the least loaded (first wins ties).
  ///
  /// Handlers whose session has stopped are evicted first; they hold no
  /// requests and can never send again.
  pub fn choose_handler(&self) -> Result<Arc<RequestHandler>, BlpError> {
    let mut handlers = self.request_handlers.lock();
    handlers.retain(|handler| {
      let stopped = handler.is_stopped();
      if stopped {
        warn!("Dispatcher: dropping {}, its session has stopped", handler.name());
      }
      !stopped
    });

    if let Some(idle) = handlers.iter().find(|h| h.current_load() == 0) {
      debug!("Dispatcher: reusing idle handler {}", idle.name());
      return Ok(idle.clone());
    }

    if handlers.len() < self.config.max_sessions {
      let name = format!("handler-{}", self.handlers_started.fetch_add(1, Ordering::Relaxed));
      let handler = RequestHandler::start(&name, &self.config.session_options(), self.session_factory.as_ref())?;
      info!("Dispatcher: started {} ({}/{})", name, handlers.len() + 1, self.config.max_sessions);
      handlers.push(handler.clone());
      return Ok(handler);
    }

    handlers
      .iter()
      .min_by_key(|h| h.current_load())
      .cloned()
      .ok_or_else(|| BlpError::InternalError("handler pool is empty".into()))
  }

  /// Cartesian product of security chunks and field chunks.
  pub fn split_query(&self, securities: &[String], fields: &[String]) -> Vec<(Vec<String>, Vec<String>)> {
    let security_chunks = split_into_chunks(securities, self.config.max_securities_per_request);
    let field_chunks = split_into_chunks(fields, self.config.max_fields_per_request);
    let mut queries = Vec::with_capacity(security_chunks.len() * field_chunks.len());
    for security_chunk in &security_chunks {
      for field_chunk in &field_chunks {
        queries.push((security_chunk.clone(), field_chunk.clone()));
      }
    }
    queries
  }

  /// Send each request through the pool and run every `process` concurrently.
  ///
  /// Results come back in request order. A send failure closes the affected
  /// requests, so their `process` still completes; the first such failure is
  /// returned after everything has settled.
  async fn fan_out<Q, T, F, Fut>(&self, requests: Vec<Arc<Q>>, process: F) -> Result<Vec<T>, BlpError>
  where
    Q: Request + 'static,
    F: Fn(Arc<Q>) -> Fut,
    Fut: Future<Output = Result<T, BlpError>>,
  {
    let mut scheduled = Vec::with_capacity(requests.len());
    let mut sends = Vec::with_capacity(requests.len());
    let mut pool_error = None;

    for request in requests {
      match self.choose_handler() {
        Ok(handler) => {
          debug!("Dispatcher: {} -> {}", request.request_name(), handler.name());
          sends.push(handler.send_requests(vec![request.clone() as Arc<dyn Request>]));
          scheduled.push(request);
        }
        Err(e) => {
          pool_error = Some(e);
          break;
        }
      }
    }

    let processing = join_all(scheduled.into_iter().map(process));
    let (results, sent) = join(processing, join_all(sends)).await;

    if let Some(e) = pool_error {
      return Err(e);
    }
    for outcome in sent {
      outcome?;
    }
    results.into_iter().collect()
  }

  // --- Reference / historical data ---

  pub async fn get_reference_data(
    &self,
    securities: &[String],
    fields: &[String],
    security_id_type: Option<SecurityIdType>,
    overrides: Overrides,
  ) -> Result<(DataTable<String>, ErrorSet), BlpError> {
    let requests: Vec<Arc<ReferenceDataRequest>> = self
      .split_query(securities, fields)
      .into_iter()
      .map(|(chunk_securities, chunk_fields)| {
        Arc::new(ReferenceDataRequest::new(
          chunk_securities, chunk_fields, security_id_type, overrides.clone(), self.config.error_behaviour,
        ))
      })
      .collect();
    info!(
      "Dispatcher: reference data for {} securities x {} fields in {} request(s)",
      securities.len(), fields.len(), requests.len()
    );

    let results = self.fan_out(requests, |request| async move { request.process().await }).await?;
    Ok(merge_results(DataTable::with_columns(fields), results))
  }

  pub async fn get_historical_data(
    &self,
    securities: &[String],
    fields: &[String],
    start_date: NaiveDate,
    end_date: NaiveDate,
    security_id_type: Option<SecurityIdType>,
    overrides: Overrides,
  ) -> Result<(DataTable<(NaiveDate, String)>, ErrorSet), BlpError> {
    let requests = self
      .split_query(securities, fields)
      .into_iter()
      .map(|(chunk_securities, chunk_fields)| {
        HistoricalDataRequest::new(
          chunk_securities, chunk_fields, start_date, end_date,
          security_id_type, overrides.clone(), self.config.error_behaviour,
        )
        .map(Arc::new)
      })
      .collect::<Result<Vec<_>, BlpError>>()?;
    info!(
      "Dispatcher: history {}..{} for {} securities x {} fields in {} request(s)",
      start_date, end_date, securities.len(), fields.len(), requests.len()
    );

    let results = self.fan_out(requests, |request| async move { request.process().await }).await?;
    Ok(merge_results(DataTable::with_columns(fields), results))
  }

  // --- Lookups ---

  pub async fn lookup(
    &self,
    kind: LookupKind,
    query: &str,
    max_results: u32,
    options: BTreeMap<String, Value>,
  ) -> Result<(DataTable<usize>, ErrorSet), BlpError> {
    info!("Dispatcher: {:?} lookup for {:?}", kind, query);
    let request = Arc::new(InstrumentLookupRequest::new(kind, query, max_results, options));
    let mut results = self.fan_out(vec![request], |request| async move { request.process().await }).await?;
    results.pop().ok_or_else(|| BlpError::InternalError("lookup produced no result".into()))
  }

  pub async fn security_lookup(
    &self,
    query: &str,
    max_results: u32,
    options: BTreeMap<String, Value>,
  ) -> Result<(DataTable<usize>, ErrorSet), BlpError> {
    self.lookup(LookupKind::Security, query, max_results, options).await
  }

  pub async fn curve_lookup(
    &self,
    query: &str,
    max_results: u32,
    options: BTreeMap<String, Value>,
  ) -> Result<(DataTable<usize>, ErrorSet), BlpError> {
    self.lookup(LookupKind::Curve, query, max_results, options).await
  }

  pub async fn government_lookup(
    &self,
    query: &str,
    max_results: u32,
    options: BTreeMap<String, Value>,
  ) -> Result<(DataTable<usize>, ErrorSet), BlpError> {
    self.lookup(LookupKind::Government, query, max_results, options).await
  }

  pub async fn search_fields(
    &self,
    query: &str,
    overrides: BTreeMap<String, Value>,
  ) -> Result<(DataTable<String>, ErrorSet), BlpError> {
    info!("Dispatcher: field search for {:?}", query);
    let request = Arc::new(FieldSearchRequest::new(query, overrides));
    let mut results = self.fan_out(vec![request], |request| async move { request.process().await }).await?;
    results.pop().ok_or_else(|| BlpError::InternalError("field search produced no result".into()))
  }

  // --- Subscriptions ---

  fn subscription_handler(&self) -> Result<Arc<SubscriptionHandler>, BlpError> {
    let mut slot = self.subscription_handler.lock();
    if let Some(handler) = slot.as_ref() {
      if !handler.is_stopped() {
        return Ok(handler.clone());
      }
    }
    if let Some(stopped) = slot.take() {
      warn!("Dispatcher: replacing {}, its session has stopped", stopped.name());
      self.retired_subscriptions.lock().push(stopped);
    }
    let name = format!("subscriptions-{}", self.handlers_started.fetch_add(1, Ordering::Relaxed));
    let handler = SubscriptionHandler::start(&name, &self.config.session_options(), self.session_factory.as_ref())?;
    *slot = Some(handler.clone());
    Ok(handler)
  }

  /// Subscribe to `fields` for every security, one subscription each.
  pub async fn subscribe(
    &self,
    securities: &[String],
    fields: &[String],
    security_id_type: Option<SecurityIdType>,
    overrides: Overrides,
  ) -> Result<(), BlpError> {
    let handler = self.subscription_handler()?;
    let subscriptions = securities
      .iter()
      .map(|security| Arc::new(Subscription::new(security, fields.to_vec(), security_id_type, overrides.clone())))
      .collect();
    info!("Dispatcher: subscribing {} securities x {} fields", securities.len(), fields.len());
    handler.subscribe(subscriptions).await
  }

  /// Ticks buffered since the last read, one row per subscribed security.
  ///
  /// Ticks received before a subscription session stopped are still
  /// returned by the next read; after that the stopped session is forgotten.
  pub async fn read_subscriptions(&self) -> Result<DataTable<String>, BlpError> {
    let retired: Vec<Arc<SubscriptionHandler>> = std::mem::take(&mut *self.retired_subscriptions.lock());
    let current = self.subscription_handler.lock().clone();

    let mut table = DataTable::new();
    for handler in retired.iter().chain(current.iter()) {
      table.merge(handler.read_subscriptions().await?);
    }
    Ok(table)
  }

  // --- Shutdown ---

  /// Stop every session and wait until each one reports it stopped. The pool
  /// is emptied, so later queries start fresh sessions.
  pub async fn stop(&self) {
    let handlers: Vec<Arc<RequestHandler>> = std::mem::take(&mut *self.request_handlers.lock());
    let subscription_handler = self.subscription_handler.lock().take();
    info!("Dispatcher: stopping {} request session(s)", handlers.len());

    let mut stopping = Vec::new();
    for handler in handlers {
      match handler.stop_session() {
        Ok(()) => stopping.push(handler),
        Err(e) if !handler.is_stopped() => warn!("Dispatcher: cannot stop {}: {}", handler.name(), e),
        Err(_) => {}
      }
    }
    let subscription_handler = subscription_handler.filter(|handler| match handler.stop_session() {
      Ok(()) => true,
      Err(e) => {
        warn!("Dispatcher: cannot stop {}: {}", handler.name(), e);
        false
      }
    });

    let waits = join_all(stopping.iter().map(|handler| handler.wait_stopped()));
    let subscription_wait = async {
      if let Some(handler) = &subscription_handler {
        handler.wait_stopped().await;
      }
    };
    join(waits, subscription_wait).await;
    info!("Dispatcher: all sessions stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::FieldValue;
  use crate::element::Element;
  use crate::error_set::ErrorBehaviour;
  use crate::event::{CorrelationId, Event, EventType, Message};
  use crate::names;
  use crate::parser::fixtures::*;
  use crate::request_lookup::fixtures::{field_search_result, lookup_result};
  use crate::session::WireRequest;
  use crate::session_mock::{response_error, MockSessionFactory};
  use std::collections::HashSet;
  use std::time::Duration;

  fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  /// Deterministic value for a (security, field) cell.
  fn cell_value(security: &str, field: &str) -> f64 {
    (security.len() * 10 + field.len()) as f64 + 0.5
  }

  /// Provider stand-in: answers every operation from the request itself.
  /// Securities starting with "BAD" are invalid; "PX_LAST" on "F Equity" is 10.2.
  fn provider(request: &WireRequest, id: CorrelationId) -> Vec<Event> {
    let securities = request.get_list_as_strings(names::SECURITIES);
    let fields = request.get_list_as_strings(names::FIELDS);
    let respond = |element: Element| Event::new(EventType::Response, vec![Message::new(element).with_correlation_id(id)]);

    match request.operation() {
      "ReferenceDataRequest" => {
        let data = securities
          .iter()
          .map(|security| {
            if security.starts_with("BAD") {
              return invalid_security_data(security);
            }
            let cells = fields
              .iter()
              .map(|field| {
                let value = if security == "F Equity" && field == "PX_LAST" { 10.2 } else { cell_value(security, field) };
                Element::scalar(field, value)
              })
              .collect();
            Element::sequence(names::SECURITY_DATA, vec![
              Element::scalar(names::SECURITY, security.as_str()),
              Element::sequence(names::FIELD_DATA, cells),
            ])
          })
          .collect();
        vec![respond(Element::sequence(names::REFERENCE_DATA_RESPONSE, vec![
          Element::array(names::SECURITY_DATA, data),
        ]))]
      }
      "HistoricalDataRequest" => {
        // Data only for the first and third day of the range.
        let start = request
          .get_list_as_strings(names::START_DATE)
          .first()
          .and_then(|s| Value::from(s.as_str()).as_date())
          .unwrap();
        let messages = securities
          .iter()
          .map(|security| {
            let sd = historical_security_data(security, &fields[0], &[
              (start, 1.0),
              (start + chrono::Duration::days(2), 3.0),
            ]);
            Message::new(Element::sequence(names::HISTORICAL_DATA_RESPONSE, vec![sd])).with_correlation_id(id)
          })
          .collect();
        vec![Event::new(EventType::Response, messages)]
      }
      "instrumentListRequest" => vec![respond(lookup_result(LookupKind::Security, &[
        &["F US<equity>", "Ford Motor Co"],
        &["FDX US<equity>", "FedEx Corp"],
      ]))],
      "curveListRequest" => vec![respond(lookup_result(LookupKind::Curve, &[
        &["US Treasury Actives Curve", "US", "USD", "YCGT0025", "GOVT", "SOVEREIGN", "Bloomberg", "BBG00X"],
      ]))],
      "govtListRequest" => vec![respond(lookup_result(LookupKind::Government, &[
        &["912828YK0 Govt", "US TREASURY N/B", "T"],
      ]))],
      "CategorizedFieldSearchRequest" => vec![respond(field_search_result(&[
        ("PR005", "PX_LAST", "Last Price"),
      ]))],
      other => vec![response_error(id, &format!("unsupported {}", other))],
    }
  }

  fn dispatcher_with(config: Config) -> (Dispatcher, Arc<MockSessionFactory>) {
    let factory = Arc::new(MockSessionFactory::new(provider));
    let dispatcher = Dispatcher::new(config, factory.clone()).unwrap();
    (dispatcher, factory)
  }

  fn dispatcher() -> (Dispatcher, Arc<MockSessionFactory>) {
    dispatcher_with(Config::default())
  }

  /// Factory whose sessions start but never answer, for pool tests.
  fn silent_dispatcher(max_sessions: usize) -> Dispatcher {
    let factory = Arc::new(MockSessionFactory::new(|_: &WireRequest, _: CorrelationId| -> Vec<Event> { Vec::new() }));
    Dispatcher::new(Config { max_sessions, ..Config::default() }, factory).unwrap()
  }

  fn weighted_request(weight: usize) -> Arc<dyn Request> {
    let securities = (0..weight).map(|i| format!("S{} Equity", i)).collect();
    Arc::new(ReferenceDataRequest::new(securities, strings(&["PX_LAST"]), None, Overrides::new(), ErrorBehaviour::Return))
  }

  async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut).await.expect("timed out")
  }

  #[test]
  fn test_split_query_example() {
    let config = Config { max_securities_per_request: 2, max_fields_per_request: 2, ..Config::default() };
    let (dispatcher, _) = dispatcher_with(config);
    let queries = dispatcher.split_query(&strings(&["s1", "s2", "s3"]), &strings(&["f1", "f2", "f3"]));
    assert_eq!(queries, vec![
      (strings(&["s1", "s2"]), strings(&["f1", "f2"])),
      (strings(&["s1", "s2"]), strings(&["f3"])),
      (strings(&["s3"]), strings(&["f1", "f2"])),
      (strings(&["s3"]), strings(&["f3"])),
    ]);
  }

  #[test]
  fn test_split_query_covers_product_exactly_once() {
    for chunk in 1..4usize {
      let config = Config { max_securities_per_request: chunk, max_fields_per_request: chunk, ..Config::default() };
      let (dispatcher, _) = dispatcher_with(config);
      for n in 0..7usize {
        for m in 0..7usize {
          let securities: Vec<String> = (0..n).map(|i| format!("s{}", i)).collect();
          let fields: Vec<String> = (0..m).map(|i| format!("f{}", i)).collect();
          let queries = dispatcher.split_query(&securities, &fields);
          assert_eq!(queries.len(), n.div_ceil(chunk) * m.div_ceil(chunk));

          let mut seen = HashSet::new();
          for (qs, qf) in &queries {
            assert!(qs.len() <= chunk && qf.len() <= chunk);
            for s in qs {
              for f in qf {
                assert!(seen.insert((s.clone(), f.clone())), "duplicate ({}, {})", s, f);
              }
            }
          }
          assert_eq!(seen.len(), n * m);
        }
      }
    }
  }

  #[test]
  fn test_split_into_chunks() {
    assert_eq!(split_into_chunks(&[1, 2, 3, 4, 5], 2), vec![vec![1, 2], vec![3, 4], vec![5]]);
    assert!(split_into_chunks::<i32>(&[], 3).is_empty());
  }

  #[tokio::test]
  async fn test_choose_handler_reuses_idle_handler() {
    let dispatcher = silent_dispatcher(3);
    let first = dispatcher.choose_handler().unwrap();
    let again = dispatcher.choose_handler().unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(dispatcher.handlers().len(), 1);
  }

  #[tokio::test]
  async fn test_choose_handler_picks_least_loaded_when_full() {
    let dispatcher = silent_dispatcher(2);

    let handler_1 = dispatcher.choose_handler().unwrap();
    let _pending_1 = handler_1.send_requests(vec![weighted_request(2)]);
    let handler_2 = dispatcher.choose_handler().unwrap();
    assert!(!Arc::ptr_eq(&handler_1, &handler_2));
    let _pending_2 = handler_2.send_requests(vec![weighted_request(6)]);
    assert_eq!((handler_1.current_load(), handler_2.current_load()), (2, 6));

    let chosen = dispatcher.choose_handler().unwrap();
    assert!(Arc::ptr_eq(&chosen, &handler_1));
    assert_eq!(dispatcher.handlers().len(), 2);

    // Equal loads: the first handler wins.
    let _pending_3 = handler_1.send_requests(vec![weighted_request(4)]);
    let chosen = dispatcher.choose_handler().unwrap();
    assert!(Arc::ptr_eq(&chosen, &handler_1));
  }

  #[tokio::test]
  async fn test_choose_handler_never_skips_an_idle_handler() {
    let dispatcher = silent_dispatcher(3);
    let busy = dispatcher.choose_handler().unwrap();
    let _pending = busy.send_requests(vec![weighted_request(1)]);
    let idle = dispatcher.choose_handler().unwrap();
    assert_eq!(idle.current_load(), 0);
    // The idle one is reused instead of growing the pool.
    let again = dispatcher.choose_handler().unwrap();
    assert!(Arc::ptr_eq(&idle, &again));
    assert_eq!(dispatcher.handlers().len(), 2);
  }

  #[tokio::test]
  async fn test_reference_data_single_value() {
    let (dispatcher, _) = dispatcher();
    let (table, errors) = within(dispatcher.get_reference_data(
      &strings(&["F Equity"]), &strings(&["PX_LAST"]), None, Overrides::new(),
    ))
    .await
    .unwrap();

    assert_eq!(table.index(), &["F Equity".to_string()]);
    assert_eq!(table.columns(), &["PX_LAST".to_string()]);
    assert_eq!(table.get(&"F Equity".to_string(), "PX_LAST"), Some(&FieldValue::Scalar(Value::Float(10.2))));
    assert!(errors.is_empty());
  }

  #[tokio::test]
  async fn test_reference_data_chunks_and_merges() {
    let config = Config {
      max_sessions: 2,
      max_securities_per_request: 2,
      max_fields_per_request: 2,
      ..Config::default()
    };
    let (dispatcher, factory) = dispatcher_with(config);
    let securities = strings(&["GM Equity", "TSLA Equity", "IBM Equity"]);
    let fields = strings(&["PX_LAST", "NAME", "CUR_MKT_CAP"]);

    let (table, errors) = within(dispatcher.get_reference_data(&securities, &fields, None, Overrides::new()))
      .await
      .unwrap();
    assert!(errors.is_empty());
    assert_eq!(table.len(), 3);
    assert_eq!(table.columns(), fields.as_slice());
    for security in &securities {
      for field in &fields {
        assert_eq!(
          table.get(security, field),
          Some(&FieldValue::Scalar(Value::Float(cell_value(security, field)))),
          "{} / {}", security, field
        );
      }
    }

    assert!(dispatcher.handlers().len() <= 2);
    let sent: usize = factory.sessions().iter().map(|s| s.sent_requests().len()).sum();
    assert_eq!(sent, 4);
    assert!(dispatcher.handlers().iter().all(|h| h.current_load() == 0));
  }

  #[tokio::test]
  async fn test_invalid_security_under_return_and_raise() {
    let (dispatcher, _) = dispatcher();
    let (table, errors) = within(dispatcher.get_reference_data(
      &strings(&["F Equity", "BAD Equity"]), &strings(&["PX_LAST"]), None, Overrides::new(),
    ))
    .await
    .unwrap();
    assert!(errors.invalid_securities().contains("BAD Equity"));
    assert!(!table.contains_row(&"BAD Equity".to_string()));
    assert!(table.contains_row(&"F Equity".to_string()));

    let (raising, _) = dispatcher_with(Config { error_behaviour: ErrorBehaviour::Raise, ..Config::default() });
    let result = within(raising.get_reference_data(
      &strings(&["BAD Equity"]), &strings(&["PX_LAST"]), None, Overrides::new(),
    ))
    .await;
    match result {
      Err(BlpError::DataError(errors)) => assert!(errors.invalid_securities().contains("BAD Equity")),
      other => panic!("expected DataError, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_security_id_type_is_applied_and_stripped() {
    let (dispatcher, factory) = dispatcher();
    let (table, _) = within(dispatcher.get_reference_data(
      &strings(&["US0378331005"]), &strings(&["PX_LAST"]), Some(SecurityIdType::Isin), Overrides::new(),
    ))
    .await
    .unwrap();
    let sent = factory.sessions()[0].sent_requests();
    assert_eq!(sent[0].0.get_list_as_strings(names::SECURITIES), vec!["/isin/US0378331005"]);
    assert!(table.contains_row(&"US0378331005".to_string()));
  }

  #[tokio::test]
  async fn test_historical_keeps_empty_days() {
    let (dispatcher, _) = dispatcher();
    let start = date(2019, 1, 1);
    let (table, errors) = within(dispatcher.get_historical_data(
      &strings(&["F Equity", "GM Equity"]), &strings(&["PX_LAST"]), start, date(2019, 1, 4), None, Overrides::new(),
    ))
    .await
    .unwrap();

    assert!(errors.is_empty());
    assert_eq!(table.len(), 8);
    let key = |d: NaiveDate, s: &str| (d, s.to_string());
    assert_eq!(table.get(&key(start, "GM Equity"), "PX_LAST"), Some(&FieldValue::Scalar(Value::Float(1.0))));
    assert_eq!(table.get(&key(date(2019, 1, 3), "F Equity"), "PX_LAST"), Some(&FieldValue::Scalar(Value::Float(3.0))));
    assert!(table.row(&key(date(2019, 1, 2), "F Equity")).unwrap().is_empty());
    assert!(table.row(&key(date(2019, 1, 4), "GM Equity")).unwrap().is_empty());

    let bad_range = dispatcher
      .get_historical_data(&strings(&["F Equity"]), &strings(&["PX_LAST"]), date(2019, 2, 1), start, None, Overrides::new())
      .await;
    assert!(matches!(bad_range, Err(BlpError::InvalidParameter(_))));
  }

  #[tokio::test]
  async fn test_lookups_and_field_search() {
    let (dispatcher, factory) = dispatcher();

    let (securities, _) = within(dispatcher.security_lookup("F", 10, BTreeMap::new())).await.unwrap();
    assert_eq!(securities.len(), 2);
    assert_eq!(securities.get(&1, "description"), Some(&FieldValue::Scalar(Value::from("FedEx Corp"))));

    let (curves, _) = within(dispatcher.curve_lookup("treasury", 5, BTreeMap::new())).await.unwrap();
    assert_eq!(curves.columns().len(), 8);
    assert_eq!(curves.get(&0, "curveid"), Some(&FieldValue::Scalar(Value::from("YCGT0025"))));

    let (govts, _) = within(dispatcher.government_lookup("T", 5, BTreeMap::new())).await.unwrap();
    assert_eq!(govts.get(&0, "ticker"), Some(&FieldValue::Scalar(Value::from("T"))));

    let (fields, errors) = within(dispatcher.search_fields("last price", BTreeMap::new())).await.unwrap();
    assert!(errors.is_empty());
    assert_eq!(fields.get(&"PR005".to_string(), "mnemonic"), Some(&FieldValue::Scalar(Value::from("PX_LAST"))));

    // Each service is opened once per session.
    let opened: Vec<String> = factory.sessions()[0].opened_services();
    assert_eq!(opened, vec![names::INSTRUMENTS_SERVICE.to_string(), names::APIFLDS_SERVICE.to_string()]);
  }

  #[tokio::test]
  async fn test_subscribe_and_read_snapshot() {
    let (dispatcher, factory) = dispatcher();
    assert!(dispatcher.read_subscriptions().await.unwrap().is_empty());

    within(dispatcher.subscribe(
      &strings(&["F Equity", "GM Equity"]), &strings(&["LAST_PRICE"]), None, Overrides::new(),
    ))
    .await
    .unwrap();

    let session = factory.sessions()[0].clone();
    let lists = session.subscriptions();
    let ford = lists[0].entries().iter().find(|e| e.topic == "F Equity").unwrap().correlation_id;
    let tick = Message::new(Element::sequence(names::MARKET_DATA_EVENTS, vec![Element::scalar("LAST_PRICE", 12.5)]))
      .with_correlation_id(ford);
    session.inject(Event::new(EventType::SubscriptionData, vec![tick])).unwrap();

    let mut table = DataTable::new();
    for _ in 0..200 {
      table = dispatcher.read_subscriptions().await.unwrap();
      if !table.is_empty() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(table.index(), &["F Equity".to_string()]);
    assert_eq!(table.get(&"F Equity".to_string(), "LAST_PRICE"), Some(&FieldValue::Scalar(Value::Float(12.5))));
    assert!(session.fatal_errors().is_empty());
  }

  /// Poll until `done` holds; sessions report on their own thread.
  async fn eventually(done: impl Fn() -> bool) {
    within(async {
      while !done() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
  }

  fn connection_down() -> Event {
    Event::new(EventType::SessionStatus, vec![Message::new(Element::sequence(names::SESSION_CONNECTION_DOWN, vec![]))])
  }

  #[tokio::test]
  async fn test_stopped_handler_is_replaced() {
    let (dispatcher, factory) = dispatcher_with(Config { max_sessions: 2, ..Config::default() });
    let (securities, fields) = (strings(&["F Equity"]), strings(&["PX_LAST"]));
    let query = || dispatcher.get_reference_data(&securities, &fields, None, Overrides::new());
    within(query()).await.unwrap();
    let dead = dispatcher.handlers()[0].clone();

    factory.sessions()[0].inject(connection_down()).unwrap();
    eventually(|| dead.is_stopped()).await;
    assert_eq!(dead.current_load(), 0);

    for _ in 0..3 {
      let (table, errors) = within(query()).await.unwrap();
      assert!(errors.is_empty());
      assert_eq!(table.get(&"F Equity".to_string(), "PX_LAST"), Some(&FieldValue::Scalar(Value::Float(10.2))));
    }
    let handlers = dispatcher.handlers();
    assert_eq!(handlers.len(), 1);
    assert!(!Arc::ptr_eq(&handlers[0], &dead));
    assert_ne!(handlers[0].name(), dead.name());
    assert_eq!(factory.sessions().len(), 2);
  }

  #[tokio::test]
  async fn test_stopped_subscription_session_is_replaced() {
    let (dispatcher, factory) = dispatcher();
    within(dispatcher.subscribe(&strings(&["F Equity"]), &strings(&["LAST_PRICE"]), None, Overrides::new()))
      .await
      .unwrap();
    let first = factory.sessions()[0].clone();
    let ford = first.subscriptions()[0].entries()[0].correlation_id;
    let tick = Message::new(Element::sequence(names::MARKET_DATA_EVENTS, vec![Element::scalar("LAST_PRICE", 12.5)]))
      .with_correlation_id(ford);
    first.inject(Event::new(EventType::SubscriptionData, vec![tick])).unwrap();
    first.inject(connection_down()).unwrap();
    eventually(|| dispatcher.subscription_handler.lock().as_ref().is_some_and(|h| h.is_stopped())).await;

    within(dispatcher.subscribe(&strings(&["GM Equity"]), &strings(&["LAST_PRICE"]), None, Overrides::new()))
      .await
      .unwrap();
    assert_eq!(factory.sessions().len(), 2);
    assert_eq!(factory.sessions()[1].subscriptions().len(), 1);

    // The tick from the stopped session is read once, then forgotten.
    let table = dispatcher.read_subscriptions().await.unwrap();
    assert_eq!(table.get(&"F Equity".to_string(), "LAST_PRICE"), Some(&FieldValue::Scalar(Value::Float(12.5))));
    let table = dispatcher.read_subscriptions().await.unwrap();
    assert!(!table.contains_row(&"F Equity".to_string()));
  }

  #[tokio::test]
  async fn test_stop_waits_for_every_session() {
    let config = Config { max_sessions: 2, max_securities_per_request: 1, ..Config::default() };
    let (dispatcher, _) = dispatcher_with(config);
    within(dispatcher.get_reference_data(&strings(&["F Equity", "GM Equity"]), &strings(&["PX_LAST"]), None, Overrides::new()))
      .await
      .unwrap();
    within(dispatcher.subscribe(&strings(&["F Equity"]), &strings(&["LAST_PRICE"]), None, Overrides::new()))
      .await
      .unwrap();

    let handlers = dispatcher.handlers();
    assert!(!handlers.is_empty());
    within(dispatcher.stop()).await;
    assert!(handlers.iter().all(|h| h.is_stopped()));
    assert!(dispatcher.handlers().is_empty());
  }

  #[test]
  fn test_rejects_invalid_config() {
    let factory = Arc::new(MockSessionFactory::new(provider));
    let result = Dispatcher::new(Config { max_sessions: 0, ..Config::default() }, factory);
    assert!(matches!(result, Err(BlpError::ConfigurationError(_))));
  }
}
