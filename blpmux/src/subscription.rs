// blpmux/src/subscription.rs
// Streaming market data subscription for a single security.

use crate::base::BlpError;
use crate::data::{DataTable, Overrides, SecurityIdType};
use crate::event::CorrelationId;
use crate::names;
use crate::parser::parse_field_data;
use crate::request::{Inbox, Request, RequestOptions, TryNext};
use crate::session::{Service, SubscriptionList, WireRequest};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};

/// Ticks for one security on //blp/mktdata.
///
/// The stream never ends on its own, so `process()` returns whatever is
/// buffered at call time instead of waiting for a sentinel.
#[derive(Debug)]
pub struct Subscription {
  security: String,
  topic: String,
  fields: Vec<String>,
  overrides: Overrides,
  options: RequestOptions,
  inbox: Inbox,
  closed: AtomicBool,
}

impl Subscription {
  pub fn new(
    security: &str,
    fields: Vec<String>,
    security_id_type: Option<SecurityIdType>,
    overrides: Overrides,
  ) -> Self {
    let topic = match security_id_type {
      Some(id_type) => id_type.add_type(security),
      None => security.to_string(),
    };
    let mut options = RequestOptions::new();
    options.insert(names::FIELDS, fields.clone());
    options.extend_overrides(&overrides);
    Subscription {
      security: security.to_string(),
      topic,
      fields,
      overrides,
      options,
      inbox: Inbox::new(),
      closed: AtomicBool::new(false),
    }
  }

  pub fn security(&self) -> &str {
    &self.security
  }

  pub fn topic(&self) -> &str {
    &self.topic
  }

  pub fn fields(&self) -> &[String] {
    &self.fields
  }

  /// True once the handler has closed this subscription.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Subscription list entry carrying `correlation_id`.
  pub fn create_subscription(&self, correlation_id: CorrelationId) -> SubscriptionList {
    let mut list = SubscriptionList::new();
    let options = self.overrides.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    list.add(&self.topic, &self.fields, options, correlation_id);
    list
  }

  /// Drain buffered ticks into a one-row table keyed by this security.
  ///
  /// Later ticks overwrite earlier ones for the same field.
  pub async fn process(&self) -> Result<DataTable<String>, BlpError> {
    let mut table = DataTable::with_columns(&self.fields);
    let mut reader = self.inbox.reader().await;
    loop {
      match reader.try_next() {
        TryNext::Message(msg) => {
          debug!("Subscription {}: tick {}", self.security, msg.name());
          for field in msg.as_element().elements() {
            let (name, value) = parse_field_data(field);
            table.set(self.security.clone(), &name, value);
          }
        }
        TryNext::Sentinel => {
          self.closed.store(true, Ordering::Release);
          break;
        }
        TryNext::Empty => break,
      }
    }
    Ok(table)
  }
}

impl Request for Subscription {
  fn service_name(&self) -> &str {
    names::MKTDATA_SERVICE
  }

  fn request_name(&self) -> &str {
    "Subscription"
  }

  fn options(&self) -> &RequestOptions {
    &self.options
  }

  fn inbox(&self) -> &Inbox {
    &self.inbox
  }

  fn weight(&self) -> u64 {
    self.fields.len() as u64
  }

  fn create(&self, _service: &Service) -> Result<WireRequest, BlpError> {
    warn!("Subscription {}: create() called, subscriptions go through create_subscription()", self.security);
    Err(BlpError::InvalidParameter("subscriptions are sent with create_subscription".to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::FieldValue;
  use crate::element::{Element, Value};
  use crate::event::Message;
  use std::sync::Arc;

  fn tick(values: &[(&str, f64)]) -> Option<Arc<Message>> {
    let children = values.iter().map(|(name, v)| Element::scalar(name, *v)).collect();
    Some(Arc::new(Message::new(Element::sequence(names::MARKET_DATA_EVENTS, children))))
  }

  #[tokio::test]
  async fn test_process_is_a_snapshot_of_buffered_ticks() {
    let sub = Subscription::new("US0378331005", vec!["BID".into(), "ASK".into()], Some(SecurityIdType::Isin), Overrides::new());
    assert_eq!(sub.topic(), "/isin/US0378331005");

    // Nothing buffered: returns immediately with no rows.
    assert!(sub.process().await.unwrap().is_empty());

    sub.send_queue_message(tick(&[("BID", 10.0), ("ASK", 10.2)]));
    sub.send_queue_message(tick(&[("BID", 10.1)]));
    let table = sub.process().await.unwrap();
    let key = "US0378331005".to_string();
    assert_eq!(table.get(&key, "BID"), Some(&FieldValue::Scalar(Value::Float(10.1))));
    assert_eq!(table.get(&key, "ASK"), Some(&FieldValue::Scalar(Value::Float(10.2))));

    // Drained: second call sees nothing new.
    assert!(sub.process().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_sentinel_marks_closed() {
    let sub = Subscription::new("F Equity", vec!["LAST_PRICE".into()], None, Overrides::new());
    sub.send_queue_message(None);
    sub.process().await.unwrap();
    assert!(sub.is_closed());
  }

  #[test]
  fn test_create_subscription_and_create() {
    let mut overrides = Overrides::new();
    overrides.insert("interval".into(), Value::Float(5.0));
    let sub = Subscription::new("F Equity", vec!["LAST_PRICE".into()], None, overrides);
    let id = CorrelationId::new();
    let list = sub.create_subscription(id);
    assert_eq!(list.len(), 1);
    let entry = &list.entries()[0];
    assert_eq!(entry.topic, "F Equity");
    assert_eq!(entry.correlation_id, id);
    assert_eq!(entry.options, vec![("interval".to_string(), Value::Float(5.0))]);

    assert!(matches!(sub.create(&Service::new(names::MKTDATA_SERVICE)), Err(BlpError::InvalidParameter(_))));
  }
}
