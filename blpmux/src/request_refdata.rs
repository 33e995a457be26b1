// blpmux/src/request_refdata.rs
// Reference and historical data requests on //blp/refdata.

use crate::base::BlpError;
use crate::data::{DataTable, Overrides, SecurityIdType};
use crate::element::Value;
use crate::error_set::{ErrorBehaviour, ErrorSet};
use crate::names;
use crate::parser::{parse_errors, parse_historical_security_data, parse_reference_security_data};
use crate::request::{Inbox, Request, RequestOptions};
use chrono::{Duration, NaiveDate};
use log::debug;

/// Securities with the id-type prefix applied (if any).
fn prefixed(securities: &[String], security_id_type: Option<SecurityIdType>) -> Vec<String> {
  match security_id_type {
    Some(id_type) => securities.iter().map(|s| id_type.add_type(s)).collect(),
    None => securities.to_vec(),
  }
}

fn base_options(securities: &[String], fields: &[String], overrides: &Overrides) -> RequestOptions {
  let mut options = RequestOptions::new();
  options.insert(names::SECURITIES, securities.to_vec());
  options.insert(names::FIELDS, fields.to_vec());
  options.extend_overrides(overrides);
  options
}

// --- ReferenceDataRequest ---

/// Snapshot of `fields` for each of `securities`.
///
/// The result table is indexed by the (unprefixed) security id. A security
/// that comes back invalid contributes no row.
#[derive(Debug)]
pub struct ReferenceDataRequest {
  securities: Vec<String>,
  fields: Vec<String>,
  security_id_type: Option<SecurityIdType>,
  error_behaviour: ErrorBehaviour,
  options: RequestOptions,
  inbox: Inbox,
}

impl ReferenceDataRequest {
  pub fn new(
    securities: Vec<String>,
    fields: Vec<String>,
    security_id_type: Option<SecurityIdType>,
    overrides: Overrides,
    error_behaviour: ErrorBehaviour,
  ) -> Self {
    let options = base_options(&prefixed(&securities, security_id_type), &fields, &overrides);
    ReferenceDataRequest {
      securities,
      fields,
      security_id_type,
      error_behaviour,
      options,
      inbox: Inbox::new(),
    }
  }

  pub fn securities(&self) -> &[String] {
    &self.securities
  }

  pub fn fields(&self) -> &[String] {
    &self.fields
  }

  /// Reduce queued messages until the sentinel.
  pub async fn process(&self) -> Result<(DataTable<String>, ErrorSet), BlpError> {
    let mut table = DataTable::with_columns(&self.fields);
    let mut errors = ErrorSet::new();
    let mut reader = self.inbox.reader().await;

    while let Some(msg) = reader.next().await {
      debug!("ReferenceDataRequest: processing {}", msg.name());
      for security_data in msg.get_element(names::SECURITY_DATA)?.values_or_self() {
        let (security_id, row) = parse_reference_security_data(security_data, self.security_id_type)?;
        for (field, value) in row {
          table.set(security_id.clone(), &field, value);
        }
        if let Some(security_errors) = parse_errors(security_data, self.security_id_type, self.error_behaviour)? {
          errors += security_errors;
        }
      }
    }
    Ok((table, errors))
  }
}

impl Request for ReferenceDataRequest {
  fn service_name(&self) -> &str {
    names::REFDATA_SERVICE
  }

  fn request_name(&self) -> &str {
    "ReferenceDataRequest"
  }

  fn options(&self) -> &RequestOptions {
    &self.options
  }

  fn inbox(&self) -> &Inbox {
    &self.inbox
  }

  fn weight(&self) -> u64 {
    (self.securities.len() * self.fields.len()) as u64
  }
}

// --- HistoricalDataRequest ---

/// Daily history of `fields` for `securities` over `[start_date, end_date]`.
///
/// Rows are keyed on `(date, security)`; every date of the range is present
/// even when the provider returns nothing for it.
#[derive(Debug)]
pub struct HistoricalDataRequest {
  securities: Vec<String>,
  fields: Vec<String>,
  start_date: NaiveDate,
  end_date: NaiveDate,
  security_id_type: Option<SecurityIdType>,
  error_behaviour: ErrorBehaviour,
  options: RequestOptions,
  inbox: Inbox,
}

impl HistoricalDataRequest {
  pub fn new(
    securities: Vec<String>,
    fields: Vec<String>,
    start_date: NaiveDate,
    end_date: NaiveDate,
    security_id_type: Option<SecurityIdType>,
    overrides: Overrides,
    error_behaviour: ErrorBehaviour,
  ) -> Result<Self, BlpError> {
    if end_date < start_date {
      return Err(BlpError::InvalidParameter(format!(
        "end date {} is before start date {}", end_date, start_date
      )));
    }
    let mut options = RequestOptions::new();
    options.insert(names::SECURITIES, prefixed(&securities, security_id_type));
    options.insert(names::FIELDS, fields.clone());
    options.insert(names::START_DATE, Value::from(start_date.format("%Y%m%d").to_string()));
    options.insert(names::END_DATE, Value::from(end_date.format("%Y%m%d").to_string()));
    options.extend_overrides(&overrides);

    Ok(HistoricalDataRequest {
      securities,
      fields,
      start_date,
      end_date,
      security_id_type,
      error_behaviour,
      options,
      inbox: Inbox::new(),
    })
  }

  /// Inclusive number of calendar days in the range.
  pub fn num_days(&self) -> u64 {
    ((self.end_date - self.start_date).num_days() + 1) as u64
  }

  fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
    (0..self.num_days() as i64).map(move |offset| self.start_date + Duration::days(offset))
  }

  pub async fn process(&self) -> Result<(DataTable<(NaiveDate, String)>, ErrorSet), BlpError> {
    let mut table = DataTable::with_columns(&self.fields);
    for date in self.dates() {
      for security in &self.securities {
        table.add_row((date, security.clone()));
      }
    }
    let mut errors = ErrorSet::new();
    let mut reader = self.inbox.reader().await;

    while let Some(msg) = reader.next().await {
      debug!("HistoricalDataRequest: processing {}", msg.name());
      for security_data in msg.get_element(names::SECURITY_DATA)?.values_or_self() {
        let (security_id, rows) = parse_historical_security_data(security_data, self.security_id_type)?;
        for (date, row) in rows {
          for (field, value) in row {
            table.set((date, security_id.clone()), &field, value);
          }
        }
        if let Some(security_errors) = parse_errors(security_data, self.security_id_type, self.error_behaviour)? {
          errors += security_errors;
        }
      }
    }
    Ok((table, errors))
  }
}

impl Request for HistoricalDataRequest {
  fn service_name(&self) -> &str {
    names::REFDATA_SERVICE
  }

  fn request_name(&self) -> &str {
    "HistoricalDataRequest"
  }

  fn options(&self) -> &RequestOptions {
    &self.options
  }

  fn inbox(&self) -> &Inbox {
    &self.inbox
  }

  fn weight(&self) -> u64 {
    (self.securities.len() * self.fields.len()) as u64 * self.num_days()
  }
}
