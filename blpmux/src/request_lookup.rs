// blpmux/src/request_lookup.rs
// Instrument lookup (//blp/instruments) and field search (//blp/apiflds).

use crate::base::BlpError;
use crate::data::{DataTable, FieldValue};
use crate::element::Value;
use crate::error_set::ErrorSet;
use crate::names;
use crate::parser::parse_field_data;
use crate::request::{Inbox, Request, RequestOptions};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Which instrument list to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupKind {
  /// Securities by name/ticker (`instrumentListRequest`).
  Security,
  /// Yield curves (`curveListRequest`).
  Curve,
  /// Government tickers (`govtListRequest`).
  Government,
}

impl LookupKind {
  pub fn request_name(&self) -> &'static str {
    match self {
      LookupKind::Security => "instrumentListRequest",
      LookupKind::Curve => "curveListRequest",
      LookupKind::Government => "govtListRequest",
    }
  }

  /// Columns read from every result element, in output order.
  pub fn response_fields(&self) -> &'static [&'static str] {
    match self {
      LookupKind::Security => &["security", "description"],
      LookupKind::Curve => &[
        "description", "country", "currency", "curveid", "type", "subtype", "publisher", "bbgid",
      ],
      LookupKind::Government => &["parseky", "name", "ticker"],
    }
  }
}

impl FromStr for LookupKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "security" | "instrument" => Ok(LookupKind::Security),
      "curve" => Ok(LookupKind::Curve),
      "government" | "govt" => Ok(LookupKind::Government),
      other => Err(format!("unknown lookup kind: {}", other)),
    }
  }
}

// --- InstrumentLookupRequest ---

/// Free-text instrument search. Result rows are positional.
#[derive(Debug)]
pub struct InstrumentLookupRequest {
  kind: LookupKind,
  query: String,
  max_results: u32,
  options: RequestOptions,
  inbox: Inbox,
}

impl InstrumentLookupRequest {
  /// `extra_options` are provider filters such as `yellowKeyFilter`,
  /// `countryCode` or `partialMatch`.
  pub fn new(kind: LookupKind, query: &str, max_results: u32, extra_options: BTreeMap<String, Value>) -> Self {
    let mut options = RequestOptions::new();
    options.insert(names::QUERY, Value::from(query));
    options.insert(names::MAX_RESULTS, Value::from(max_results));
    options.extend_overrides(&extra_options);
    InstrumentLookupRequest {
      kind,
      query: query.to_string(),
      max_results,
      options,
      inbox: Inbox::new(),
    }
  }

  pub fn kind(&self) -> LookupKind {
    self.kind
  }

  pub fn query(&self) -> &str {
    &self.query
  }

  pub async fn process(&self) -> Result<(DataTable<usize>, ErrorSet), BlpError> {
    let fields = self.kind.response_fields();
    let mut table = DataTable::with_columns(fields.iter());
    let mut reader = self.inbox.reader().await;

    while let Some(msg) = reader.next().await {
      debug!("InstrumentLookupRequest: processing {}", msg.name());
      for result in msg.get_element(names::RESULTS)?.values() {
        let position = table.len();
        table.add_row(position);
        for field in fields {
          let value = result.get_element_as_string(field)?;
          table.set(position, field, FieldValue::Scalar(Value::String(value)));
        }
      }
    }
    Ok((table, ErrorSet::new()))
  }
}

impl Request for InstrumentLookupRequest {
  fn service_name(&self) -> &str {
    names::INSTRUMENTS_SERVICE
  }

  fn request_name(&self) -> &str {
    self.kind.request_name()
  }

  fn options(&self) -> &RequestOptions {
    &self.options
  }

  fn inbox(&self) -> &Inbox {
    &self.inbox
  }

  fn weight(&self) -> u64 {
    u64::from(self.max_results) * self.kind.response_fields().len() as u64
  }
}

// --- FieldSearchRequest ---

/// Categorized search over field mnemonics and descriptions.
///
/// Rows are keyed by field id; columns are the scalar children of each
/// field's `fieldInfo` (mnemonic, description, datatype, ...).
#[derive(Debug)]
pub struct FieldSearchRequest {
  query: String,
  options: RequestOptions,
  inbox: Inbox,
}

impl FieldSearchRequest {
  pub fn new(query: &str, overrides: BTreeMap<String, Value>) -> Self {
    let mut options = RequestOptions::new();
    options.insert(names::SEARCH_SPEC, Value::from(query));
    options.extend_overrides(&overrides);
    FieldSearchRequest { query: query.to_string(), options, inbox: Inbox::new() }
  }

  pub fn query(&self) -> &str {
    &self.query
  }

  pub async fn process(&self) -> Result<(DataTable<String>, ErrorSet), BlpError> {
    let mut table = DataTable::new();
    let mut reader = self.inbox.reader().await;

    while let Some(msg) = reader.next().await {
      for category in msg.get_element(names::CATEGORY)?.values() {
        for field in category.get_element(names::FIELD_DATA)?.values() {
          let id = field.get_element_as_string(names::ID)?;
          for info in field.get_element(names::FIELD_INFO)?.elements() {
            if info.is_array() {
              // categoryName[] / property[] are usually empty
              trace!("FieldSearchRequest: skipping array {} for {}", info.name(), id);
              continue;
            }
            let (name, value) = parse_field_data(info);
            table.set(id.clone(), &name, value);
          }
        }
      }
    }
    Ok((table, ErrorSet::new()))
  }
}

impl Request for FieldSearchRequest {
  fn service_name(&self) -> &str {
    names::APIFLDS_SERVICE
  }

  fn request_name(&self) -> &str {
    "CategorizedFieldSearchRequest"
  }

  fn options(&self) -> &RequestOptions {
    &self.options
  }

  fn inbox(&self) -> &Inbox {
    &self.inbox
  }

  fn weight(&self) -> u64 {
    1
  }
}
