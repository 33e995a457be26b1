// blpmux/src/data.rs
// Tabular results and the identifier types used to build them.

use crate::element::Value;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

/// Provider-side option overrides merged into a request's top-level options.
pub type Overrides = BTreeMap<String, Value>;

/// Namespace tag prepended to a security identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityIdType {
  Ticker,
  Isin,
  Cusip,
  Sedol,
  BlSecurityIdentifier,
  BlSecuritySymbol,
  BlUniqueIdentifier,
  BlGlobalIdentifier,
}

impl SecurityIdType {
  pub fn prefix(&self) -> &'static str {
    match self {
      SecurityIdType::Ticker => "/ticker/",
      SecurityIdType::Isin => "/isin/",
      SecurityIdType::Cusip => "/cusip/",
      SecurityIdType::Sedol => "/sedol/",
      SecurityIdType::BlSecurityIdentifier => "/bsid/",
      SecurityIdType::BlSecuritySymbol => "/bsym/",
      SecurityIdType::BlUniqueIdentifier => "/buid/",
      SecurityIdType::BlGlobalIdentifier => "/bbgid/",
    }
  }

  pub fn add_type(&self, security: &str) -> String {
    format!("{}{}", self.prefix(), security)
  }

  /// Strip this type's prefix; ids without it are returned unchanged.
  pub fn remove_type(&self, security: &str) -> String {
    security.strip_prefix(self.prefix()).unwrap_or(security).to_string()
  }
}

impl FromStr for SecurityIdType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim_matches('/').to_ascii_lowercase().as_str() {
      "ticker" => Ok(SecurityIdType::Ticker),
      "isin" => Ok(SecurityIdType::Isin),
      "cusip" => Ok(SecurityIdType::Cusip),
      "sedol" => Ok(SecurityIdType::Sedol),
      "bsid" => Ok(SecurityIdType::BlSecurityIdentifier),
      "bsym" => Ok(SecurityIdType::BlSecuritySymbol),
      "buid" => Ok(SecurityIdType::BlUniqueIdentifier),
      "bbgid" => Ok(SecurityIdType::BlGlobalIdentifier),
      other => Err(format!("unknown security id type: {}", other)),
    }
  }
}

impl fmt::Display for SecurityIdType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.prefix())
  }
}

/// Content of one table cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
  Scalar(Value),
  /// Bulk field whose records each carry a single value.
  List(Vec<Value>),
  /// Bulk field with multi-key records.
  Records(Vec<BTreeMap<String, Value>>),
}

impl FieldValue {
  pub fn as_scalar(&self) -> Option<&Value> {
    match self {
      FieldValue::Scalar(v) => Some(v),
      _ => None,
    }
  }
}

impl From<Value> for FieldValue {
  fn from(v: Value) -> Self {
    FieldValue::Scalar(v)
  }
}

/// Rows keyed by `K`, columns keyed by field name.
///
/// Row and column order is insertion order. Missing cells are simply absent.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTable<K: Eq + Hash + Clone> {
  columns: Vec<String>,
  index: Vec<K>,
  rows: HashMap<K, HashMap<String, FieldValue>>,
}

impl<K: Eq + Hash + Clone> Default for DataTable<K> {
  fn default() -> Self {
    DataTable { columns: Vec::new(), index: Vec::new(), rows: HashMap::new() }
  }
}

impl<K: Eq + Hash + Clone> DataTable<K> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Empty table with a fixed leading set of columns.
  pub fn with_columns<I, S>(columns: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut table = Self::new();
    for column in columns {
      table.add_column(column.as_ref());
    }
    table
  }

  pub fn add_column(&mut self, column: &str) {
    if !self.columns.iter().any(|c| c == column) {
      self.columns.push(column.to_string());
    }
  }

  /// Ensure a (possibly empty) row exists for `key`.
  pub fn add_row(&mut self, key: K) {
    if !self.rows.contains_key(&key) {
      self.index.push(key.clone());
      self.rows.insert(key, HashMap::new());
    }
  }

  pub fn set(&mut self, key: K, column: &str, value: FieldValue) {
    self.add_column(column);
    self.add_row(key.clone());
    if let Some(row) = self.rows.get_mut(&key) {
      row.insert(column.to_string(), value);
    }
  }

  pub fn get(&self, key: &K, column: &str) -> Option<&FieldValue> {
    self.rows.get(key).and_then(|row| row.get(column))
  }

  pub fn row(&self, key: &K) -> Option<&HashMap<String, FieldValue>> {
    self.rows.get(key)
  }

  pub fn contains_row(&self, key: &K) -> bool {
    self.rows.contains_key(key)
  }

  pub fn columns(&self) -> &[String] {
    &self.columns
  }

  pub fn index(&self) -> &[K] {
    &self.index
  }

  /// Number of rows.
  pub fn len(&self) -> usize {
    self.index.len()
  }

  pub fn is_empty(&self) -> bool {
    self.index.is_empty()
  }

  /// Rows in index order.
  pub fn iter_rows(&self) -> impl Iterator<Item = (&K, &HashMap<String, FieldValue>)> {
    self.index.iter().filter_map(move |k| self.rows.get(k).map(|row| (k, row)))
  }

  /// Union of rows and columns; cells from `other` overwrite existing ones.
  pub fn merge(&mut self, other: DataTable<K>) {
    let DataTable { columns, index, mut rows } = other;
    for column in &columns {
      self.add_column(column);
    }
    for key in index {
      self.add_row(key.clone());
      if let (Some(src), Some(dst)) = (rows.remove(&key), self.rows.get_mut(&key)) {
        dst.extend(src);
      }
    }
  }
}

#[derive(Serialize)]
struct RowRef<'a, K> {
  index: &'a K,
  #[serde(flatten)]
  values: BTreeMap<&'a str, &'a FieldValue>,
}

impl<K: Eq + Hash + Clone + Serialize> Serialize for DataTable<K> {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(self.len()))?;
    for (key, row) in self.iter_rows() {
      let values = row.iter().map(|(c, v)| (c.as_str(), v)).collect();
      seq.serialize_element(&RowRef { index: key, values })?;
    }
    seq.end()
  }
}
