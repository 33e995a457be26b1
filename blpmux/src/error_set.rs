// blpmux/src/error_set.rs
// Per-security and per-field errors reported inside otherwise valid responses.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// What to do with errors embedded in response data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorBehaviour {
  /// Fail `process()` on the first security carrying errors.
  Raise,
  /// Collect errors into the returned `ErrorSet`.
  #[default]
  Return,
  /// Never collect errors.
  Ignore,
  /// Log each error and keep collecting.
  Warn,
}

impl FromStr for ErrorBehaviour {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "raise" => Ok(ErrorBehaviour::Raise),
      "return" => Ok(ErrorBehaviour::Return),
      "ignore" => Ok(ErrorBehaviour::Ignore),
      "warn" => Ok(ErrorBehaviour::Warn),
      other => Err(format!("unknown error behaviour: {}", other)),
    }
  }
}

/// Classification of an error message attached to a security or field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
  /// Security id is not recognized (reference and historical requests).
  InvalidSecurity,
  /// Field mnemonic is not recognized (reference data).
  InvalidField,
  /// Field exists but does not apply to the security (reference data).
  FieldNotApplicable,
  /// Field mnemonic is not recognized (historical data).
  InvalidFieldHistorical,
  /// Field not applicable or has no history (historical data).
  InvalidHistoricalField,
  /// Any other provider message, verbatim.
  Other(String),
}

impl ErrorType {
  /// Map a provider error message onto a known category.
  pub fn from_message(message: &str) -> Self {
    match message {
      "INVALID_SECURITY" => ErrorType::InvalidSecurity,
      "Field not valid" => ErrorType::InvalidField,
      "Field not applicable to security" => ErrorType::FieldNotApplicable,
      "Invalid field" => ErrorType::InvalidFieldHistorical,
      "Not valid historical field" => ErrorType::InvalidHistoricalField,
      other => ErrorType::Other(other.to_string()),
    }
  }

  pub fn message(&self) -> &str {
    match self {
      ErrorType::InvalidSecurity => "INVALID_SECURITY",
      ErrorType::InvalidField => "Field not valid",
      ErrorType::FieldNotApplicable => "Field not applicable to security",
      ErrorType::InvalidFieldHistorical => "Invalid field",
      ErrorType::InvalidHistoricalField => "Not valid historical field",
      ErrorType::Other(msg) => msg,
    }
  }
}

impl fmt::Display for ErrorType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.message())
  }
}

/// Errors known for one security.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityErrors {
  Invalid,
  Fields(HashMap<String, ErrorType>),
}

/// Invalid securities plus per-(security, field) errors.
///
/// Merging is a set union on securities and right-biased on the field map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorSet {
  invalid_securities: BTreeSet<String>,
  invalid_fields: HashMap<(String, String), ErrorType>,
}

impl ErrorSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.invalid_securities.is_empty() && self.invalid_fields.is_empty()
  }

  pub fn add_invalid_security(&mut self, security: &str) {
    self.invalid_securities.insert(security.to_string());
  }

  pub fn add_field_error(&mut self, security: &str, field: &str, error: ErrorType) {
    self.invalid_fields.insert((security.to_string(), field.to_string()), error);
  }

  pub fn invalid_securities(&self) -> &BTreeSet<String> {
    &self.invalid_securities
  }

  pub fn invalid_fields(&self) -> &HashMap<(String, String), ErrorType> {
    &self.invalid_fields
  }

  /// Fold `other` into `self`. Field errors from `other` win on collision.
  pub fn merge(&mut self, other: ErrorSet) {
    self.invalid_securities.extend(other.invalid_securities);
    self.invalid_fields.extend(other.invalid_fields);
  }

  pub fn errors_by_security(&self, security: &str) -> SecurityErrors {
    if self.invalid_securities.contains(security) {
      return SecurityErrors::Invalid;
    }
    let fields = self.invalid_fields
      .iter()
      .filter(|((sec, _), _)| sec == security)
      .map(|((_, field), err)| (field.clone(), err.clone()))
      .collect();
    SecurityErrors::Fields(fields)
  }

  pub fn errors_by_field(&self, field: &str) -> HashMap<String, ErrorType> {
    self.invalid_fields
      .iter()
      .filter(|((_, f), _)| f == field)
      .map(|((sec, _), err)| (sec.clone(), err.clone()))
      .collect()
  }
}

impl AddAssign for ErrorSet {
  fn add_assign(&mut self, other: ErrorSet) {
    self.merge(other);
  }
}

impl Add for ErrorSet {
  type Output = ErrorSet;

  fn add(mut self, other: ErrorSet) -> ErrorSet {
    self.merge(other);
    self
  }
}

impl fmt::Display for ErrorSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty() {
      return f.write_str("no errors");
    }
    let mut parts: Vec<String> = self.invalid_securities
      .iter()
      .map(|sec| format!("{}: {}", sec, ErrorType::InvalidSecurity))
      .collect();
    let mut fields: Vec<String> = self.invalid_fields
      .iter()
      .map(|((sec, field), err)| format!("{}/{}: {}", sec, field, err))
      .collect();
    fields.sort();
    parts.extend(fields);
    f.write_str(&parts.join("; "))
  }
}
