// blpmux/src/parser.rs
// Stateless reducers turning one response element into table cells and errors.

use crate::base::BlpError;
use crate::data::{FieldValue, SecurityIdType};
use crate::element::{Element, Value};
use crate::error_set::{ErrorBehaviour, ErrorSet, ErrorType};
use crate::names;
use chrono::NaiveDate;
use log::warn;
use std::collections::BTreeMap;

/// Parsed cells of one row.
pub type Row = Vec<(String, FieldValue)>;

/// Read the security id of a security data element, stripping the id-type
/// prefix if one was applied on the way out.
pub fn get_security_id(
  security_data: &Element,
  security_id_type: Option<SecurityIdType>,
) -> Result<String, BlpError> {
  let security_id = security_data.get_element_as_string(names::SECURITY)?;
  Ok(match security_id_type {
    Some(id_type) => id_type.remove_type(&security_id),
    None => security_id,
  })
}

/// Parse a single field element into `(name, value)`.
pub fn parse_field_data(field: &Element) -> (String, FieldValue) {
  if field.is_array() {
    return parse_array_field(field);
  }
  (field.name().to_string(), FieldValue::Scalar(field.value().clone()))
}

/// Parse a bulk field.
///
/// Arrays of scalars and arrays whose records all carry exactly one value
/// become a flat list; anything else stays a list of records.
pub fn parse_array_field(field: &Element) -> (String, FieldValue) {
  let name = field.name().to_string();
  let items = field.values();

  if items.iter().all(Element::is_scalar) {
    let values = items.iter().map(|item| item.value().clone()).collect();
    return (name, FieldValue::List(values));
  }

  let records: Vec<BTreeMap<String, Value>> = items
    .iter()
    .map(|item| {
      item.elements()
        .iter()
        .map(|e| (e.name().to_string(), e.value().clone()))
        .collect()
    })
    .collect();

  if records.iter().all(|record| record.len() == 1) {
    let values = records
      .into_iter()
      .filter_map(|record| record.into_values().next())
      .collect();
    (name, FieldValue::List(values))
  } else {
    (name, FieldValue::Records(records))
  }
}

/// Parse one reference data security element into its id and row.
pub fn parse_reference_security_data(
  security_data: &Element,
  security_id_type: Option<SecurityIdType>,
) -> Result<(String, Row), BlpError> {
  let security_id = get_security_id(security_data, security_id_type)?;
  let mut row = Row::new();
  if security_data.has_element(names::FIELD_DATA) {
    for field in security_data.get_element(names::FIELD_DATA)?.elements() {
      row.push(parse_field_data(field));
    }
  }
  Ok((security_id, row))
}

/// Parse one historical security element into `(date, row)` pairs.
pub fn parse_historical_security_data(
  security_data: &Element,
  security_id_type: Option<SecurityIdType>,
) -> Result<(String, Vec<(NaiveDate, Row)>), BlpError> {
  let security_id = get_security_id(security_data, security_id_type)?;
  let mut rows = Vec::new();
  if !security_data.has_element(names::FIELD_DATA) {
    return Ok((security_id, rows));
  }

  for fields_sequence in security_data.get_element(names::FIELD_DATA)?.values() {
    let mut date = None;
    let mut row = Row::new();
    for field in fields_sequence.elements() {
      if field.name() == names::DATE {
        date = field.value().as_date();
        continue;
      }
      row.push(parse_field_data(field));
    }
    let date = date.ok_or_else(|| {
      BlpError::ParseError(format!("historical field data for {} has no valid date", security_id))
    })?;
    rows.push((date, row));
  }
  Ok((security_id, rows))
}

/// Parse `fieldExceptions` for one security into `(field, error)` pairs.
pub fn parse_field_exceptions(field_exceptions: &Element) -> Result<Vec<(String, ErrorType)>, BlpError> {
  let mut errors = Vec::new();
  for exception in field_exceptions.values() {
    let field = exception.get_element_as_string(names::FIELD_ID)?;
    let message = exception
      .get_element(names::ERROR_INFO)?
      .get_element_as_string(names::MESSAGE)?;
    errors.push((field, ErrorType::from_message(&message)));
  }
  Ok(errors)
}

/// Collect the errors attached to one security element according to `behaviour`.
///
/// Returns `Ok(None)` when errors are ignored, and `Err(DataError)` under
/// `Raise` as soon as the element carries any error.
pub fn parse_errors(
  security_data: &Element,
  security_id_type: Option<SecurityIdType>,
  behaviour: ErrorBehaviour,
) -> Result<Option<ErrorSet>, BlpError> {
  if behaviour == ErrorBehaviour::Ignore {
    return Ok(None);
  }

  let security_id = get_security_id(security_data, security_id_type)?;
  let mut errors = ErrorSet::new();

  if security_data.has_element(names::SECURITY_ERROR) {
    errors.add_invalid_security(&security_id);
  }
  if security_data.has_element(names::FIELD_EXCEPTIONS) {
    for (field, error) in parse_field_exceptions(security_data.get_element(names::FIELD_EXCEPTIONS)?)? {
      errors.add_field_error(&security_id, &field, error);
    }
  }

  if !errors.is_empty() {
    match behaviour {
      ErrorBehaviour::Raise => return Err(BlpError::DataError(errors)),
      ErrorBehaviour::Warn => warn!("Errors reported for {}: {}", security_id, errors),
      _ => {}
    }
  }
  Ok(Some(errors))
}
