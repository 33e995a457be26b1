// blpmux/src/element.rs
// Tree-shaped message payload ("element") and the scalar values it carries.
//
// Real transports convert their native message objects into this tree; the
// reducers in `parser` only ever go through the reader methods below.

use crate::base::BlpError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single scalar value carried by a leaf element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
  #[default]
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Date(NaiveDate),
  Datetime(NaiveDateTime),
  String(String),
}

impl Value {
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Float(f) => Some(*f),
      Value::Int(i) => Some(*i as f64),
      _ => None,
    }
  }

  /// Interpret the value as a calendar date. Strings are accepted in
  /// `YYYY-MM-DD` and `YYYYMMDD` form.
  pub fn as_date(&self) -> Option<NaiveDate> {
    match self {
      Value::Date(d) => Some(*d),
      Value::Datetime(dt) => Some(dt.date()),
      Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .ok(),
      _ => None,
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Null => Ok(()),
      Value::Bool(b) => write!(f, "{}", b),
      Value::Int(i) => write!(f, "{}", i),
      Value::Float(x) => write!(f, "{}", x),
      Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
      Value::Datetime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
      Value::String(s) => f.write_str(s),
    }
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self { Value::String(s.to_string()) }
}
impl From<String> for Value {
  fn from(s: String) -> Self { Value::String(s) }
}
impl From<f64> for Value {
  fn from(x: f64) -> Self { Value::Float(x) }
}
impl From<i64> for Value {
  fn from(i: i64) -> Self { Value::Int(i) }
}
impl From<u32> for Value {
  fn from(i: u32) -> Self { Value::Int(i64::from(i)) }
}
impl From<bool> for Value {
  fn from(b: bool) -> Self { Value::Bool(b) }
}
impl From<NaiveDate> for Value {
  fn from(d: NaiveDate) -> Self { Value::Date(d) }
}

/// Children of an element: none (scalar leaf), a named sequence, or an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Children {
  #[default]
  None,
  Sequence(Vec<Element>),
  Array(Vec<Element>),
}

/// Node of a message payload tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
  name: String,
  #[serde(default)]
  value: Value,
  #[serde(default)]
  children: Children,
}

impl Element {
  /// Leaf element holding a single value.
  pub fn scalar(name: &str, value: impl Into<Value>) -> Self {
    Element { name: name.to_string(), value: value.into(), children: Children::None }
  }

  /// Element whose children are addressed by name.
  pub fn sequence(name: &str, children: Vec<Element>) -> Self {
    Element { name: name.to_string(), value: Value::Null, children: Children::Sequence(children) }
  }

  /// Element whose children are positional values.
  pub fn array(name: &str, values: Vec<Element>) -> Self {
    Element { name: name.to_string(), value: Value::Null, children: Children::Array(values) }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn value(&self) -> &Value {
    &self.value
  }

  pub fn is_array(&self) -> bool {
    matches!(self.children, Children::Array(_))
  }

  /// True for leaves (no children of either kind).
  pub fn is_scalar(&self) -> bool {
    matches!(self.children, Children::None)
  }

  /// Child elements, in order. Empty for scalar leaves.
  pub fn elements(&self) -> &[Element] {
    match &self.children {
      Children::None => &[],
      Children::Sequence(children) | Children::Array(children) => children,
    }
  }

  /// Array values. Same storage as `elements`, named after the provider API.
  pub fn values(&self) -> &[Element] {
    self.elements()
  }

  /// Array values if this is an array, otherwise the element itself.
  pub fn values_or_self(&self) -> &[Element] {
    if self.is_array() {
      self.values()
    } else {
      std::slice::from_ref(self)
    }
  }

  pub fn num_values(&self) -> usize {
    self.elements().len()
  }

  pub fn has_element(&self, name: &str) -> bool {
    match &self.children {
      Children::Sequence(children) => children.iter().any(|c| c.name == name),
      _ => false,
    }
  }

  pub fn get_element(&self, name: &str) -> Result<&Element, BlpError> {
    match &self.children {
      Children::Sequence(children) => children
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| BlpError::ElementNotFound(format!("{} in {}", name, self.name))),
      _ => Err(BlpError::ElementNotFound(format!("{} in non-sequence {}", name, self.name))),
    }
  }

  pub fn get_element_as_string(&self, name: &str) -> Result<String, BlpError> {
    Ok(self.get_element(name)?.value.to_string())
  }

  fn write_indented(&self, f: &mut fmt::Formatter<'_>, offset: usize) -> fmt::Result {
    let pad = " ".repeat(offset);
    match &self.children {
      Children::None => writeln!(f, "{}{} = {}", pad, self.name, self.value),
      Children::Sequence(children) | Children::Array(children) => {
        let suffix = if self.is_array() { "[]" } else { "" };
        writeln!(f, "{}{}{} = {{", pad, self.name, suffix)?;
        for child in children {
          child.write_indented(f, offset + 2)?;
        }
        writeln!(f, "{}}}", pad)
      }
    }
  }
}

impl fmt::Display for Element {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.write_indented(f, 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn security_data() -> Element {
    Element::sequence("securityData", vec![
      Element::scalar("security", "F Equity"),
      Element::array("fieldData", vec![Element::scalar("PX_LAST", 10.2)]),
    ])
  }

  #[test]
  fn test_reader_accessors() {
    let sd = security_data();
    assert!(!sd.is_array());
    assert!(sd.has_element("security"));
    assert!(!sd.has_element("securityError"));
    assert_eq!(sd.get_element_as_string("security").unwrap(), "F Equity");

    let field_data = sd.get_element("fieldData").unwrap();
    assert!(field_data.is_array());
    assert_eq!(field_data.num_values(), 1);
    assert_eq!(field_data.values()[0].value(), &Value::Float(10.2));

    match sd.get_element("missing") {
      Err(BlpError::ElementNotFound(_)) => {}
      other => panic!("unexpected: {:?}", other),
    }
  }

  #[test]
  fn test_values_or_self() {
    let sd = security_data();
    assert_eq!(sd.values_or_self().len(), 1);
    let arr = Element::array("securityData", vec![sd.clone(), sd]);
    assert_eq!(arr.values_or_self().len(), 2);
  }

  #[test]
  fn test_value_date_parsing() {
    let expected = NaiveDate::from_ymd_opt(2018, 1, 2).unwrap();
    assert_eq!(Value::from("2018-01-02").as_date(), Some(expected));
    assert_eq!(Value::from("20180102").as_date(), Some(expected));
    assert_eq!(Value::Date(expected).as_date(), Some(expected));
    assert_eq!(Value::Float(1.0).as_date(), None);
  }

  #[test]
  fn test_element_from_json() {
    let json = r#"{
      "name": "securityData",
      "children": {"sequence": [
        {"name": "security", "value": "IBM Equity"},
        {"name": "fieldData", "children": {"sequence": [
          {"name": "PX_LAST", "value": 131.5},
          {"name": "date", "value": "2019-01-03"}
        ]}}
      ]}
    }"#;
    let element: Element = serde_json::from_str(json).unwrap();
    assert_eq!(element.get_element_as_string("security").unwrap(), "IBM Equity");
    let field_data = element.get_element("fieldData").unwrap();
    assert_eq!(field_data.get_element("PX_LAST").unwrap().value(), &Value::Float(131.5));
    assert_eq!(
      field_data.get_element("date").unwrap().value().as_date(),
      NaiveDate::from_ymd_opt(2019, 1, 3)
    );
  }
}
