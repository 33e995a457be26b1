// blpmux/src/lib.rs
// Main entry point for the blpmux library

//! # blpmux
//!
//! Async request multiplexing on top of a callback-driven market data
//! session API:
//!
//! - Handlers demultiplex provider-thread events onto per-request queues
//!   keyed by correlation id.
//! - Requests reduce their response messages into a table plus an error set.
//! - The `Dispatcher` balances bulk queries over a bounded pool of sessions,
//!   splitting them into chunks and merging the results.
//!
//! Real transports implement `Session` / `SessionFactory`; `session_mock`
//! provides an in-process provider for tests and offline replay.

mod base;
mod parser;
pub mod names;
pub mod element;
pub mod event;
pub mod session;
pub mod error_set;
pub mod data;
pub mod request;
pub mod request_refdata;
pub mod request_lookup;
pub mod subscription;
pub mod handler;
pub mod config;
pub mod session_mock;
pub mod dispatcher;

pub use base::{BlpError, Signal};
pub use config::{init_logging, Config};
pub use data::{DataTable, FieldValue, Overrides, SecurityIdType};
pub use dispatcher::Dispatcher;
pub use element::{Element, Value};
pub use error_set::{ErrorBehaviour, ErrorSet, ErrorType};
pub use event::{CorrelationId, Event, EventType, Message};
pub use request_lookup::LookupKind;
pub use session::{Session, SessionFactory, SessionOptions};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
