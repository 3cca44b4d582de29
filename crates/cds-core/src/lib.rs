pub mod action;
pub mod bootstrap;
pub mod builtin;
pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod io;
pub mod launcher;
pub mod log;
pub mod paths;
pub mod registry;
pub mod runner;
pub mod store;
pub mod trigger;

pub use error::{CdsError, NotFoundKind, Result};
