#[macro_use]
extern crate log;

pub mod args;
pub mod capture;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod gateway;
pub mod injector;
pub mod layer2;
pub mod monitor;
pub mod net;
pub mod pool;
pub mod probe;
pub mod tracker;
pub mod transmit;

pub use crate::connection::{Connection, ConnectionId};
pub use crate::engine::{EngineConfig, TerminationEngine, NO_CONNECTION, SUMMARY_ERROR};
pub use crate::errors::{Error, Result};
