//! mledger common - shared types and utilities
//!
//! Positions, segment and cursor metadata records, the error taxonomy and
//! configuration shared by the segment store, the metadata store and the
//! managed ledger engine.

pub mod config;
pub mod error;
pub mod position;
pub mod types;

pub use config::{EnsembleConfig, FactoryConfig, ManagedLedgerConfig};
pub use error::{Error, ErrorKind, Result};
pub use position::{Position, PositionBound};
pub use types::*;
