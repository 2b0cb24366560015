pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod orders;
pub mod outbox;
pub mod reconciliation;
pub mod schema;
pub mod state_machine;
pub mod store;
pub mod sweeper;

pub use error::{EscrowError, EscrowResult};
pub use reconciliation::ReconciliationEngine;
