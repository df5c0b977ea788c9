//! slotd: an inspector availability ledger served over the PostgreSQL wire
//! protocol.

pub mod auth;
pub mod config;
pub mod fees;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod records;
pub mod session;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
