//! Reimbursement Box notifier: expense notification emails and the
//! single-use approve/reject links they carry.
//!
//! The binary in `main.rs` wires these modules together; integration tests
//! in `tests/` drive them directly.

pub mod clock;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod errors;
pub mod models;
pub mod notification;
pub mod store;
pub mod token;
pub mod workflow;
