//! Group-buy session engine: concurrent join admission, a publicly
//! verifiable draw once a session fills, and exactly-once settlement of
//! payouts and refunds.

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
