//! Application layer orchestrating the engine's state transitions: admission
//! control (`SessionManager`), payout/refund settlement
//! (`SettlementService`) and expiry of unfilled sessions (`TimeoutSweeper`).

pub mod manager;
pub mod settlement;
pub mod sweeper;
