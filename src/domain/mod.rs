//! Domain layer: session, participant and draw records plus the ports the
//! engine depends on. Everything here is storage- and transport-agnostic.

pub mod draw;
pub mod money;
pub mod participant;
pub mod ports;
pub mod product;
pub mod session;
