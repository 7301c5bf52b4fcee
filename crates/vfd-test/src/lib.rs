//! Test infrastructure for the VFd binding reconciler
//!
//! Provides:
//! - An in-memory simulated PCI host ([`SimHost`]) implementing `PciHost`
//! - A mutation log for ordering and idempotence assertions
//! - Fixtures for common adapter topologies
//! - A paced wrapper ([`PacedHost`]) for concurrency and join-order checks
//! - Verification helpers for final driver state

pub mod fixtures;
mod paced_host;
mod sim_host;
mod verification;

pub use paced_host::{MutationEvent, PacedHost};
pub use sim_host::{HostOp, SimDevice, SimHost, BRIDGE_CLASS, ETHERNET_CLASS, ROUTING_REFUSAL};
pub use verification::*;
