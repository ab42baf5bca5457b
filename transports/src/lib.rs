//! Transport implementations for pubsub-bench
//!
//! This crate provides implementations of the `Connector` / `Transport`
//! traits from `pubsub-bench-core`:
//!
//! - `memory://` an in-process broker with shared subscriptions, ack/nack
//!   redelivery and fault injection, for loopback runs and tests
//!
//! Network brokers are selected the same way, by address scheme.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;

use pubsub_bench_core::transport::{Connector, TransportError};
use pubsub_bench_core::Role;

pub use memory::{
    FaultConfig, MemoryBroker, MemoryConnector, SubscriptionStats, DEFAULT_BACKLOG_LIMIT,
};

/// Address scheme handled by [`MemoryConnector`]
pub const MEMORY_SCHEME: &str = "memory://";

/// Pick a connector for a broker address and the role that will use it
///
/// # Errors
/// Returns [`TransportError::UnsupportedAddress`] if no transport handles
/// the address scheme, and [`TransportError::ProcessLocal`] when a
/// produce-only or consume-only run asks for the in-process broker.
pub fn connector_for(address: &str, role: Role) -> Result<Box<dyn Connector>, TransportError> {
    if address.starts_with(MEMORY_SCHEME) {
        if role != Role::Loopback {
            return Err(TransportError::ProcessLocal {
                address: address.to_string(),
                role: role.to_string(),
            });
        }
        Ok(Box::new(MemoryConnector::new(MemoryBroker::new())))
    } else {
        Err(TransportError::UnsupportedAddress(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_for_memory() {
        assert!(connector_for("memory://local", Role::Loopback).is_ok());
    }

    #[test]
    fn test_memory_rejected_for_standalone_roles() {
        for role in [Role::Produce, Role::Consume] {
            let result = connector_for("memory://local", role);
            assert!(matches!(
                result,
                Err(TransportError::ProcessLocal { ref address, role: ref r })
                    if address == "memory://local" && *r == role.to_string()
            ));
        }
    }

    #[test]
    fn test_connector_for_unknown_scheme() {
        let result = connector_for("pulsar://broker:6650", Role::Produce);
        assert!(matches!(
            result,
            Err(TransportError::UnsupportedAddress(addr)) if addr == "pulsar://broker:6650"
        ));
    }
}
