//! Error types for the port security engine.

use crate::types::PolicyId;
use psec_types::{InterfaceId, NodeId};
use thiserror::Error;

/// Coarse error categories reported to management layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParameter,
    NotAuthorityNode,
    InvalidInterface,
    PoolDepleted,
    LinkDown,
    PortShutDown,
    LimitReached,
    NoPoliciesEnabled,
    SpanningTreeDiscarding,
    AlreadyPresent,
    InvalidPolicyMode,
    InternalError,
}

/// Port security engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PsecError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(PolicyId),

    #[error("Callbacks for {0} are already registered")]
    CallbacksAlreadyRegistered(PolicyId),

    #[error("Operation only valid on the primary node")]
    NotAuthorityNode,

    #[error("Node {0} is not present in the stack")]
    NodeDown(NodeId),

    #[error("Invalid interface: {0}")]
    InvalidInterface(InterfaceId),

    #[error("Aging period {0} is out of bounds (0 or [10; 10000000])")]
    InvalidAgingPeriod(u32),

    #[error("Hold time {0} is out of bounds ([10; 10000000])")]
    InvalidHoldTime(u32),

    #[error("Violation limit {0} is out of bounds ([1; 1023])")]
    InvalidViolationLimit(u32),

    #[error("MAC address is not a unicast address")]
    MacNotUnicast,

    #[error("Port security MAC pool depleted")]
    PoolDepleted,

    #[error("Link is down on {0}")]
    LinkDown(InterfaceId),

    #[error("Interface {0} has been shut down")]
    PortShutDown(InterfaceId),

    #[error("Limit reached on {0}, no more MAC addresses can be added")]
    LimitReached(InterfaceId),

    #[error("Limit {limit} is lower than the current count {current}")]
    LimitLowerThanCurrentCount { limit: u32, current: u32 },

    #[error("No policies are enabled on {0}")]
    NoPoliciesEnabled(InterfaceId),

    #[error("Spanning tree instance is discarding on {0}")]
    SpanningTreeDiscarding(InterfaceId),

    #[error("The <MAC, VLAN> was not found on the interface")]
    EntryNotFound,

    #[error("The <MAC, VLAN> is already installed on {0}")]
    AlreadyPresent(InterfaceId),

    #[error("The <MAC, VLAN> is already installed on VLAN {0} sharing the same FDB")]
    AlreadyPresentOnSharedVlan(u16),

    #[error("{0} is not allowed to do this in its current port mode")]
    InvalidPolicyMode(PolicyId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PsecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PsecError::InvalidParameter(_)
            | PsecError::InvalidPolicy(_)
            | PsecError::CallbacksAlreadyRegistered(_)
            | PsecError::InvalidAgingPeriod(_)
            | PsecError::InvalidHoldTime(_)
            | PsecError::InvalidViolationLimit(_)
            | PsecError::MacNotUnicast
            | PsecError::LimitLowerThanCurrentCount { .. }
            | PsecError::EntryNotFound => ErrorKind::InvalidParameter,
            PsecError::NotAuthorityNode | PsecError::NodeDown(_) => ErrorKind::NotAuthorityNode,
            PsecError::InvalidInterface(_) => ErrorKind::InvalidInterface,
            PsecError::PoolDepleted => ErrorKind::PoolDepleted,
            PsecError::LinkDown(_) => ErrorKind::LinkDown,
            PsecError::PortShutDown(_) => ErrorKind::PortShutDown,
            PsecError::LimitReached(_) => ErrorKind::LimitReached,
            PsecError::NoPoliciesEnabled(_) => ErrorKind::NoPoliciesEnabled,
            PsecError::SpanningTreeDiscarding(_) => ErrorKind::SpanningTreeDiscarding,
            PsecError::AlreadyPresent(_) | PsecError::AlreadyPresentOnSharedVlan(_) => {
                ErrorKind::AlreadyPresent
            }
            PsecError::InvalidPolicyMode(_) => ErrorKind::InvalidPolicyMode,
            PsecError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Errors caused by transient port or pool state; a later frame may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PoolDepleted
                | ErrorKind::LinkDown
                | ErrorKind::LimitReached
                | ErrorKind::SpanningTreeDiscarding
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, PsecError>;

/// Failures reported by hardware-facing collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    /// The hardware table has no room for the entry (capacity or hash conflict).
    #[error("Hardware table full")]
    TableFull,

    #[error("Hardware error: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use psec_types::NodeId;

    fn iface() -> InterfaceId {
        InterfaceId::new(NodeId::new(1).unwrap(), 3)
    }

    #[test]
    fn test_error_display() {
        assert_eq!(PsecError::PoolDepleted.to_string(), "Port security MAC pool depleted");
        assert_eq!(PsecError::LinkDown(iface()).to_string(), "Link is down on 1/3");
        assert_eq!(
            PsecError::InvalidPolicyMode(PolicyId::Dot1x).to_string(),
            "dot1x is not allowed to do this in its current port mode"
        );
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(PsecError::AlreadyPresentOnSharedVlan(10).kind(), ErrorKind::AlreadyPresent);
        assert_eq!(PsecError::InvalidHoldTime(0).kind(), ErrorKind::InvalidParameter);
        assert_eq!(PsecError::Internal("x".into()).kind(), ErrorKind::InternalError);
    }

    #[test]
    fn test_retryable() {
        assert!(PsecError::PoolDepleted.is_retryable());
        assert!(!PsecError::PortShutDown(iface()).is_retryable());
        assert!(!PsecError::MacNotUnicast.is_retryable());
    }
}
