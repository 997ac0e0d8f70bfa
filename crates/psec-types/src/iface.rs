//! Stack-aware interface addressing.
//!
//! A switch stack consists of up to 16 nodes. An interface is a front-panel
//! port on one node and is written `node/port`, e.g. `1/12`.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a node in the switch stack (1-16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct NodeId(u8);

impl NodeId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 16;

    pub const FIRST: NodeId = NodeId(Self::MIN);

    pub const fn new(id: u8) -> Result<Self, ParseError> {
        if id >= Self::MIN && id <= Self::MAX {
            Ok(NodeId(id))
        } else {
            Err(ParseError::InvalidNodeId(id))
        }
    }

    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// Zero-based index, handy for fixed-size per-node tables.
    pub const fn index(&self) -> usize {
        (self.0 - Self::MIN) as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for NodeId {
    type Error = ParseError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        NodeId::new(id)
    }
}

impl From<NodeId> for u8 {
    fn from(node: NodeId) -> u8 {
        node.0
    }
}

/// Zero-based front-panel port number local to one node.
pub type PortNo = u16;

/// A port on a node of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId {
    pub node: NodeId,
    pub port: PortNo,
}

impl InterfaceId {
    pub const fn new(node: NodeId, port: PortNo) -> Self {
        Self { node, port }
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.port)
    }
}

impl FromStr for InterfaceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidInterface(s.to_string());
        let (node, port) = s.split_once('/').ok_or_else(invalid)?;
        let node: u8 = node.trim().parse().map_err(|_| invalid())?;
        let port: PortNo = port.trim().parse().map_err(|_| invalid())?;
        Ok(InterfaceId::new(NodeId::new(node)?, port))
    }
}
