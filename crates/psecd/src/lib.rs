//! psecd - MAC security admission engine
//!
//! Decides, per port and per (VLAN, MAC), whether a newly seen source address
//! may forward. Several independent security policies vote on every address;
//! the engine arbitrates their votes, programs the hardware MAC table, ages
//! entries out and keeps the policies informed.
//!
//! # Architecture
//!
//! ```text
//! [frames] ──> [Engine] ──> [HardwareMacTable / IpAdmissionFilter]
//!                 │  ^
//!  admin policy <─┤  └── [scheduler tick]
//!                 v
//!          [DeferredQueue] ──> [dispatcher] ──> other policies
//! ```
//!
//! # Key Components
//!
//! - [`engine::Engine`]: the table, the admission pipeline and every operation
//! - [`arbiter`]: combines policy decisions into one forwarding state
//! - [`dispatcher`]: delivers policy notifications with the engine lock released
//! - [`scheduler`]: aging and hold-time countdown
//! - [`stack`]: frame relay and configuration push between stack nodes
//! - [`limit`]: the reference administrative policy (limit control)

pub mod arbiter;
pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hal;
pub mod limit;
pub mod policy;
pub mod scheduler;
pub mod stack;
pub mod table;
pub mod types;

pub use config::PsecConfig;
pub use engine::{ClearFilter, Engine, PortConf};
pub use error::{ErrorKind, HalError, PsecError, Result};
pub use limit::{LimitControl, LimitPolicy};
pub use policy::{AddNotice, AddVerdict, DelNotice, SecurityPolicy, StaticMac};
pub use types::{AddAction, AddMethod, DelReason, MacType, NodeRole, PolicyId, PolicySet, PortMode};
