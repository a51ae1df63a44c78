//! Charge Management Core Library
//!
//! UDP protocol between a load manager and the EV chargers it controls.
//! Chargers report their state, the manager answers with current and phase
//! allocations. Implements packet validation, sequence tracking, hostname
//! resolution and the manager and client engines.

pub mod protocol;
pub mod validate;
pub mod sequence;
pub mod error;
pub mod directory;
pub mod resolver;
pub mod transport;
pub mod config;
pub mod state;
pub mod manager;
pub mod client;

pub use protocol::*;
pub use validate::ValidationError;
pub use sequence::SequenceTracker;
pub use error::{CmError, NetworkingError};
pub use directory::{HostAddressType, ManagedDevice, ResolveState};
pub use resolver::{HostResolver, NetworkResolver, StaticResolver};
pub use config::{ClientConfig, ManagerConfig};
pub use state::{ChargerStatus, StaticSystemState, SystemState};
pub use manager::{Manager, PhaseSwitchFilter};
pub use client::{Client, CommandUpdate};
