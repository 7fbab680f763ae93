//! Eventflow: an event-transfer broker.
//!
//! A fixed pool of fixed-capacity event buffers flows through a routed
//! pipeline of stations; local callers use [`System`] directly, remote
//! clients reach the same pipeline over TCP via [`net::Remote`] after
//! UDP discovery.

pub mod config;
pub mod errors;
pub mod net;
pub mod pool;
pub mod station;
pub mod system;
pub mod types;

pub use config::{OpenConfig, SystemConfig};
pub use errors::{EtError, Result};
pub use pool::{Event, Pool};
pub use station::{Predicate, PredicateRegistry, Station, StationConfig};
pub use system::{Attachment, EventCensus, System};
pub use types::*;
