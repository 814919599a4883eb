//! Polling and snapshot cache for Safe-Tec Trio water meters.
//!
//! The [`Coordinator`](coordinator::Coordinator) polls one device on two
//! cadences and serves the most recent normalized snapshot per channel.

pub mod models {
    pub mod device;
}

pub mod client;
pub mod config;
pub mod coordinator;
pub mod normalize;
pub mod shutdown;
pub mod utils;
pub mod services {
    pub mod assemble;
    pub mod rate;
    pub mod realtime;
}

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{CacheHandle, ChannelState, Coordinator, CoordinatorError, Event, Latest};
pub use models::device::{Channel, DeviceInfo, FieldKey, Snapshot, Value};
