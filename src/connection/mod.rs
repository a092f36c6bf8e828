//! Connection lifecycle: state machine, server pool, heartbeat, outbound path.

pub mod conn;
pub(crate) mod heartbeat;
pub mod pool;
pub(crate) mod writer;

pub use conn::{Client, Event, RequestOptions, Stats};
pub use pool::{PoolUpdate, ServerEndpoint};
