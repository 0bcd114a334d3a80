//! Application Layer
//!
//! This module contains:
//! - Session: client side of one proxied stream
//! - Dispatcher / RemoteConnector: server side frame routing and destination relay
//! - Runtime: configuration-driven client and server assembly
//! - Metrics: Prometheus counters for the data path

mod dispatcher;
pub mod metrics;
mod relay;
mod remote;
mod runtime;
mod session;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use remote::RemoteConnector;
pub use runtime::{ClientRuntime, ServerRuntime};
pub use session::{Session, SessionContext, SessionIds};
