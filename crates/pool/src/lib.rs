//! Engine pooling.
//!
//! Two layers: the [`ConnectionPool`] hands out bounded, health-checked
//! handles onto one opened engine; the [`InstanceManager`] lazily
//! opens, shares and evicts whole engines keyed by project id. Request
//! dispatch runs entirely on the manager's lock-free hot path.

pub mod manager;
pub mod pool;

pub use manager::{EngineLease, InstanceManager, ManagerStats};
pub use pool::{Connection, ConnectionPool, PoolStats};
