//! Dedicated server sessions: lifecycle, keep-alive and the process-wide
//! registry.

mod backend;
mod keepalive;
mod registry;

pub use backend::{ActivityClock, BackendSession, SessionFactory, SessionState};
pub(crate) use backend::transport_error;
pub use registry::{
    EventLog, RegistryStats, SessionEvent, SessionInfo, SessionKey, SessionRegistry,
};
