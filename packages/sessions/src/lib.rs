// ABOUTME: Session registry for Corral: lifecycle, execution slots and health monitoring
// ABOUTME: Every session state change goes through SessionRegistry

pub mod error;
pub mod monitor;
pub mod registry;
pub mod slot;
pub mod storage;
pub mod types;

pub use error::{Result, SessionError};
pub use monitor::{HealthCheck, MonitorReport, SessionMonitor};
pub use registry::SessionRegistry;
pub use slot::{CancelReason, CancelSignal, SlotGuard};
pub use storage::SessionStorage;
pub use types::{Session, SessionState};
