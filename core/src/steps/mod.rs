//! Daily step reconciliation: sensor sources, the fast cache, the pure
//! reconciler and the background service tying them to the store.

pub mod cache;
pub mod reconcile;
pub mod service;
pub mod source;
pub mod watchdog;

pub use cache::{FileStepCache, MemoryStepCache, StepCache};
pub use reconcile::{Observation, StepReconciler};
pub use service::{StepService, StepServiceConfig, StepServiceHandle};
pub use source::{ChannelStepSource, SimulatedStepSource, StepFeeder, StepSource, StepSourceKind};
pub use watchdog::{StepHealth, WatchdogConfig, assess, check_step_heartbeat};
