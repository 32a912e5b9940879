pub mod cheat_day;
pub mod clock;
pub mod db;
pub mod error;
pub mod import;
pub mod models;
pub mod onboarding;
pub mod retention;
pub mod schema;
pub mod steps;
pub mod store;
pub mod streak;
pub mod sync_queue;

pub use clock::{Clock, FixedClock, SystemClock};
pub use db::Database;
pub use error::{StepServiceError, StepSourceError, StoreError, StoreResult};
pub use store::{ChangeEvent, ChangeOp, EntityRef, Store};
