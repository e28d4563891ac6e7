pub mod app;
pub mod config;
pub mod correlation;
pub mod cursor;
pub mod device;
pub mod meter_lock;
pub mod metrics_server;
pub mod observability;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod sync;
pub mod worker;
pub mod wrapper;

pub use app::HeadEnd;
pub use sync::{ProfileSyncEngine, StopReason, SyncError, SyncOutcome};
