pub mod db;
pub mod domain;
pub mod store;

pub use db::PgProfileStore;
pub use domain::{
    CapturePeriod, DomainError, ObisCode, ProfileCursor, ProfileRow, ProfileSyncResult, RawValue,
    ScalerTable,
};
pub use store::{MemoryProfileStore, ProfileStore, StoreError};
