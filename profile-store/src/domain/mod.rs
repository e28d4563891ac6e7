pub mod obis;
pub mod profile;

pub use obis::ObisCode;
pub use profile::{
    CapturePeriod, ProfileCursor, ProfileRow, ProfileSyncResult, RawValue, ScalerTable,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid OBIS code '{0}'")]
    InvalidObis(String),
}
