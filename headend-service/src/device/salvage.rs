use dashmap::DashMap;
use profile_store::{ObisCode, ProfileRow};

use super::PartialRecovery;

/// Rows from completed blocks of the read currently in progress, per
/// (serial, profile). A successful read discards its entry; a failed read
/// leaves it for [`PartialRecovery::recover_partial`].
#[derive(Default)]
pub struct BlockSalvage {
    partial: DashMap<(String, ObisCode), Vec<ProfileRow>>,
}

impl BlockSalvage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new read, dropping whatever an earlier one left behind.
    pub fn begin(&self, serial: &str, obis: &ObisCode) {
        self.partial.insert((serial.to_string(), *obis), Vec::new());
    }

    pub fn stash(&self, serial: &str, obis: &ObisCode, rows: &[ProfileRow]) {
        self.partial
            .entry((serial.to_string(), *obis))
            .or_default()
            .extend_from_slice(rows);
    }

    pub fn discard(&self, serial: &str, obis: &ObisCode) {
        self.partial.remove(&(serial.to_string(), *obis));
    }

    pub fn pending_rows(&self, serial: &str, obis: &ObisCode) -> usize {
        self.partial
            .get(&(serial.to_string(), *obis))
            .map_or(0, |rows| rows.len())
    }
}

#[async_trait::async_trait]
impl PartialRecovery for BlockSalvage {
    async fn recover_partial(&self, serial: &str, obis: &ObisCode) -> Vec<ProfileRow> {
        let Some((_, mut rows)) = self.partial.remove(&(serial.to_string(), *obis)) else {
            return Vec::new();
        };
        rows.sort_by_key(|r| r.timestamp);
        rows.dedup_by_key(|r| r.timestamp);
        rows
    }
}
