use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::DomainError;

/// Six-group OBIS identifier, e.g. `1.0.99.1.0.255` for load profile 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObisCode([u8; 6]);

impl ObisCode {
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self([a, b, c, d, e, f])
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl FromStr for ObisCode {
    type Err = DomainError;

    /// Accepts the dotted form (`1.0.99.1.0.255`) and the reduced-ID form
    /// (`1-0:99.1.0*255`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let groups: Vec<&str> = s
            .trim()
            .split(|c| matches!(c, '.' | '-' | ':' | '*'))
            .collect();
        if groups.len() != 6 {
            return Err(DomainError::InvalidObis(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (slot, group) in bytes.iter_mut().zip(groups) {
            *slot = group
                .parse()
                .map_err(|_| DomainError::InvalidObis(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for ObisCode {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObisCode> for String {
    fn from(code: ObisCode) -> Self {
        code.to_string()
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a}.{b}.{c}.{d}.{e}.{g}")
    }
}
