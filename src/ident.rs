//! Per-request artifact identifiers.

use std::fmt;

use uuid::Uuid;

pub const ID_LEN: usize = 8;

/// Lowercase only, so two ids never collide on case-insensitive filesystems.
const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Short opaque token prefixed to every stored file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix every stored name for this id starts with.
    pub fn prefix(&self) -> String {
        format!("{}_", self.0)
    }

    #[cfg(test)]
    pub(crate) fn fixed(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Draws a fresh id from the v4 UUID generator, which is backed by the OS
/// random source. 36^8 possible values.
pub fn allocate() -> ArtifactId {
    let mut bits = Uuid::new_v4().as_u128();
    let mut token = String::with_capacity(ID_LEN);
    for _ in 0..ID_LEN {
        token.push(ALPHABET[(bits % ALPHABET.len() as u128) as usize] as char);
        bits /= ALPHABET.len() as u128;
    }
    ArtifactId(token)
}
