//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fabric index.
///
/// Identifies a fabric (a logical trust domain) on the local device. Index 0
/// is reserved to mean "no fabric"; real fabrics occupy `1..=254`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FabricIndex(pub u8);

impl FabricIndex {
    /// The reserved "no fabric" index. Also the accessing fabric of a
    /// commissioner that has no fabric yet.
    pub const UNDEFINED: Self = FabricIndex(0);
}

impl Default for FabricIndex {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for FabricIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fabric({})", self.0)
    }
}
