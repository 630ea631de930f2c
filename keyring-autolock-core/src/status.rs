//! Tri-level security status derived from collection lock flags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::store::{Collection, CollectionId};

/// Aggregate security level of the keyring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    /// Every relevant collection is locked (also when there are none)
    High,
    /// Some relevant collections are locked, some are not
    Medium,
    /// No relevant collection is locked
    Low,
}

impl StatusLevel {
    /// Derive the level from lock counts over the relevant collections.
    pub fn from_counts(locked: usize, total: usize) -> Self {
        if locked == total {
            StatusLevel::High
        } else if locked == 0 {
            StatusLevel::Low
        } else {
            StatusLevel::Medium
        }
    }

    /// Symbolic icon name shown by the indicator for this level
    pub fn icon_name(&self) -> &'static str {
        match self {
            StatusLevel::High => "security-high-symbolic",
            StatusLevel::Medium => "security-medium-symbolic",
            StatusLevel::Low => "security-low-symbolic",
        }
    }

    /// Whether the keyring is fully locked
    pub fn is_locked(&self) -> bool {
        matches!(self, StatusLevel::High)
    }
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLevel::High => write!(f, "high"),
            StatusLevel::Medium => write!(f, "medium"),
            StatusLevel::Low => write!(f, "low"),
        }
    }
}

/// Result of a single status computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub locked: usize,
    pub total: usize,
    pub status: StatusLevel,
}

/// Compute the status of a set of collections.
///
/// Collections listed in `ignored`, and the session collection, do not count
/// towards either total.
pub fn compute_status(collections: &[Collection], ignored: &BTreeSet<CollectionId>) -> StatusCounts {
    let relevant = collections
        .iter()
        .filter(|c| !c.is_session() && !ignored.contains(&c.id));

    let (locked, total) = relevant.fold((0, 0), |(locked, total), c| {
        (locked + usize::from(c.locked), total + 1)
    });

    StatusCounts {
        locked,
        total,
        status: StatusLevel::from_counts(locked, total),
    }
}
