// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Differencing-disk chains
//!
//! Hyper-V checkpoints turn a volume into a chain of images: the base `.vhdx`
//! plus `.avhdx` children, each recording its parent. Only the leaf of the
//! chain holds the current writable state, so that is the image to attach.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One image in a chain, as reported by `Get-VHD | Select ParentPath, Path`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    #[serde(rename = "Path")]
    pub path: String,

    /// Empty (or `null` on the wire) for the base image
    #[serde(rename = "ParentPath", default, deserialize_with = "null_as_empty")]
    pub parent_path: String,
}

impl ChainEntry {
    pub fn new(path: impl Into<String>, parent_path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            parent_path: parent_path.into(),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("no disk images found for volume")]
    Empty,

    #[error("disk image chain has no base image")]
    NoRoot,

    #[error("disk image '{parent}' has more than one child: {children:?}")]
    Ambiguous {
        parent: String,
        children: Vec<String>,
    },

    #[error("disk image chain does not terminate after {steps} steps")]
    Cycle { steps: usize },
}

/// Find the active leaf image of a differencing chain.
///
/// The walk starts at the base image (empty parent) and follows children
/// until none is left. It never takes more steps than there are entries.
pub fn resolve_leaf(entries: &[ChainEntry]) -> Result<String, ChainError> {
    if entries.is_empty() {
        return Err(ChainError::Empty);
    }

    let mut children: HashMap<&str, &str> = HashMap::with_capacity(entries.len());
    for entry in entries {
        let parent = entry.parent_path.as_str();
        if let Some(existing) = children.insert(parent, entry.path.as_str()) {
            let mut siblings: Vec<String> = entries
                .iter()
                .filter(|e| e.parent_path == parent)
                .map(|e| e.path.clone())
                .collect();
            siblings.sort();
            tracing::warn!(
                parent = %parent,
                first = %existing,
                children = ?siblings,
                "Differencing chain branches; refusing to pick a leaf"
            );
            return Err(ChainError::Ambiguous {
                parent: parent.to_string(),
                children: siblings,
            });
        }
    }

    let Some(mut current) = children.get("").copied() else {
        // A lone image whose parent lives outside the volume's prefix is still a leaf
        if entries.len() == 1 {
            return Ok(entries[0].path.clone());
        }
        return Err(ChainError::NoRoot);
    };

    for _ in 0..entries.len() {
        match children.get(current) {
            Some(child) => current = child,
            None => return Ok(current.to_string()),
        }
    }

    Err(ChainError::Cycle {
        steps: entries.len(),
    })
}
