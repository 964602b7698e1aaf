// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Hyper-V CSI driver core
//!
//! Bridges the CSI volume lifecycle to a Hyper-V host that is only reachable
//! through remote PowerShell, and provisions attached disks on the node.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Wires the domain, application, infrastructure and presentation layers

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
