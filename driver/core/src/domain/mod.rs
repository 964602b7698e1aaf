// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Volume identity, naming conventions, differencing-disk chains and the
//! capability traits the driver needs from the outside world.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and rules, no I/O

pub mod volume;
pub mod vhd_chain;
pub mod remote;
pub mod mount;
pub mod driver_config;
