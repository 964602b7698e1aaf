// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod controller;
pub mod node;

pub use controller::{ControllerError, CreateVolumeParams, VolumeController, VolumeLifecycle};
pub use node::{NodeError, NodeProvisioner};
