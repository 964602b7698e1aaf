// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`hyperv-csi-core`)
//!
//! CSI v1 gRPC surface that translates orchestrator requests into
//! application service calls. No business logic lives here; requests are
//! converted to domain types and errors are mapped to gRPC status codes.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`grpc`] | gRPC (Tonic) over a unix socket | Identity, Controller and Node services |

pub mod grpc;
