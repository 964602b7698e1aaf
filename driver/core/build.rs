// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Build Script for hyperv-csi-core
//!
//! Compiles the vendored Container Storage Interface definitions into tonic
//! server and client stubs.
//!
//! # Compilation Targets
//!
//! - **CSI v1**: Identity, Controller and Node services (`../../proto/csi/v1/csi.proto`)
//!
//! Generated code is placed in `OUT_DIR` and included via `tonic::include_proto!`
//! in `src/presentation/grpc/mod.rs`.
//!
//! # Dependencies
//!
//! - **protoc**: Protocol buffer compiler (vendored via `protoc-bin-vendored`)
//! - **tonic-prost-build**: Code generator for Rust gRPC stubs

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Point prost at the vendored protoc and its bundled well-known types
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    let well_known = protoc_bin_vendored::include_path()?;

    let csi_proto = std::path::Path::new("../../proto/csi/v1/csi.proto");

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(
            &[csi_proto],
            &[std::path::Path::new("../../proto"), well_known.as_path()],
        )?;

    println!("cargo:rerun-if-changed={}", csi_proto.display());

    Ok(())
}
