// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../../proto/wing/v1/wing.proto"], &["../../proto"])?;

    println!("cargo:rerun-if-changed=../../proto/wing/v1/wing.proto");

    Ok(())
}
