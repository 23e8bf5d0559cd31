// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-level types shared between the wing daemon and anything that speaks
//! its relay protocol: the JSON envelope exchanged with the roost, the
//! decrypted tunnel inner messages, and the closed error-code vocabulary
//! that crosses process and network boundaries.

pub mod envelope;
pub mod error;
pub mod layout;
pub mod session;
pub mod spawn;
pub mod tunnel;

pub use envelope::Envelope;
pub use error::ErrorCode;
pub use layout::SessionDir;
pub use session::SessionMeta;
pub use spawn::SpawnSpec;
pub use tunnel::TunnelMessage;

/// Generated from `proto/wing/v1/wing.proto`: the local RPC surface between
/// a wing and the egg processes it spawns.
pub mod rpc {
    tonic::include_proto!("wing.v1");
}
