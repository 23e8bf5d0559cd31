// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The wing daemon's library crate: X25519/AEAD key management, WebAuthn
//! passkey verification, the filesystem-backed session registry, the egg
//! spawner, the per-session PTY bridge, the encrypted control tunnel, and
//! hot-reloadable policy config. `main.rs` wires these together and owns
//! the process's signal handling and top-level CLI.

pub mod attach;
pub mod bridge;
pub mod config;
pub mod eggrpc;
pub mod keyengine;
pub mod passkey;
pub mod registry;
pub mod relay;
pub mod reload;
pub mod spawner;
pub mod tunnel;
