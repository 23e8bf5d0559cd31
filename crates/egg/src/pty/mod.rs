// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod nbio;
pub mod spawn;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;

/// How the agent subprocess exited.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Input sent to the PTY backend while its `run` loop owns the master fd.
#[derive(Debug)]
pub enum BackendInput {
    Write(Bytes),
    Resize { rows: u16, cols: u16 },
    /// Drain marker: since the backend processes messages sequentially,
    /// all prior writes are complete when this is received. The sender
    /// is notified via the oneshot channel.
    Drain(tokio::sync::oneshot::Sender<()>),
}

/// Terminal backend abstraction over the PTY.
///
/// Object-safe for use as `Box<dyn Backend>`.
pub trait Backend: Send + 'static {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        input_rx: mpsc::Receiver<BackendInput>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>>;

    /// Valid only before `run` has been called (or moved into a task) —
    /// callers should cache this at spawn time.
    fn child_pid(&self) -> Option<u32>;
}
