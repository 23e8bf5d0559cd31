// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `wing attach` — interactive terminal client for a session running on
//! *this* machine, dialing the egg's UNIX-domain socket directly.
//!
//! This bypasses the E2E-encrypted relay path entirely: a local operator
//! who can already read `{config_dir}/eggs/<id>/egg.token` is trusted by
//! construction (anyone with that kind of filesystem access could attach a
//! debugger to the egg anyway), so there is nothing the encryption would
//! add here. Recorded as a deliberate decision in DESIGN.md, not an
//! oversight.
//!
//! Modeled on this repo's own local interactive client: raw mode via
//! `nix::sys::termios`, a blocking stdin-reader thread, and Ctrl+] (0x1d)
//! as the detach key.

use std::io::Write as _;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;

use clap::Args;
use futures_util::StreamExt as _;
use nix::sys::termios;
use tokio::sync::mpsc;

use crate::eggrpc::{self, SessionResponse};

/// Detach key: Ctrl+] (ASCII 0x1d), same as telnet / docker attach.
const DETACH_KEY: u8 = 0x1d;

#[derive(Debug, Args)]
pub struct AttachArgs {
    /// Session id to attach to, as printed by `sessions.list`.
    pub session_id: String,

    /// Directory holding the `eggs/` session registry. Defaults to
    /// `$XDG_CONFIG_HOME/wing` or `~/.config/wing`.
    #[arg(long, env = "WING_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,
}

pub async fn run(args: AttachArgs) -> anyhow::Result<i32> {
    let config_dir = crate::config::resolve_config_dir(args.config_dir.as_deref())?;
    let sd = wire::SessionDir::new(&config_dir, &args.session_id);

    if !sd.sock().exists() {
        anyhow::bail!("no running session {:?} (no socket at {:?})", args.session_id, sd.sock());
    }
    let token = std::fs::read_to_string(sd.token())
        .map_err(|e| anyhow::anyhow!("reading {:?}: {e}", sd.token()))?;

    let mut client = eggrpc::connect(sd.sock(), token.trim()).await?;

    let (rows, cols) = terminal_size().unwrap_or((24, 80));
    let (input_tx, input_rx) = mpsc::channel::<eggrpc::SessionRequest>(64);
    input_tx
        .send(eggrpc::SessionRequest {
            msg: Some(wire::rpc::session_request::Msg::Resize(eggrpc::Resize {
                rows: rows as u32,
                cols: cols as u32,
            })),
        })
        .await
        .ok();

    let outbound = tokio_stream::wrappers::ReceiverStream::new(input_rx);
    let response = client.session(outbound).await?;
    let mut inbound = response.into_inner();

    let raw_guard = RawModeGuard::enter()?;

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let stdin = std::io::stdin();
        let mut handle = stdin.lock();
        let mut buf = [0u8; 4096];
        loop {
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut sigwinch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()).ok();

    let mut stdout = std::io::stdout();
    let mut exit_code = 0;

    loop {
        tokio::select! {
            chunk = stdin_rx.recv() => {
                let Some(chunk) = chunk else { break };
                if chunk.contains(&DETACH_KEY) {
                    break;
                }
                let _ = input_tx
                    .send(eggrpc::SessionRequest {
                        msg: Some(wire::rpc::session_request::Msg::Input(chunk)),
                    })
                    .await;
            }
            frame = inbound.next() => {
                match frame {
                    Some(Ok(SessionResponse { msg: Some(wire::rpc::session_response::Msg::Output(o)) })) => {
                        let _ = stdout.write_all(&o.data);
                        let _ = stdout.flush();
                    }
                    Some(Ok(SessionResponse { msg: Some(wire::rpc::session_response::Msg::ExitCode(e)) })) => {
                        exit_code = e.code.unwrap_or(0);
                        break;
                    }
                    Some(Ok(SessionResponse { msg: None })) => continue,
                    Some(Err(_)) | None => break,
                }
            }
            _ = async { sigwinch.as_mut().unwrap().recv().await }, if sigwinch.is_some() => {
                if let Some((rows, cols)) = terminal_size() {
                    let _ = input_tx
                        .send(eggrpc::SessionRequest {
                            msg: Some(wire::rpc::session_request::Msg::Resize(eggrpc::Resize {
                                rows: rows as u32,
                                cols: cols as u32,
                            })),
                        })
                        .await;
                }
            }
        }
    }

    drop(raw_guard);
    Ok(exit_code)
}

/// RAII guard that restores the original terminal attributes on drop.
struct RawModeGuard {
    fd: i32,
    original: termios::Termios,
}

impl RawModeGuard {
    fn enter() -> anyhow::Result<Self> {
        let fd = std::io::stdin().as_raw_fd();
        let borrowed = borrow_fd(fd);
        let original = termios::tcgetattr(borrowed)?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &raw)?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let borrowed = borrow_fd(self.fd);
        let _ = termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &self.original);
    }
}

fn borrow_fd(fd: i32) -> BorrowedFd<'static> {
    // SAFETY: stdin fd 0 is valid for the lifetime of the process.
    #[allow(unsafe_code)]
    unsafe {
        BorrowedFd::borrow_raw(fd)
    }
}

fn terminal_size() -> Option<(u16, u16)> {
    let fd = std::io::stdout().as_raw_fd();
    let mut ws = nix::libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ reads terminal size into a winsize struct; fd is
    // stdout and ws is a correctly laid out stack variable.
    #[allow(unsafe_code)]
    let ret = unsafe { nix::libc::ioctl(fd, nix::libc::TIOCGWINSZ, &mut ws) };
    if ret == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some((ws.ws_row, ws.ws_col))
    } else {
        None
    }
}
