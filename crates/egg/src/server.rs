// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The per-session local RPC server: owns the PTY, the ring buffer, and
//! the set of attached subscribers. Exposes `Session`/`Kill`/`Status`/
//! `Version`/`List` over a UNIX-domain `tonic` service, authenticated by
//! a bearer token read from request metadata.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use wire::rpc::egg_server::Egg;
use wire::rpc::{
    session_request, session_response, ExitCode, KillRequest, KillResponse, ListRequest,
    ListResponse, Output, SessionRequest, SessionResponse, StatusRequest, StatusResponse,
    VersionRequest, VersionResponse,
};

use crate::audit::AuditWriter;
use crate::pty::{Backend, BackendInput, ExitStatus};
use crate::ring::RingBuffer;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Protocol version advertised over `Version()` — bumped when the wire
/// shape of `SessionRequest`/`SessionResponse` changes incompatibly.
pub const PROTOCOL_VERSION: &str = "1";

type Subscribers = Arc<Mutex<HashMap<u64, mpsc::Sender<Result<SessionResponse, Status>>>>>;

pub struct EggServer {
    agent: String,
    ring: Arc<Mutex<RingBuffer>>,
    subs: Subscribers,
    next_sub_id: AtomicU64,
    input_tx: mpsc::Sender<BackendInput>,
    child_pid: Option<u32>,
    token: String,
    started_at: Instant,
    last_activity: Arc<Mutex<Instant>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    audit: Arc<Mutex<Option<AuditWriter>>>,
}

impl EggServer {
    /// Spawn the PTY backend and start the reader/fan-out loop. Returns the
    /// server handle plus the backend's exit-status watcher so the caller
    /// (the egg `main`) can wait for the agent to exit and shut the process
    /// down.
    pub fn spawn(
        agent: String,
        mut backend: impl Backend,
        ring_capacity: usize,
        token: String,
        audit: AuditWriter,
    ) -> (Arc<Self>, watch::Receiver<Option<ExitStatus>>) {
        let child_pid = backend.child_pid();

        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(1024);
        let (input_tx, input_rx) = mpsc::channel::<BackendInput>(256);
        let (exit_tx, exit_rx) = watch::channel(None);

        let ring = Arc::new(Mutex::new(RingBuffer::new(ring_capacity)));
        let subs: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let audit = Arc::new(Mutex::new(Some(audit)));

        let server = Arc::new(Self {
            agent,
            ring: ring.clone(),
            subs: subs.clone(),
            next_sub_id: AtomicU64::new(1),
            input_tx,
            child_pid,
            token,
            started_at: Instant::now(),
            last_activity: last_activity.clone(),
            exit_rx: exit_rx.clone(),
            audit: audit.clone(),
        });

        // Reader/fan-out loop: the single consumer of PTY output. Never
        // blocks on a slow subscriber — a full queue means that
        // subscriber gets disconnected, not that everyone stalls.
        tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                {
                    let mut ring = ring.lock().await;
                    ring.write(&chunk);
                }
                if let Some(w) = audit.lock().await.as_mut() {
                    let _ = w.write_pty(&chunk);
                }
                *last_activity.lock().await = Instant::now();

                let frame = SessionResponse {
                    msg: Some(session_response::Msg::Output(Output {
                        data: chunk.to_vec(),
                        replay: false,
                    })),
                };
                let mut dead = Vec::new();
                {
                    let subs = subs.lock().await;
                    for (id, tx) in subs.iter() {
                        if tx.try_send(Ok(frame.clone())).is_err() {
                            dead.push(*id);
                        }
                    }
                }
                if !dead.is_empty() {
                    let mut subs = subs.lock().await;
                    for id in dead {
                        subs.remove(&id);
                    }
                }
            }
            if let Some(w) = audit.lock().await.take() {
                let _ = w.finish();
            }
        });

        // Backend run loop: owns the PTY master exclusively until the
        // agent exits.
        let exit_subs = subs.clone();
        tokio::spawn(async move {
            let status = backend.run(output_tx, input_rx).await;
            let status = status.unwrap_or(ExitStatus {
                code: None,
                signal: None,
            });
            let frame = SessionResponse {
                msg: Some(session_response::Msg::ExitCode(ExitCode {
                    code: status.code,
                    signal: status.signal,
                })),
            };
            for tx in exit_subs.lock().await.values() {
                let _ = tx.send(Ok(frame.clone())).await;
            }
            let _ = exit_tx.send(Some(status));
        });

        (server, exit_rx)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the session has had no subscribers and no PTY activity for
    /// at least `timeout`. Used by the idle-exit timer in `main`; a
    /// `timeout` of zero never expires (checked by the caller).
    pub async fn idle_for_at_least(&self, timeout: Duration) -> bool {
        self.subs.lock().await.is_empty() && self.last_activity.lock().await.elapsed() >= timeout
    }

    fn check_auth<T>(&self, req: &Request<T>) -> Result<(), Status> {
        let header = req
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("missing authorization"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Status::unauthenticated("malformed authorization header"))?;
        if constant_time_eq(token, &self.token) {
            Ok(())
        } else {
            Err(Status::unauthenticated("invalid token"))
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[tonic::async_trait]
impl Egg for Arc<EggServer> {
    type SessionStream = ReceiverStream<Result<SessionResponse, Status>>;

    async fn session(
        &self,
        request: Request<tonic::Streaming<SessionRequest>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        self.check_auth(&request)?;
        let mut inbound = request.into_inner();

        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel::<Result<SessionResponse, Status>>(SUBSCRIBER_QUEUE_CAPACITY);

        // First frame: the ring-buffer replay snapshot, possibly empty.
        let replay = {
            let ring = self.ring.lock().await;
            ring.snapshot()
        };
        let _ = tx
            .send(Ok(SessionResponse {
                msg: Some(session_response::Msg::Output(Output {
                    data: replay,
                    replay: true,
                })),
            }))
            .await;

        self.subs.lock().await.insert(sub_id, tx.clone());

        let input_tx = self.input_tx.clone();
        let subs = self.subs.clone();
        let mut exit_rx = self.exit_rx.clone();
        let audit = self.audit.clone();
        let last_activity = self.last_activity.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = inbound.message() => {
                        match next {
                            Ok(Some(req)) => match req.msg {
                                Some(session_request::Msg::Input(bytes)) => {
                                    *last_activity.lock().await = Instant::now();
                                    if let Some(w) = audit.lock().await.as_mut() {
                                        let _ = w.write_keylog(&bytes);
                                    }
                                    if input_tx
                                        .send(BackendInput::Write(Bytes::from(bytes)))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Some(session_request::Msg::Resize(r)) => {
                                    let _ = input_tx
                                        .send(BackendInput::Resize {
                                            rows: r.rows as u16,
                                            cols: r.cols as u16,
                                        })
                                        .await;
                                }
                                Some(session_request::Msg::Detach(_)) | None => break,
                            },
                            Ok(None) => break,
                            Err(_) => break,
                        }
                    }
                    changed = exit_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if exit_rx.borrow().is_some() {
                            break;
                        }
                    }
                }
            }
            subs.lock().await.remove(&sub_id);
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<KillResponse>, Status> {
        self.check_auth(&request)?;
        if let Some(pid) = self.child_pid {
            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGTERM);
            let deadline = KILL_GRACE;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = kill(pid, Signal::SIGKILL);
            });
        }
        Ok(Response::new(KillResponse {}))
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        self.check_auth(&request)?;
        let ring = self.ring.lock().await;
        let readers = self.subs.lock().await.len() as u32;
        let idle_seconds = self.last_activity.lock().await.elapsed().as_secs();
        Ok(Response::new(StatusResponse {
            agent: self.agent.clone(),
            buffer_bytes: ring.buffered_len(),
            total_written: ring.total_written(),
            total_trimmed: ring.oldest_offset(),
            readers,
            uptime_seconds: self.uptime().as_secs(),
            idle_seconds,
        }))
    }

    async fn version(
        &self,
        request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        self.check_auth(&request)?;
        Ok(Response::new(VersionResponse {
            protocol_version: PROTOCOL_VERSION.to_string(),
            build_version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn list(&self, request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        self.check_auth(&request)?;
        let subs = self.subs.lock().await;
        Ok(Response::new(ListResponse {
            subscriber_ids: subs.keys().copied().collect(),
        }))
    }
}
