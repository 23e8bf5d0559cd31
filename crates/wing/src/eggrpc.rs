// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wing-side client for the local RPC surface an egg exposes over its
//! UNIX-domain socket. Every call carries the contents of
//! `egg.token` as a bearer `authorization` header.

use std::path::PathBuf;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Request, Status};
use tower::service_fn;

pub use wire::rpc::egg_client::EggClient;
pub use wire::rpc::{
    Detach, KillRequest, KillResponse, ListRequest, ListResponse, Resize, SessionRequest,
    SessionResponse, StatusRequest, StatusResponse, VersionRequest, VersionResponse,
};

use crate::bridge::{EggFrame, EggInput, EggOutput};

/// A connected client, ready to make calls. Every outgoing request is
/// stamped with the session's bearer token by [`AuthInterceptor`].
pub type Client = EggClient<tonic::service::interceptor::InterceptedService<Channel, AuthInterceptor>>;

#[derive(Clone)]
pub struct AuthInterceptor {
    header: MetadataValue<tonic::metadata::Ascii>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert("authorization", self.header.clone());
        Ok(request)
    }
}

/// Dial the egg's socket at `sock_path`. `token` is the file content of
/// `egg.token`, unmodified.
///
/// The URI given to [`Endpoint`] is a placeholder: the custom connector
/// ignores it and always dials `sock_path` over a UNIX domain socket.
pub async fn connect(sock_path: PathBuf, token: &str) -> Result<Client, anyhow::Error> {
    let header = MetadataValue::try_from(format!("Bearer {token}"))
        .map_err(|e| anyhow::anyhow!("invalid bearer token: {e}"))?;

    let channel = Endpoint::try_from("http://[::]:0")
        .map_err(|e| anyhow::anyhow!("building local endpoint: {e}"))?
        .connect_with_connector(service_fn(move |_: Uri| {
            let sock_path = sock_path.clone();
            async move {
                let stream = UnixStream::connect(sock_path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|e| anyhow::anyhow!("connecting to egg socket: {e}"))?;

    Ok(EggClient::with_interceptor(channel, AuthInterceptor { header }))
}

/// Bounded so a stalled egg applies backpressure to `PTYBridge::input`
/// rather than letting queued keystrokes grow without bound.
const SESSION_INPUT_QUEUE: usize = 64;

struct RealEggInput {
    tx: tokio::sync::mpsc::Sender<SessionRequest>,
}

#[tonic::async_trait]
impl EggInput for RealEggInput {
    async fn input(&self, data: Vec<u8>) -> anyhow::Result<()> {
        self.tx
            .send(SessionRequest {
                msg: Some(wire::rpc::session_request::Msg::Input(data)),
            })
            .await
            .map_err(|_| anyhow::anyhow!("egg input channel closed"))
    }

    async fn resize(&self, rows: u16, cols: u16) -> anyhow::Result<()> {
        self.tx
            .send(SessionRequest {
                msg: Some(wire::rpc::session_request::Msg::Resize(Resize {
                    rows: rows as u32,
                    cols: cols as u32,
                })),
            })
            .await
            .map_err(|_| anyhow::anyhow!("egg input channel closed"))
    }
}

struct RealEggOutput {
    inbound: tonic::Streaming<SessionResponse>,
}

#[tonic::async_trait]
impl EggOutput for RealEggOutput {
    async fn next_frame(&mut self) -> Option<EggFrame> {
        match self.inbound.message().await {
            Ok(Some(resp)) => match resp.msg {
                Some(wire::rpc::session_response::Msg::Output(o)) => Some(EggFrame::Output {
                    data: o.data,
                    replay: o.replay,
                }),
                Some(wire::rpc::session_response::Msg::ExitCode(e)) => Some(EggFrame::Exit {
                    code: e.code,
                    signal: e.signal,
                }),
                None => None,
            },
            Ok(None) | Err(_) => None,
        }
    }
}

/// Open a new bidirectional `Session` stream on an already-connected
/// client. Each call establishes an independent subscription against the
/// egg's PTY ring — used both for the first attach and for every re-key
/// cutover.
pub async fn open_session(
    mut client: Client,
) -> Result<(Arc<dyn EggInput>, Box<dyn EggOutput>), anyhow::Error> {
    let (tx, rx) = tokio::sync::mpsc::channel::<SessionRequest>(SESSION_INPUT_QUEUE);
    let outbound = tokio_stream::wrappers::ReceiverStream::new(rx);
    let response = client
        .session(outbound)
        .await
        .map_err(|e| anyhow::anyhow!("opening session stream: {e}"))?;
    let inbound = response.into_inner();
    Ok((
        Arc::new(RealEggInput { tx }),
        Box::new(RealEggOutput { inbound }),
    ))
}
