use std::io;
use std::sync::Arc;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frame::{Frame, FrameCodec};
use crate::interceptor::{ExperimentHandler, TraceHandler};
use crate::mux::{Call, Handler, Mux};

/// Serving engine for a single framed session.
///
/// Drives the invoke/response cycle over any byte stream; session security
/// (TLS, Noise, QUIC) is the caller's concern.
pub struct RpcServer {
    handler: Arc<dyn Handler>,
}

impl RpcServer {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }

    /// Serves invocations until the peer hangs up or `cancel` fires.
    pub async fn serve_stream<S>(&self, cancel: &CancellationToken, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut framed = Framed::new(stream, FrameCodec);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = framed.next() => match frame {
                    None => return Ok(()),
                    Some(frame) => frame?,
                },
            };

            let Frame::Invoke {
                method,
                metadata,
                payload,
            } = frame
            else {
                debug!("peer sent a non-invoke frame, closing session");
                return Err(io::Error::other("unexpected frame kind in session"));
            };

            let reply = self
                .handler
                .handle(Call {
                    method,
                    metadata,
                    payload,
                })
                .await;

            let frame = match reply {
                Ok(payload) => Frame::Response { payload },
                Err(status) => Frame::Error {
                    code: status.code,
                    message: status.message,
                },
            };

            framed.send(frame).await?;
        }
    }
}

/// A routing table plus its serving engine, one per endpoint surface.
///
/// Dispatch goes through the experiment-tag and trace interceptors before
/// reaching the mux, mirroring what every surface of the server expects.
pub struct EndpointCollection {
    mux: Arc<Mux>,
    server: RpcServer,
}

impl EndpointCollection {
    pub fn new() -> Self {
        let mux = Arc::new(Mux::new());

        let traced = Arc::new(TraceHandler::new(Arc::clone(&mux) as Arc<dyn Handler>));
        let root = Arc::new(ExperimentHandler::new(traced));

        Self {
            mux,
            server: RpcServer::new(root),
        }
    }

    /// Registration handle.
    pub fn mux(&self) -> &Arc<Mux> {
        &self.mux
    }

    pub fn server(&self) -> &RpcServer {
        &self.server
    }
}

impl Default for EndpointCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::frame::Metadata;
    use crate::mux::{handler_fn, StatusCode};
    use bytes::Bytes;
    use futures_util::{SinkExt as _, StreamExt as _};

    async fn invoke<S>(framed: &mut Framed<S, FrameCodec>, method: &str, payload: &'static [u8]) -> Frame
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        framed
            .send(Frame::Invoke {
                method: method.to_owned(),
                metadata: Metadata::new(),
                payload: Bytes::from_static(payload),
            })
            .await
            .unwrap();
        framed.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn serves_requests_in_sequence() {
        let endpoints = EndpointCollection::new();
        endpoints
            .mux()
            .register("node.Echo", handler_fn(|call: Call| async move { Ok(call.payload) }))
            .unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        let serve = async { endpoints.server().serve_stream(&cancel, server).await };

        let drive = async {
            let mut framed = Framed::new(client, FrameCodec);

            let reply = invoke(&mut framed, "node.Echo", b"one").await;
            assert_eq!(reply, Frame::Response { payload: Bytes::from_static(b"one") });

            let reply = invoke(&mut framed, "node.Missing", b"").await;
            assert!(matches!(reply, Frame::Error { code: StatusCode::Unimplemented, .. }));

            drop(framed);
        };

        let (served, ()) = tokio::join!(serve, drive);
        served.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_the_session() {
        let endpoints = EndpointCollection::new();
        let (client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        cancel.cancel();
        endpoints.server().serve_stream(&cancel, server).await.unwrap();
        drop(client);
    }
}
