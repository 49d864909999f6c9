//! Byte-prefixed RPC: wire framing, method routing and the connection
//! demultiplexer used by the satellite transport server.
//!
//! A connection opens with an 8-byte magic header selecting the session
//! protocol; the remainder is a sequence of length-delimited frames
//! (see [`frame`]).

mod demux;
mod frame;
mod interceptor;
mod mux;
mod server;

pub use self::demux::{ListenMux, PrefixedStream, RoutedListener};
pub use self::frame::{Frame, FrameCodec, Metadata, MAX_FRAME_SIZE};
pub use self::interceptor::{current_experiment, ExperimentHandler, TraceHandler, EXPERIMENT_KEY, TRACE_ID_KEY};
pub use self::mux::{handler_fn, Call, Handler, Mux, Status, StatusCode};
pub use self::server::{EndpointCollection, RpcServer};

/// Length of every connection magic header, including the HTTP sniff prefix.
pub const HEADER_LEN: usize = 8;

/// Magic header opening a plain RPC session.
pub const RPC_HEADER: [u8; HEADER_LEN] = *b"ARPC!!!1";

/// Magic header opening a Noise-wrapped RPC session.
pub const NOISE_HEADER: [u8; HEADER_LEN] = *b"ARPC?!!1";

/// Prefix of an HTTP/1.1 `GET /` request, used for the HTTP fallback route.
pub const HTTP_PREFIX: [u8; HEADER_LEN] = *b"GET / HT";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge { size: usize },

    #[error("malformed frame: {reason}")]
    Malformed { reason: &'static str },

    #[error("unexpected frame kind: {kind}")]
    UnexpectedKind { kind: u8 },

    #[error("method already registered: {method}")]
    DuplicateMethod { method: String },
}
