use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf as _, BufMut as _, BytesMut};
use snow::TransportState;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf};

use crate::{Config, Error};

// Noise caps a transport message at 65535 bytes, 16 of which are the AEAD tag.
const MAX_MESSAGE_LEN: usize = 65535;
const TAG_LEN: usize = 16;
const MAX_PAYLOAD_LEN: usize = MAX_MESSAGE_LEN - TAG_LEN;

const READ_CHUNK_LEN: usize = 16 * 1024;
const SEND_HIGH_WATERMARK: usize = 128 * 1024;

/// An established Noise session speaking length-framed transport messages.
///
/// Implements `AsyncRead`/`AsyncWrite` so the RPC serving engine treats it
/// like any other byte stream.
pub struct NoiseStream<S> {
    inner: S,
    transport: TransportState,
    recv_ciphertext: BytesMut,
    recv_plaintext: BytesMut,
    send_buf: BytesMut,
    scratch: Vec<u8>,
}

impl<S> NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Accepts the IK handshake as the responder.
    pub async fn responder(mut inner: S, config: &Config) -> Result<Self, Error> {
        let mut handshake = config.responder()?;
        let mut scratch = vec![0u8; MAX_MESSAGE_LEN];

        // <- e, es, s, ss
        let message = read_handshake_message(&mut inner).await?;
        handshake.read_message(&message, &mut scratch)?;

        // -> e, ee, se
        let len = handshake.write_message(&[], &mut scratch)?;
        write_handshake_message(&mut inner, &scratch[..len]).await?;

        Ok(Self::from_transport(inner, handshake.into_transport_mode()?, scratch))
    }

    /// Runs the IK handshake as the initiator against a known static key,
    /// typically learned from a verified [`crate::KeyAttestation`].
    pub async fn initiator(mut inner: S, config: &Config, remote_public_key: &[u8; 32]) -> Result<Self, Error> {
        let mut handshake = config.initiator(remote_public_key)?;
        let mut scratch = vec![0u8; MAX_MESSAGE_LEN];

        let len = handshake.write_message(&[], &mut scratch)?;
        write_handshake_message(&mut inner, &scratch[..len]).await?;

        let message = read_handshake_message(&mut inner).await?;
        handshake.read_message(&message, &mut scratch)?;

        Ok(Self::from_transport(inner, handshake.into_transport_mode()?, scratch))
    }

    fn from_transport(inner: S, transport: TransportState, scratch: Vec<u8>) -> Self {
        Self {
            inner,
            transport,
            recv_ciphertext: BytesMut::new(),
            recv_plaintext: BytesMut::new(),
            send_buf: BytesMut::new(),
            scratch,
        }
    }

    /// Static key of the remote party.
    pub fn remote_public_key(&self) -> Option<[u8; 32]> {
        self.transport
            .get_remote_static()
            .and_then(|key| <[u8; 32]>::try_from(key).ok())
    }

    fn decrypt_buffered(&mut self) -> io::Result<bool> {
        if self.recv_ciphertext.len() < 2 {
            return Ok(false);
        }

        let length = usize::from(u16::from_be_bytes([self.recv_ciphertext[0], self.recv_ciphertext[1]]));
        if self.recv_ciphertext.len() < 2 + length {
            return Ok(false);
        }

        self.recv_ciphertext.advance(2);
        let frame = self.recv_ciphertext.split_to(length);

        let n = self
            .transport
            .read_message(&frame, &mut self.scratch)
            .map_err(io::Error::other)?;
        self.recv_plaintext.extend_from_slice(&self.scratch[..n]);
        Ok(true)
    }

    fn flush_send_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.send_buf.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.send_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "noise transport closed while flushing",
                    )));
                }
                Poll::Ready(Ok(n)) => self.send_buf.advance(n),
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
            }
        }

        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.recv_plaintext.is_empty() {
                let n = usize::min(this.recv_plaintext.len(), buf.remaining());
                buf.put_slice(&this.recv_plaintext[..n]);
                this.recv_plaintext.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.decrypt_buffered()? {
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK_LEN];
            let mut read_buf = ReadBuf::new(&mut chunk);

            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();

                    if filled.is_empty() {
                        if this.recv_ciphertext.is_empty() {
                            // Clean end of stream at a message boundary.
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "noise transport closed mid-message",
                        )));
                    }

                    this.recv_ciphertext.extend_from_slice(filled);
                }
            }
        }
    }
}

impl<S> AsyncWrite for NoiseStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.send_buf.len() >= SEND_HIGH_WATERMARK {
            match this.flush_send_buf(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Ready(Ok(())) => {}
            }
        }

        let chunk = &buf[..usize::min(buf.len(), MAX_PAYLOAD_LEN)];
        let n = this
            .transport
            .write_message(chunk, &mut this.scratch)
            .map_err(io::Error::other)?;

        this.send_buf.put_u16(u16::try_from(n).expect("noise message length fits u16"));
        this.send_buf.extend_from_slice(&this.scratch[..n]);

        if let Poll::Ready(Err(error)) = this.flush_send_buf(cx) {
            return Poll::Ready(Err(error));
        }

        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.flush_send_buf(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.flush_send_buf(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

async fn read_handshake_message<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + Unpin,
{
    let length = usize::from(stream.read_u16().await?);
    let mut message = vec![0u8; length];
    stream.read_exact(&mut message).await?;
    Ok(message)
}

async fn write_handshake_message<S>(stream: &mut S, message: &[u8]) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let length = u16::try_from(message.len()).map_err(|_| Error::MessageTooLarge { size: message.len() })?;
    stream.write_all(&length.to_be_bytes()).await?;
    stream.write_all(message).await?;
    stream.flush().await?;
    Ok(())
}
