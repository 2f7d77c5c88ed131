//! Thin binary wiring [`bupstore::proto::ServerSession`] to a transport (spec.md §4.8,
//! §6). All the protocol logic lives in `bupstore`; this crate only resolves which
//! file descriptors the control channel runs over and starts the dispatch loop on
//! them.

use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use log::info;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use bupstore::proto::ServerSession;

/// Glues an independently-owned reader half and writer half into one
/// `AsyncRead + AsyncWrite` transport. Stdio and the reverse-mode fd pair both arrive
/// as two separate handles rather than one bidirectional stream.
struct Duplex<R, W> {
    reader: R,
    writer: W,
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for Duplex<R, W> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for Duplex<R, W> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

#[cfg(unix)]
fn reverse_transport() -> Result<Duplex<tokio::fs::File, tokio::fs::File>> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: BUP_SERVER_REVERSE (spec.md §6) is only ever set by a driver that has
    // already dup2'd its own ends of the pipe onto fds 3 and 4 before exec'ing this
    // binary; there is no other contract for these descriptors to exist under.
    let read = unsafe { std::fs::File::from_raw_fd(3) };
    let write = unsafe { std::fs::File::from_raw_fd(4) };
    Ok(Duplex { reader: tokio::fs::File::from_std(read), writer: tokio::fs::File::from_std(write) })
}

#[cfg(not(unix))]
fn reverse_transport() -> Result<Duplex<tokio::fs::File, tokio::fs::File>> {
    anyhow::bail!("BUP_SERVER_REVERSE is only supported on unix targets")
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    if std::env::var_os("BUP_SERVER_REVERSE").is_some() {
        info!("starting in reverse mode on fds 3/4");
        let stream = reverse_transport()?;
        ServerSession::new(stream).run().await.context("server session failed")
    } else {
        info!("starting on stdio");
        let stream = Duplex { reader: tokio::io::stdin(), writer: tokio::io::stdout() };
        ServerSession::new(stream).run().await.context("server session failed")
    }
}
