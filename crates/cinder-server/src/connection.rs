//! Per-connection handler for the admin listener.
//!
//! Reads RESP arrays or inline command lines, runs each one against the
//! coordinator and writes the RESP reply. Pipelined requests are answered
//! in order.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cluster::ClusterCoordinator;
use crate::commands::Command;
use crate::frame::Frame;
use crate::parse::parse_request;

/// Initial read buffer size.
const BUF_CAPACITY: usize = 4096;

/// Largest request we buffer before giving up on the client.
const MAX_REQUEST: usize = 1024 * 1024;

/// Connections with no traffic for this long are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Serves one client until it disconnects, goes idle, or sends malformed
/// data.
///
/// Generic over the stream type so tests can drive it through an
/// in-memory duplex pipe.
pub async fn handle<S>(mut stream: S, coordinator: Arc<ClusterCoordinator>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(BUF_CAPACITY);
    let mut out = BytesMut::with_capacity(BUF_CAPACITY);

    loop {
        match tokio::time::timeout(IDLE_TIMEOUT, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()),
        }

        out.clear();
        loop {
            match parse_request(&buf) {
                Ok(Some((args, consumed))) => {
                    buf.advance(consumed);
                    if args.is_empty() {
                        continue;
                    }
                    let args: Vec<&str> = args.iter().map(String::as_str).collect();
                    respond(&args, &coordinator).await.serialize(&mut out);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("closing connection on protocol error: {e}");
                    Frame::err(format!("Protocol error: {e}")).serialize(&mut out);
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }

        if buf.len() > MAX_REQUEST {
            Frame::err("max request size exceeded, closing connection").serialize(&mut out);
            stream.write_all(&out).await?;
            return Ok(());
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
        }
    }
}

/// Parses and runs one request.
pub async fn respond(args: &[&str], coordinator: &ClusterCoordinator) -> Frame {
    let cmd = match Command::from_args(args) {
        Ok(cmd) => cmd,
        Err(e) => return Frame::err(e),
    };
    let name = cmd.name();
    let reply = match cmd {
        Command::Ping(None) => Frame::Simple("PONG".into()),
        Command::Ping(Some(msg)) => Frame::text(msg),
        Command::Cluster(sub) => coordinator.execute(sub).await,
    };
    if reply.is_error() {
        debug!(cmd = name, "command failed");
    }
    reply
}
