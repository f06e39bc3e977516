use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::opts::Opts;

/// Open the TCP transport with the configured socket hints applied.
///
/// Only transport-layer options are applied here; the driver frames its own
/// binary reads, so nothing in [`TcpOpts`](crate::TcpOpts) can change framing
/// or payload shape.
pub(crate) async fn connect(opts: &Opts) -> Result<TcpStream> {
    let addr = lookup_host(format!("{}:{}", opts.host, opts.port))
        .await?
        .next()
        .ok_or_else(|| Error::BadConfigError(format!("no address found for {}", opts.host)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(size) = opts.tcp.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = opts.tcp.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }

    let stream = match timeout(opts.connect_timeout, socket.connect(addr)).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )));
        }
    };

    stream.set_nodelay(opts.tcp.nodelay)?;
    if let Some(ttl) = opts.tcp.ttl {
        stream.set_ttl(ttl)?;
    }

    Ok(stream)
}
