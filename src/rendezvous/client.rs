//! Rendezvous client
//!
//! Each call opens a fresh connection, issues one request and closes.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{encode_register, request, RendezvousEntry, RendezvousError, RendezvousResult, MAX_LIST_ENTRIES};

/// Register `port` under the address the server observes for this host
pub async fn register(server: SocketAddr, port: u16, timeout: Duration) -> RendezvousResult<()> {
    tokio::time::timeout(timeout, send_register(server, port))
        .await
        .map_err(|_| RendezvousError::Timeout)?
}

/// Fetch every registration, oldest first
pub async fn list(server: SocketAddr, timeout: Duration) -> RendezvousResult<Vec<RendezvousEntry>> {
    tokio::time::timeout(timeout, fetch_list(server))
        .await
        .map_err(|_| RendezvousError::Timeout)?
}

async fn send_register(server: SocketAddr, port: u16) -> RendezvousResult<()> {
    let mut stream = TcpStream::connect(server).await?;
    stream.write_all(&encode_register(port)).await?;
    stream.shutdown().await?;
    tracing::debug!("Registered port {} with rendezvous {}", port, server);
    Ok(())
}

async fn fetch_list(server: SocketAddr) -> RendezvousResult<Vec<RendezvousEntry>> {
    let mut stream = TcpStream::connect(server).await?;
    stream.write_u8(request::LIST).await?;

    let count = stream.read_i32().await?;
    if count <= 0 {
        return Ok(Vec::new());
    }
    let count = count as usize;
    if count > MAX_LIST_ENTRIES {
        return Err(RendezvousError::Protocol("listing too large"));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let mut octets = [0u8; 4];
        stream.read_exact(&mut octets).await?;
        let port = u16::try_from(stream.read_i32().await?)
            .map_err(|_| RendezvousError::Protocol("port out of range"))?;
        entries.push(RendezvousEntry::new(Ipv4Addr::from(octets), port));
    }

    tracing::debug!("Rendezvous {} listed {} entries", server, entries.len());
    Ok(entries)
}
