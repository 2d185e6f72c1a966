use crate::protocol::{self, DEFAULT_MAX_FRAME_SIZE};
use anyhow::Result;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info};

/// Writes every frame it receives straight back, so heartbeat replies carry
/// the client's own timestamp.
pub struct EchoServer {
    listener: TcpListener,
    max_frame_size: usize,
}

impl EchoServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("Echo server listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((socket, client_addr)) => {
                    debug!("New connection from {}", client_addr);
                    let max_frame_size = self.max_frame_size;

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(socket, max_frame_size).await {
                            error!(error = %e, "Error handling client {}", client_addr);
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

async fn handle_client(socket: TcpStream, max_frame_size: usize) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();
    let mut echoed = 0u64;

    while let Some(payload) = protocol::read_frame(&mut reader, max_frame_size).await? {
        writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        writer.write_all(&payload).await?;
        echoed += 1;
    }

    debug!("Client disconnected after {} frames", echoed);
    Ok(())
}
