//! Intranet TCP server.
//!
//! One task per connection; requests on a connection are answered in
//! order, so callers can pair request and response by blocking on their
//! socket. Each request body lands in a pooled buffer and is processed on
//! its own spawned task whose JoinHandle doubles as the panic boundary:
//! a panicking handler costs a 500 reply and an error count, never the
//! process.

use matrix_protocol::response::invalid_header_frame;
use matrix_protocol::{
    Envelope, Header, PayloadType, RequestPacket, ResponsePacket, HEADER_SIZE,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::dispatch::Dispatcher;
use crate::metrics::ServerMetrics;

pub struct IntranetServer {
    dispatcher: Arc<Dispatcher>,
    envelope: Envelope,
    metrics: Arc<ServerMetrics>,
    buffers: BufferPool,
    compress: bool,
}

impl IntranetServer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        envelope: Envelope,
        metrics: Arc<ServerMetrics>,
        compress: bool,
    ) -> Self {
        Self {
            dispatcher,
            envelope,
            metrics,
            buffers: BufferPool::new(),
            compress,
        }
    }

    /// Accept loop; runs until shutdown flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "Intranet server listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.metrics.inc_connections();
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Intranet server stopped");
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        debug!("Intranet connection from {}", peer);

        loop {
            let mut header_buf = [0u8; HEADER_SIZE];
            if stream.read_exact(&mut header_buf).await.is_err() {
                // Peer closed (or died); either way the conversation is over.
                break;
            }

            let header = match Header::unpack(&header_buf) {
                Ok(header) => header,
                Err(e) => {
                    warn!("Invalid frame header from {}: {}", peer, e);
                    self.metrics.inc_errors();
                    let _ = stream.write_all(&invalid_header_frame()).await;
                    break;
                }
            };

            let mut body = self.buffers.acquire(header.body_len as usize);
            if stream.read_exact(body.as_mut_slice()).await.is_err() {
                break;
            }
            self.metrics.inc_requests();

            let frame = self.process(header, body, peer).await;
            if stream.write_all(&frame).await.is_err() {
                break;
            }
        }
    }

    /// Run one request on its own task so a panic is contained there.
    async fn process(self: &Arc<Self>, header: Header, body: PooledBuf, peer: SocketAddr) -> Vec<u8> {
        let server = Arc::clone(self);
        let task = tokio::spawn(async move { server.process_inner(header, body, peer).await });

        match task.await {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.inc_errors();
                error!("Request processor panicked: {}", e);
                ResponsePacket::new(500, PayloadType::Text, "internal error").pack(false)
            }
        }
    }

    async fn process_inner(
        self: Arc<Self>,
        header: Header,
        body: PooledBuf,
        peer: SocketAddr,
    ) -> Vec<u8> {
        let mut request = match RequestPacket::unpack(body.as_slice(), header.compressed) {
            Ok(request) => request,
            Err(e) => {
                debug!("Undecodable request from {}: {}", peer, e);
                return ResponsePacket::new(400, PayloadType::Text, "bad request").pack(false);
            }
        };
        // The decoded request owns its bytes; the pooled buffer can go back.
        drop(body);

        if request.payload_type == PayloadType::Ping {
            return ResponsePacket::pong().pack(false);
        }

        match self.envelope.decrypt(&request.payload) {
            Ok(plain) => request.payload = plain,
            Err(e) => {
                debug!("Undecryptable payload from {}: {}", peer, e);
                return ResponsePacket::new(403, PayloadType::Text, "decrypt failed").pack(false);
            }
        }

        if request.source_ip.is_empty() {
            request.source_ip = peer.ip().to_string();
        }

        let reply = self.dispatcher.dispatch_intranet(&request).await;
        let payload = self.envelope.encrypt(&reply.payload);
        ResponsePacket::new(reply.status, reply.content_type, payload).pack(self.compress)
    }
}
