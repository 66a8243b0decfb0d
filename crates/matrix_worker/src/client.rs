//! Pooled intranet client.
//!
//! Keeps an idle connection pool per target endpoint. Connections are
//! liveness-checked with a PING frame before reuse, stamped on return and
//! reaped by a background janitor once idle past the configured expiry.

use matrix_protocol::envelope::EnvelopeError;
use matrix_protocol::{
    Envelope, Header, PayloadType, ProtocolError, RequestPacket, ResponsePacket, HEADER_SIZE,
    MAX_BODY_SIZE,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Liveness probe deadline.
const PING_TIMEOUT: Duration = Duration::from_secs(3);
/// Fresh dial deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Response read deadline.
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Pop-and-ping attempts before falling back to a batched pop.
const POP_ATTEMPTS: usize = 3;
/// Batched pop size.
const BATCH_POP: usize = 5;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("event call chain circular")]
    CircularCall,

    #[error("request body exceeds the 1 MiB frame limit: {0} bytes")]
    BodyTooLarge(usize),

    #[error("i/o timeout talking to {0}")]
    Timeout(String),

    #[error("remote replied with wire fault status {0}")]
    WireFault(u32),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_idle_per_host: usize,
    pub connection_expired: Duration,
    pub write_timeout: Duration,
    pub compress: bool,
    /// Advertised in the request `source_ip` field.
    pub source_ip: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            connection_expired: Duration::from_secs(300),
            write_timeout: Duration::from_secs(5),
            compress: false,
            source_ip: String::new(),
        }
    }
}

struct IdleConn {
    stream: TcpStream,
    last_used: Instant,
}

/// Per-endpoint pooled intranet client.
pub struct IntranetClient {
    config: ClientConfig,
    envelope: Envelope,
    pools: Mutex<HashMap<String, VecDeque<IdleConn>>>,
}

impl IntranetClient {
    pub fn new(config: ClientConfig, envelope: Envelope) -> Self {
        Self {
            config,
            envelope,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Issue an intranet call without call-chain tracking (control plane).
    pub async fn post(
        &self,
        endpoint: &str,
        event_type: u16,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<ResponsePacket> {
        self.post_chained(endpoint, event_type, payload_type, payload, "", "")
            .await
    }

    /// Issue an intranet call, appending `own_label` to the inbound chain.
    ///
    /// A label already present in the chain means the event graph looped
    /// back onto itself; the call is refused instead of hanging.
    pub async fn post_chained(
        &self,
        endpoint: &str,
        event_type: u16,
        payload_type: PayloadType,
        payload: &[u8],
        inbound_chain: &str,
        own_label: &str,
    ) -> Result<ResponsePacket> {
        let call_chain = extend_chain(inbound_chain, own_label)?;

        let mut request = RequestPacket::new(payload_type, event_type.to_string());
        request.payload = self.envelope.encrypt(payload);
        request.source_ip = self.config.source_ip.clone();
        request.call_chain = call_chain;

        let frame = request.pack(self.config.compress);
        let body_len = frame.len() - HEADER_SIZE;
        if body_len > MAX_BODY_SIZE as usize {
            return Err(ClientError::BodyTooLarge(body_len));
        }

        let mut stream = self.get(endpoint).await?;
        match self.roundtrip(&mut stream, &frame).await {
            Ok(mut response) => {
                self.put(endpoint, stream);
                response.payload = self.envelope.decrypt(&response.payload)?;
                Ok(response)
            }
            Err(e) => {
                // A half-read connection is useless; let it drop.
                Err(e)
            }
        }
    }

    /// Acquire a live connection: pooled first, freshly dialed as a last
    /// resort.
    async fn get(&self, endpoint: &str) -> Result<TcpStream> {
        for _ in 0..POP_ATTEMPTS {
            let Some(idle) = self.pop_one(endpoint) else {
                break;
            };
            let mut stream = idle.stream;
            if self.ping(&mut stream).await {
                return Ok(stream);
            }
        }

        let mut batch = self.pop_batch(endpoint, BATCH_POP).into_iter();
        while let Some(idle) = batch.next() {
            let mut stream = idle.stream;
            if self.ping(&mut stream).await {
                // The untested remainder goes straight back to the pool.
                self.push_back_batch(endpoint, batch);
                return Ok(stream);
            }
        }

        debug!("Dialing fresh intranet connection: {}", endpoint);
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| ClientError::Timeout(endpoint.to_string()))??;
        Ok(stream)
    }

    /// Return a connection to its endpoint pool; overflow closes it.
    fn put(&self, endpoint: &str, stream: TcpStream) {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let pool = pools.entry(endpoint.to_string()).or_default();
        if pool.len() < self.config.max_idle_per_host {
            pool.push_back(IdleConn {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    fn pop_one(&self, endpoint: &str) -> Option<IdleConn> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.get_mut(endpoint)?.pop_front()
    }

    fn pop_batch(&self, endpoint: &str, count: usize) -> Vec<IdleConn> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pool) = pools.get_mut(endpoint) else {
            return Vec::new();
        };
        let take = count.min(pool.len());
        pool.drain(..take).collect()
    }

    fn push_back_batch(&self, endpoint: &str, batch: impl Iterator<Item = IdleConn>) {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let pool = pools.entry(endpoint.to_string()).or_default();
        for idle in batch {
            if pool.len() >= self.config.max_idle_per_host {
                break;
            }
            pool.push_back(idle);
        }
    }

    async fn ping(&self, stream: &mut TcpStream) -> bool {
        let frame = RequestPacket::ping().pack(false);
        let probe = async {
            stream.write_all(&frame).await?;
            let response = read_response(stream).await?;
            Ok::<_, ClientError>(response.status_code == 200)
        };
        matches!(tokio::time::timeout(PING_TIMEOUT, probe).await, Ok(Ok(true)))
    }

    async fn roundtrip(&self, stream: &mut TcpStream, frame: &[u8]) -> Result<ResponsePacket> {
        tokio::time::timeout(self.config.write_timeout, stream.write_all(frame))
            .await
            .map_err(|_| ClientError::Timeout("write".to_string()))??;

        tokio::time::timeout(READ_TIMEOUT, read_response(stream))
            .await
            .map_err(|_| ClientError::Timeout("read".to_string()))?
    }

    /// Close idle connections past their expiry; drop empty pools.
    pub fn prune_expired(&self) {
        let expired = self.config.connection_expired;
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        for pool in pools.values_mut() {
            pool.retain(|idle| idle.last_used.elapsed() < expired);
        }
        pools.retain(|_, pool| !pool.is_empty());
    }

    /// Spawn the background janitor; runs until shutdown flips.
    pub fn start_janitor(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let client = Arc::clone(self);
        let period = client.config.connection_expired / 2;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = tick.tick() => client.prune_expired(),
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self, endpoint: &str) -> usize {
        let pools = self.pools.lock().unwrap();
        pools.get(endpoint).map_or(0, |p| p.len())
    }
}

/// Read and validate one response frame from the stream.
async fn read_response(stream: &mut TcpStream) -> Result<ResponsePacket> {
    let mut header_buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_buf).await?;
    let header = Header::unpack(&header_buf)?;

    let mut body = vec![0u8; header.body_len as usize];
    stream.read_exact(&mut body).await?;
    let response = ResponsePacket::unpack(&body, header.compressed)?;

    if response.status_code == matrix_protocol::response::STATUS_INVALID_HEADER {
        warn!("Peer rejected our frame as invalid");
        return Err(ClientError::WireFault(response.status_code));
    }
    Ok(response)
}

fn extend_chain(inbound: &str, own_label: &str) -> Result<String> {
    if own_label.is_empty() {
        return Ok(inbound.to_string());
    }
    if inbound.split(',').any(|label| label == own_label) {
        return Err(ClientError::CircularCall);
    }
    if inbound.is_empty() {
        Ok(own_label.to_string())
    } else {
        Ok(format!("{inbound},{own_label}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_chain() {
        assert_eq!(extend_chain("", "a->b@1").unwrap(), "a->b@1");
        assert_eq!(extend_chain("a->b@1", "c->d@1").unwrap(), "a->b@1,c->d@1");
        // No label: chain passes through untouched.
        assert_eq!(extend_chain("a->b@1", "").unwrap(), "a->b@1");
    }

    #[test]
    fn test_circular_chain_detected() {
        let result = extend_chain("a->b@1,c->d@1", "a->b@1");
        assert!(matches!(result, Err(ClientError::CircularCall)));
        assert_eq!(
            result.unwrap_err().to_string(),
            "event call chain circular"
        );
    }

    #[test]
    fn test_chain_match_is_exact() {
        // "a->b@1" is a substring of "xa->b@10" but not the same label.
        assert!(extend_chain("xa->b@10", "a->b@1").is_ok());
    }
}
