/// UDP forwarding of transport stream payloads, one destination per
/// receiver. Payloads are batched seven to a datagram, the usual framing
/// for TS over UDP.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::UdpSocket;
use whdriver::board::transfer::PAYLOAD_SIZE;

use crate::config::OutputConfig;
use crate::monitor::RECEIVERS;

pub const PACKETS_PER_DATAGRAM: usize = 7;
const DATAGRAM_SIZE: usize = PAYLOAD_SIZE * PACKETS_PER_DATAGRAM;

struct Route {
    target: SocketAddr,
    pending: Vec<u8>,
}

/// Accumulates payloads per receiver until a datagram is full
#[derive(Default)]
pub struct Batcher {
    routes: [Option<Route>; RECEIVERS],
}

impl Batcher {
    pub fn new(outputs: &[OutputConfig]) -> Result<Self> {
        let mut batcher = Batcher::default();
        for output in outputs {
            let slot = batcher
                .routes
                .get_mut(output.receiver as usize)
                .with_context(|| format!("Receiver {} does not exist", output.receiver))?;
            let target: SocketAddr = output
                .target
                .parse()
                .with_context(|| format!("Invalid UDP target: {}", output.target))?;
            info!(
                "  - Receiver {} -> {} {:?}",
                output.receiver, target, output.description
            );
            *slot = Some(Route {
                target,
                pending: Vec::with_capacity(DATAGRAM_SIZE),
            });
        }
        Ok(batcher)
    }

    /// Queue a payload; returns a full datagram when one is ready.
    pub fn push(&mut self, receiver: u8, payload: &[u8]) -> Option<(SocketAddr, Vec<u8>)> {
        let route = self.routes.get_mut(receiver as usize)?.as_mut()?;
        route.pending.extend_from_slice(payload);
        if route.pending.len() < DATAGRAM_SIZE {
            return None;
        }
        let datagram = std::mem::replace(&mut route.pending, Vec::with_capacity(DATAGRAM_SIZE));
        Some((route.target, datagram))
    }

    pub fn routes(&self) -> usize {
        self.routes.iter().flatten().count()
    }
}

pub struct Outputs {
    socket: UdpSocket,
    batcher: Batcher,
    sent: u64,
}

impl Outputs {
    pub async fn bind(outputs: &[OutputConfig]) -> Result<Self> {
        let batcher = Batcher::new(outputs)?;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind UDP socket")?;
        info!("Forwarding {} receiver(s) over UDP", batcher.routes());
        Ok(Outputs {
            socket,
            batcher,
            sent: 0,
        })
    }

    pub async fn forward(&mut self, receiver: u8, payload: &[u8]) {
        if let Some((target, datagram)) = self.batcher.push(receiver, payload) {
            match self.socket.send_to(&datagram, target).await {
                Ok(_) => self.sent += 1,
                Err(e) => warn!("Failed to send to {}: {}", target, e),
            }
        }
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(receiver: u8, target: &str) -> OutputConfig {
        OutputConfig {
            receiver,
            target: target.to_string(),
            description: None,
        }
    }

    #[test]
    fn test_batches_seven_payloads() {
        let mut batcher = Batcher::new(&[output(1, "127.0.0.1:9001")]).unwrap();
        let payload = [0x47u8; PAYLOAD_SIZE];
        for _ in 0..PACKETS_PER_DATAGRAM - 1 {
            assert!(batcher.push(1, &payload).is_none());
        }
        let (target, datagram) = batcher.push(1, &payload).unwrap();
        assert_eq!(target, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(datagram.len(), DATAGRAM_SIZE);
        assert!(batcher.push(1, &payload).is_none());
    }

    #[test]
    fn test_unrouted_receiver_dropped() {
        let mut batcher = Batcher::new(&[output(0, "127.0.0.1:9000")]).unwrap();
        for _ in 0..PACKETS_PER_DATAGRAM {
            assert!(batcher.push(3, &[0u8; PAYLOAD_SIZE]).is_none());
        }
        assert!(batcher.push(9, &[0u8; PAYLOAD_SIZE]).is_none());
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(Batcher::new(&[output(4, "127.0.0.1:9000")]).is_err());
        assert!(Batcher::new(&[output(0, "not an address")]).is_err());
    }

    #[tokio::test]
    async fn test_datagram_arrives() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut outputs = Outputs::bind(&[output(2, &addr)]).await.unwrap();

        for i in 0..PACKETS_PER_DATAGRAM {
            outputs.forward(2, &[i as u8; PAYLOAD_SIZE]).await;
        }
        let mut buf = [0u8; 2048];
        let n = listener.recv(&mut buf).await.unwrap();
        assert_eq!(n, DATAGRAM_SIZE);
        assert_eq!(buf[PAYLOAD_SIZE], 1);
        assert_eq!(outputs.datagrams_sent(), 1);
    }
}
