use super::{Inbound, InboundReceiver, Transport};
use crate::error::{Error, Result};
use crate::metrics::FRAMES_SENT;
use crate::protocol::{Message, MessageCodec};
use bytes::BytesMut;
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, Encoder};

/// Ranks of a group living in one process.
///
/// Every request and reply is still encoded and decoded, so the memory
/// network exercises the same framing as TCP.
pub struct MemoryNetwork {
    peers: Mutex<Vec<Option<mpsc::UnboundedSender<Inbound>>>>,
    codec: MessageCodec,
    requests: AtomicUsize,
    frames: AtomicUsize,
}

impl MemoryNetwork {
    /// Creates a network of `size` ranks, returning the transport and inbound
    /// channel of each rank in rank order.
    pub fn new(
        size: u32,
        max_message_bytes: usize,
    ) -> (Arc<MemoryNetwork>, Vec<(Arc<dyn Transport>, InboundReceiver)>) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel()).unzip();
        let network = Arc::new(MemoryNetwork {
            peers: Mutex::new(senders.into_iter().map(Some).collect()),
            codec: MessageCodec::new(max_message_bytes),
            requests: AtomicUsize::new(0),
            frames: AtomicUsize::new(0),
        });

        let ranks = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| {
                let transport: Arc<dyn Transport> = Arc::new(MemoryTransport {
                    rank: rank as u32,
                    size,
                    network: network.clone(),
                });
                (transport, rx)
            })
            .collect();
        (network, ranks)
    }

    /// Requests sent between ranks.
    pub fn requests_sent(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Frames sent between ranks, requests and replies.
    pub fn frames_sent(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    fn peer(&self, dest: u32) -> Result<mpsc::UnboundedSender<Inbound>> {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        match peers.get(dest as usize) {
            Some(Some(peer)) => Ok(peer.clone()),
            Some(None) => Err(Error::Closed),
            None => Err(Error::Routing(format!("no rank {}", dest))),
        }
    }

    /// Passes a message through the codec as if it crossed the wire.
    fn transmit(&self, message: Message) -> Result<Message> {
        let mut codec = self.codec;
        let mut buf = BytesMut::new();
        codec.encode(message, &mut buf)?;
        self.frames.fetch_add(1, Ordering::SeqCst);
        FRAMES_SENT.inc();
        codec
            .decode(&mut buf)?
            .ok_or_else(|| Error::Protocol("incomplete frame".to_string()))
    }
}

pub struct MemoryTransport {
    rank: u32,
    size: u32,
    network: Arc<MemoryNetwork>,
}

async fn call(network: Arc<MemoryNetwork>, dest: u32, message: Message) -> Result<Message> {
    let peer = network.peer(dest)?;
    let message = network.transmit(message)?;
    network.requests.fetch_add(1, Ordering::SeqCst);

    let (reply, rx) = oneshot::channel();
    peer.send(Inbound { message, reply })
        .map_err(|_| Error::Closed)?;
    let response = rx.await.map_err(|_| Error::Closed)?;
    network.transmit(response)
}

impl Transport for MemoryTransport {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn call(&self, dest: u32, message: Message) -> BoxFuture<'static, Result<Message>> {
        call(self.network.clone(), dest, message).boxed()
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        let mut peers = self
            .network
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(peer) = peers.get_mut(self.rank as usize) {
            peer.take();
        }
        futures::future::ready(()).boxed()
    }
}
