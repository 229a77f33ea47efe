//! Point to point message delivery between ranks.
//!
//! A transport carries whole `Message`s as length prefixed frames and hands
//! inbound requests to the store through an `Inbound` channel. Every request
//! is answered by exactly one reply on the same connection.
use crate::error::Result;
use crate::protocol::Message;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

mod memory;
mod tcp;

pub use self::memory::{MemoryNetwork, MemoryTransport};
pub use self::tcp::TcpTransport;

/// A request received from a peer along with the channel for its reply.
pub struct Inbound {
    pub message: Message,
    pub reply: oneshot::Sender<Message>,
}

pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

pub trait Transport: Send + Sync {
    fn rank(&self) -> u32;

    /// Number of ranks in the group.
    fn size(&self) -> u32;

    /// Sends `message` to `dest` and waits for its reply.
    ///
    /// There is no timeout. A peer that never answers leaves the returned
    /// future pending.
    fn call(&self, dest: u32, message: Message) -> BoxFuture<'static, Result<Message>>;

    /// Closes outbound connections and waits for peers to hang up.
    fn shutdown(&self) -> BoxFuture<'static, ()>;
}
