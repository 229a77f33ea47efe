use super::{Inbound, InboundReceiver, Transport};
use crate::error::{Error, Result};
use crate::metrics::FRAMES_SENT;
use crate::protocol::{Message, MessageCodec};
use crate::retry::Backoff;
use futures::future::{BoxFuture, FutureExt};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{self, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

const CONNECT_BACKOFF_MS: u64 = 50;
const MAX_CONNECT_BACKOFF_MS: u64 = 2000;

type Connection = Framed<TcpStream, MessageCodec>;

struct Shared {
    rank: u32,
    addrs: Vec<SocketAddr>,
    codec: MessageCodec,
    /// One lazily established connection per peer. Calls to the same peer
    /// take turns on it.
    connections: Vec<sync::Mutex<Option<Connection>>>,
    accept: Mutex<Option<JoinHandle<()>>>,
    serving: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Transport over TCP between ranks listed in a static address table.
#[derive(Clone)]
pub struct TcpTransport {
    shared: Arc<Shared>,
}

impl TcpTransport {
    /// Listens on the address of `rank` and starts accepting peers.
    pub async fn bind(
        rank: u32,
        addrs: Vec<SocketAddr>,
        max_message_bytes: usize,
    ) -> Result<(TcpTransport, InboundReceiver)> {
        let addr = *addrs.get(rank as usize).ok_or_else(|| {
            Error::Config(format!("rank {} has no address in a group of {}", rank, addrs.len()))
        })?;

        let listener = TcpListener::bind(addr).await?;
        info!("Rank {} listening on {}", rank, addr);

        let codec = MessageCodec::new(max_message_bytes);
        let (inbound, rx) = mpsc::unbounded_channel();
        let serving = Arc::new(Mutex::new(Vec::new()));
        let accept = tokio::spawn(accept_loop(listener, codec, inbound, serving.clone()));

        let connections = addrs.iter().map(|_| sync::Mutex::new(None)).collect();
        let transport = TcpTransport {
            shared: Arc::new(Shared {
                rank,
                addrs,
                codec,
                connections,
                accept: Mutex::new(Some(accept)),
                serving,
            }),
        };
        Ok((transport, rx))
    }
}

async fn accept_loop(
    listener: TcpListener,
    codec: MessageCodec,
    inbound: mpsc::UnboundedSender<Inbound>,
    serving: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!("Accepted connection from {}", peer);
                if let Err(e) = socket.set_nodelay(true) {
                    warn!("Unable to set TCP nodelay: {:?}", e);
                }
                let task = tokio::spawn(serve(Framed::new(socket, codec), inbound.clone()));
                serving
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(task);
            }
            Err(e) => error!("Error accepting connection: {}", e),
        }
    }
}

/// Answers requests from one peer in the order they arrive.
async fn serve(mut conn: Connection, inbound: mpsc::UnboundedSender<Inbound>) {
    while let Some(frame) = conn.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                error!("Dropping connection after bad frame: {}", e);
                return;
            }
        };

        let (reply, rx) = oneshot::channel();
        if inbound.send(Inbound { message, reply }).is_err() {
            debug!("Store closed, dropping connection");
            return;
        }

        let response = match rx.await {
            Ok(response) => response,
            Err(_) => {
                warn!("Request dropped without a reply");
                return;
            }
        };

        FRAMES_SENT.inc();
        if let Err(e) = conn.send(response).await {
            error!("Error sending reply: {}", e);
            return;
        }
    }
    trace!("Peer closed connection");
}

async fn connect(addr: SocketAddr, codec: MessageCodec) -> Result<Connection> {
    let socket = Backoff::unlimited()
        .initial_delay(Duration::from_millis(CONNECT_BACKOFF_MS))
        .max_delay(Duration::from_millis(MAX_CONNECT_BACKOFF_MS))
        .retry(move || TcpStream::connect(addr))
        .await?;

    if let Err(e) = socket.set_nodelay(true) {
        warn!("Unable to set TCP nodelay: {:?}", e);
    }
    debug!("Connected to {}", addr);
    Ok(Framed::new(socket, codec))
}

async fn exchange(conn: &mut Connection, message: Message) -> Result<Message> {
    FRAMES_SENT.inc();
    conn.send(message).await?;
    conn.next().await.unwrap_or_else(|| {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed",
        )))
    })
}

async fn call(shared: Arc<Shared>, dest: u32, message: Message) -> Result<Message> {
    // size is checked before a connection is touched
    message.check_size(shared.codec.max_message_bytes())?;

    let slot = shared
        .connections
        .get(dest as usize)
        .ok_or_else(|| Error::Routing(format!("no rank {}", dest)))?;
    let mut guard = slot.lock().await;
    let mut conn = match guard.take() {
        Some(conn) => conn,
        None => connect(shared.addrs[dest as usize], shared.codec).await?,
    };

    // a failed exchange leaves the connection dropped, the next call reconnects
    match exchange(&mut conn, message).await {
        Ok(reply) => {
            *guard = Some(conn);
            Ok(reply)
        }
        Err(e) => {
            error!("Request to rank {} failed: {}", dest, e);
            Err(e)
        }
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> u32 {
        self.shared.rank
    }

    fn size(&self) -> u32 {
        self.shared.addrs.len() as u32
    }

    fn call(&self, dest: u32, message: Message) -> BoxFuture<'static, Result<Message>> {
        call(self.shared.clone(), dest, message).boxed()
    }

    fn shutdown(&self) -> BoxFuture<'static, ()> {
        let shared = self.shared.clone();
        async move {
            if let Some(accept) = shared
                .accept
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                accept.abort();
            }

            for slot in &shared.connections {
                slot.lock().await.take();
            }

            // peers hang up once they are done with this rank
            let tasks: Vec<_> = shared
                .serving
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            futures::future::join_all(tasks).await;
            info!("Rank {} transport closed", shared.rank);
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::protocol::Body;
    use bytes::Bytes;

    fn free_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn call_over_tcp() {
        let addrs = vec![free_addr(), free_addr()];
        let (client, _client_inbound) = TcpTransport::bind(0, addrs.clone(), 1 << 20)
            .await
            .unwrap();
        let (server, mut server_inbound) = TcpTransport::bind(1, addrs, 1 << 20).await.unwrap();

        tokio::spawn(async move {
            while let Some(req) = server_inbound.recv().await {
                let body = match req.message.body {
                    Body::Put { .. } => Body::Receipt {
                        error: ErrorCode::Success,
                    },
                    _ => Body::Receipt {
                        error: ErrorCode::Error,
                    },
                };
                req.reply.send(Message::new(1, 0, body)).unwrap();
            }
        });

        for _ in 0..3 {
            let reply = client
                .call(
                    1,
                    Message::new(
                        0,
                        0,
                        Body::Put {
                            key: Bytes::from_static(b"k"),
                            value: Bytes::from_static(b"v"),
                        },
                    ),
                )
                .await
                .unwrap();
            assert_eq!(
                Body::Receipt {
                    error: ErrorCode::Success
                },
                reply.body
            );
        }

        client.shutdown().await;
        drop(client);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_call_rejected() {
        let addrs = vec![free_addr(), free_addr()];
        let (client, _inbound) = TcpTransport::bind(0, addrs, 16).await.unwrap();
        let res = client
            .call(
                1,
                Message::new(
                    0,
                    0,
                    Body::Put {
                        key: Bytes::from_static(b"key"),
                        value: Bytes::from_static(b"value"),
                    },
                ),
            )
            .await;
        match res {
            Err(Error::MessageTooLarge { .. }) => {}
            res => panic!("unexpected result {:?}", res),
        }
    }
}
