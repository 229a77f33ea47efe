//! A rank of the process group: its indexes, the range servers it runs and
//! the listener answering its peers.
use crate::config::Options;
use crate::error::{Error, ErrorCode, Result};
use crate::flush::{self, Mailbox};
use crate::index::{Index, IndexKind};
use crate::key::KeyType;
use crate::partitioner::Topology;
use crate::protocol::{Body, Message};
use crate::router::Router;
use crate::server::{channel, RangeServer, ReplyFuture, ReplySender, ServerState};
use crate::stats::StatRow;
use crate::transport::{Inbound, InboundReceiver, Transport};
use fnv::FnvHashMap;
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Rank collecting `Close` messages before the group shuts down.
const CLOSE_ROOT: u32 = 0;

struct Registry {
    indexes: FnvHashMap<u32, Arc<Index>>,
    servers: FnvHashMap<u32, RangeServer>,
    /// Requests for indexes this rank has not created yet.
    pending: FnvHashMap<u32, Vec<(Message, ReplySender<Message>)>>,
    next_collective: u32,
    next_local: u32,
    closed: bool,
}

/// Releases every rank once all of them asked to close.
struct CloseBarrier {
    size: u32,
    waiting: Mutex<Vec<oneshot::Sender<()>>>,
}

impl CloseBarrier {
    fn arrive(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        waiting.push(tx);
        if waiting.len() as u32 >= self.size {
            debug!("All {} ranks closing", self.size);
            for tx in waiting.drain(..) {
                let _ = tx.send(());
            }
        }
        rx
    }
}

/// Answer to `request` when it cannot be served.
fn failure(rank: u32, index: u32, request: &Body, error: ErrorCode) -> Message {
    let body = match request {
        Body::Get { .. } => Body::GetReceipt {
            error,
            key: None,
            value: None,
        },
        Body::BulkGet { .. } => Body::BulkGetReceipt {
            error,
            records: Vec::new(),
        },
        _ => Body::Receipt { error },
    };
    Message::new(rank, index, body)
}

pub(crate) struct Node {
    rank: u32,
    size: u32,
    options: Options,
    transport: Arc<dyn Transport>,
    registry: Mutex<Registry>,
    mailbox: Mailbox,
    barrier: CloseBarrier,
}

impl Node {
    fn new(options: Options, transport: Arc<dyn Transport>) -> Node {
        let size = transport.size();
        Node {
            rank: transport.rank(),
            size,
            options,
            transport,
            registry: Mutex::new(Registry {
                indexes: FnvHashMap::default(),
                servers: FnvHashMap::default(),
                pending: FnvHashMap::default(),
                next_collective: 0,
                next_local: u32::MAX,
                closed: false,
            }),
            mailbox: Mailbox::default(),
            barrier: CloseBarrier {
                size,
                waiting: Mutex::new(Vec::new()),
            },
        }
    }

    pub(crate) fn rank(&self) -> u32 {
        self.rank
    }

    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn index(&self, id: u32) -> Result<Arc<Index>> {
        self.registry()
            .indexes
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownIndex(id))
    }

    pub(crate) fn snapshot(&self, id: u32) -> Result<ReplyFuture<Vec<StatRow>>> {
        let registry = self.registry();
        match registry.servers.get(&id) {
            Some(server) => Ok(server.snapshot()),
            None => Err(Error::NotServing {
                rank: self.rank,
                index: id,
            }),
        }
    }

    fn server_state(&self, id: u32) -> Option<ServerState> {
        self.registry().servers.get(&id).map(|s| s.state())
    }

    /// Sends `message` to `dest`. Messages to this rank skip the transport
    /// and are never serialized.
    pub(crate) fn call(&self, dest: u32, message: Message) -> BoxFuture<'static, Result<Message>> {
        if dest == self.rank {
            self.dispatch(message).map(Ok).boxed()
        } else {
            self.transport.call(dest, message)
        }
    }

    /// Hands an inbound message to its consumer. Work for a range server is
    /// queued before this returns, so requests from one peer keep their order.
    fn dispatch(&self, message: Message) -> BoxFuture<'static, Message> {
        let (rank, index) = (self.rank, message.index);
        match message.body {
            Body::StatGather { rows } => {
                self.mailbox.gather(index, message.source, rows);
                future::ready(flush::delivered(rank, index)).boxed()
            }
            Body::StatBroadcast { rows } => {
                self.mailbox.broadcast(index, rows);
                future::ready(flush::delivered(rank, index)).boxed()
            }
            Body::ManifestVerdict { error } => {
                self.mailbox.verdict(index, error);
                future::ready(flush::delivered(rank, index)).boxed()
            }
            Body::Close if rank == CLOSE_ROOT => {
                let released = self.barrier.arrive();
                async move {
                    let error = match released.await {
                        Ok(()) => ErrorCode::Success,
                        Err(_) => ErrorCode::Error,
                    };
                    Message::new(rank, index, Body::Receipt { error })
                }
                .boxed()
            }
            _ => self.submit(message),
        }
    }

    fn submit(&self, message: Message) -> BoxFuture<'static, Message> {
        let (rank, index) = (self.rank, message.index);
        let fallback = failure(rank, index, &message.body, ErrorCode::Error);

        let mut registry = self.registry();
        let reply = if let Some(server) = registry.servers.get(&index) {
            server.submit(message)
        } else if registry.indexes.contains_key(&index) || registry.closed {
            warn!(
                "Rank {} received {} for index {} it does not serve",
                rank,
                message.body.name(),
                index
            );
            return future::ready(fallback).boxed();
        } else {
            trace!("Holding {} until index {} exists", message.body.name(), index);
            let (tx, rx) = channel();
            registry
                .pending
                .entry(index)
                .or_default()
                .push((message, tx));
            rx
        };
        drop(registry);

        async move {
            match reply.await {
                Ok(response) => response,
                Err(e) => {
                    error!("Request for index {} failed: {}", index, e);
                    fallback
                }
            }
        }
        .boxed()
    }

    /// Creates the next index of `kind`. Collective indexes must be created
    /// in the same order on every rank.
    pub(crate) async fn create_index(
        &self,
        kind: IndexKind,
        key_type: KeyType,
    ) -> Result<Arc<Index>> {
        let index = self.new_index(kind, key_type)?;
        let served = self.serve(&index);
        if kind.is_collective() && index.store_type().is_persistent() {
            self.agree_on_manifest(&index, &served).await?;
        }
        served?;
        info!(
            "Rank {} created {} index {} with {} servers",
            self.rank,
            kind.name(),
            index.id(),
            index.topology().num_servers()
        );
        Ok(index)
    }

    /// Assigns the id and topology of a new index.
    fn new_index(&self, kind: IndexKind, key_type: KeyType) -> Result<Arc<Index>> {
        let options = &self.options;
        let mut registry = self.registry();
        if registry.closed {
            return Err(Error::Closed);
        }

        let (id, topology) = match kind {
            IndexKind::Local => {
                let id = registry.next_local;
                (
                    id,
                    Topology::single(self.rank, self.size, options.max_recs_per_slice),
                )
            }
            IndexKind::SecondaryLocal { primary } => {
                let topology = registry
                    .indexes
                    .get(&primary)
                    .ok_or(Error::UnknownIndex(primary))?
                    .topology()
                    .clone();
                (registry.next_collective, topology)
            }
            IndexKind::Primary | IndexKind::SecondaryGlobal { .. } => (
                registry.next_collective,
                Topology::new(
                    self.size,
                    options.server_factor,
                    options.max_recs_per_slice,
                    options.max_servers,
                ),
            ),
        };
        if let IndexKind::SecondaryGlobal { primary } = kind {
            if !registry.indexes.contains_key(&primary) {
                return Err(Error::UnknownIndex(primary));
            }
        }

        if kind.is_collective() {
            registry.next_collective += 1;
        } else {
            registry.next_local -= 1;
        }
        Ok(Arc::new(Index::new(
            id,
            kind,
            key_type,
            options.store_type,
            topology,
            self.rank,
        )))
    }

    /// Opens the range server of `index` if this rank serves it, registers
    /// the index and hands it the requests that arrived early.
    fn serve(&self, index: &Arc<Index>) -> Result<()> {
        let id = index.id();
        let opened = if index.is_server() {
            RangeServer::open(index.clone(), self.rank, &self.options).map(Some)
        } else {
            Ok(None)
        };

        let mut registry = self.registry();
        let pending = registry.pending.remove(&id).unwrap_or_default();
        registry.indexes.insert(id, index.clone());
        match opened {
            Ok(Some(server)) if !registry.closed => {
                for (message, reply) in pending {
                    server.forward(message, reply);
                }
                registry.servers.insert(id, server);
                Ok(())
            }
            Ok(Some(_)) => Err(Error::Closed),
            Ok(None) => {
                for (message, reply) in pending {
                    warn!("Rank {} does not serve index {}", self.rank, id);
                    reply.send(failure(self.rank, id, &message.body, ErrorCode::Error));
                }
                Ok(())
            }
            Err(e) => {
                for (message, reply) in pending {
                    reply.send(failure(self.rank, id, &message.body, ErrorCode::DbError));
                }
                Err(e)
            }
        }
    }

    /// Server 1 checks the stored manifest of a persistent index. Its verdict
    /// is sent to every rank so a mismatch fails the whole group.
    async fn agree_on_manifest(&self, index: &Index, served: &Result<()>) -> Result<()> {
        let id = index.id();
        let coordinator = match index.topology().coordinator() {
            Some(coordinator) => coordinator,
            None => return Ok(()),
        };

        if self.rank != coordinator {
            return match self.mailbox.take_verdict(id).await {
                ErrorCode::Success => Ok(()),
                ErrorCode::DbError => Err(Error::Manifest(format!(
                    "rank {} rejected the stored layout of index {}",
                    coordinator, id
                ))),
                error => Err(Error::Storage(format!(
                    "rank {} failed to open index {} with {:?}",
                    coordinator, id, error
                ))),
            };
        }

        let error = match served {
            Ok(()) => ErrorCode::Success,
            Err(Error::Manifest(_)) => ErrorCode::DbError,
            Err(_) => ErrorCode::Error,
        };
        debug!("Sending manifest verdict {:?} for index {}", error, id);
        let sends = (0..self.size).filter(|dest| *dest != self.rank).map(|dest| {
            let message = Message::new(self.rank, id, Body::ManifestVerdict { error });
            self.transport.call(dest, message)
        });
        for res in future::join_all(sends).await {
            if let Err(e) = res {
                error!("Unable to send manifest verdict of index {}: {}", id, e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stops accepting work and hands back the range servers in index order.
    fn take_servers(&self) -> Vec<RangeServer> {
        let mut registry = self.registry();
        registry.closed = true;
        for (id, pending) in registry.pending.drain() {
            for (message, reply) in pending {
                reply.send(failure(self.rank, id, &message.body, ErrorCode::Error));
            }
        }
        let mut servers: Vec<RangeServer> = registry.servers.drain().map(|(_, s)| s).collect();
        servers.sort_by_key(|s| s.index().id());
        servers
    }
}

async fn listen(node: Arc<Node>, mut inbound: InboundReceiver) {
    while let Some(Inbound { message, reply }) = inbound.recv().await {
        let response = node.dispatch(message);
        tokio::spawn(async move {
            if reply.send(response.await).is_err() {
                trace!("Peer went away before the reply");
            }
        });
    }
    debug!("Rank {} listener stopped", node.rank());
}

/// Handle to the store on this rank.
///
/// Calls block until every destination answers. There is no timeout, a peer
/// that never answers stalls the caller.
pub struct Store {
    node: Arc<Node>,
    primary: Arc<Index>,
    listener: JoinHandle<()>,
}

impl Store {
    /// Joins the group through `transport`, serving requests arriving on
    /// `inbound`, and creates the primary index.
    pub async fn open(
        options: Options,
        transport: Arc<dyn Transport>,
        inbound: InboundReceiver,
    ) -> Result<Store> {
        options.validate()?;
        if transport.rank() >= transport.size() {
            return Err(Error::Config(format!(
                "rank {} outside of a group of {}",
                transport.rank(),
                transport.size()
            )));
        }

        let node = Arc::new(Node::new(options, transport));
        let listener = tokio::spawn(listen(node.clone(), inbound));
        match node
            .create_index(IndexKind::Primary, node.options.key_type)
            .await
        {
            Ok(primary) => Ok(Store {
                node,
                primary,
                listener,
            }),
            Err(e) => {
                error!("Unable to open rank {}: {}", node.rank, e);
                for server in node.take_servers() {
                    let id = server.index().id();
                    if let Err(e) = server.close().await {
                        warn!("Rank {} unable to close index {}: {}", node.rank, id, e);
                    }
                }
                node.transport.shutdown().await;
                listener.abort();
                Err(e)
            }
        }
    }

    pub fn rank(&self) -> u32 {
        self.node.rank
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> u32 {
        self.node.size
    }

    pub fn options(&self) -> &Options {
        &self.node.options
    }

    pub fn primary(&self) -> &Arc<Index> {
        &self.primary
    }

    pub fn index(&self, id: u32) -> Result<Arc<Index>> {
        self.node.index(id)
    }

    /// Creates a secondary or local index. Secondary indexes are collective
    /// and every rank must create them in the same order. For persistent
    /// secondary indexes this waits for the manifest verdict of server 1.
    pub async fn create_index(&self, kind: IndexKind, key_type: KeyType) -> Result<Arc<Index>> {
        self.node.create_index(kind, key_type).await
    }

    /// State of the range server of index `id` on this rank.
    pub fn server_state(&self, id: u32) -> Option<ServerState> {
        self.node.server_state(id)
    }

    pub fn router(&self) -> Router {
        Router::new(self.node.clone())
    }

    /// Refreshes the statistics of `index` on every rank. Collective.
    pub async fn stat_flush(&self, index: &Index) -> Result<()> {
        flush::stat_flush(&self.node, index).await
    }

    /// Waits for every rank to close, then persists and closes the range
    /// servers of this rank. Collective.
    pub async fn close(self) -> Result<()> {
        let node = self.node;
        let barrier = Message::new(node.rank, 0, Body::Close);
        match node.call(CLOSE_ROOT, barrier).await?.body {
            Body::Receipt { error } if error.is_success() => {}
            body => {
                return Err(Error::Protocol(format!(
                    "close barrier answered with {:?}",
                    body
                )))
            }
        }

        let mut res = Ok(());
        for server in node.take_servers() {
            let id = server.index().id();
            if let Err(e) = server.close().await {
                error!("Unable to close index {}: {}", id, e);
                if res.is_ok() {
                    res = Err(e);
                }
            }
        }

        node.transport.shutdown().await;
        self.listener.abort();
        info!("Rank {} closed", node.rank);
        res
    }
}
