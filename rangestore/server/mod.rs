//! Range server: a FIFO work queue drained by a single worker thread that
//! owns the storage of one index.
use crate::config::Options;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::manifest::Manifest;
use crate::metrics::WORK_QUEUE_DEPTH;
use crate::protocol::Message;
use crate::stats::StatRow;
use crate::storage;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;

mod sync;
mod worker;

pub use self::sync::ReplyFuture;
pub(crate) use self::sync::{channel, ReplySender};
use self::worker::Worker;

/// Lifecycle of a range server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    /// Storage opened and statistics loaded.
    Open,
    Serving,
    /// No new work is accepted, queued work is being finished.
    Draining,
    Closed,
}

impl ServerState {
    fn from_u8(v: u8) -> ServerState {
        match v {
            1 => ServerState::Open,
            2 => ServerState::Serving,
            3 => ServerState::Draining,
            4 => ServerState::Closed,
            _ => ServerState::Uninitialized,
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub(crate) fn set(&self, state: ServerState) {
        trace!("Range server state {:?}", state);
        self.0.store(state as u8, Ordering::Release);
    }

    pub(crate) fn get(&self) -> ServerState {
        ServerState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Unit of work for the worker, processed in arrival order.
pub(crate) enum WorkItem {
    Request(Message, ReplySender<Message>),
    /// Copy of the worker's slice statistics, taken between requests.
    Snapshot(ReplySender<Vec<StatRow>>),
    Close(ReplySender<()>),
}

/// Handle to the range server of one index on this rank.
pub struct RangeServer {
    index: Arc<Index>,
    queue: mpsc::UnboundedSender<WorkItem>,
    state: SharedState,
    worker: Option<thread::JoinHandle<()>>,
}

impl RangeServer {
    /// Opens storage for `index`, reloads its statistics and starts the worker.
    pub fn open(index: Arc<Index>, rank: u32, options: &Options) -> Result<RangeServer> {
        let state = SharedState::default();
        let server_number = index.server_number();
        if server_number == 0 {
            return Err(Error::NotServing {
                rank,
                index: index.id(),
            });
        }

        let base = options.file(&format!("{}-{}", index.id(), rank));
        let (storage, stats_store) = storage::open(
            index.store_type(),
            &base,
            options.create_new,
            index.key_type(),
            options.max_message_bytes,
        )?;

        // server 1 of a shared index owns its manifest
        let manifest = if index.store_type().is_persistent()
            && index.kind().is_collective()
            && server_number == 1
        {
            let path = options.file(&format!("{}.manifest", index.id()));
            if let Some(stored) = Manifest::load(&path)? {
                stored.validate(&Manifest::of(&index))?;
            }
            Some(path)
        } else {
            None
        };

        let worker = Worker::new(
            index.clone(),
            rank,
            storage,
            stats_store,
            options.value_append,
            manifest,
            state.clone(),
        )?;
        state.set(ServerState::Open);
        info!(
            "Rank {} serving index {} as server {} of {}",
            rank,
            index.id(),
            server_number,
            index.topology().num_servers()
        );

        let (queue, rx) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name(format!("range-server-{}", index.id()))
            .spawn(move || worker.run(rx))?;
        state.set(ServerState::Serving);

        Ok(RangeServer {
            index,
            queue,
            state,
            worker: Some(worker),
        })
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    fn enqueue<T>(
        &self,
        make: impl FnOnce(ReplySender<T>) -> WorkItem,
    ) -> ReplyFuture<T> {
        let (tx, rx) = channel();
        match self.queue.send(make(tx)) {
            Ok(()) => WORK_QUEUE_DEPTH.inc(),
            Err(mpsc::error::SendError(item)) => {
                warn!("Work submitted to closed range server {}", self.index.id());
                item.fail(Error::Closed);
            }
        }
        rx
    }

    /// Queues a request behind all previously submitted work.
    pub fn submit(&self, message: Message) -> ReplyFuture<Message> {
        self.enqueue(|reply| WorkItem::Request(message, reply))
    }

    /// Queues a request whose requester waits on `reply`.
    pub(crate) fn forward(&self, message: Message, reply: ReplySender<Message>) {
        match self.queue.send(WorkItem::Request(message, reply)) {
            Ok(()) => WORK_QUEUE_DEPTH.inc(),
            Err(mpsc::error::SendError(item)) => item.fail(Error::Closed),
        }
    }

    /// Statistics of the slices this server owns.
    pub fn snapshot(&self) -> ReplyFuture<Vec<StatRow>> {
        self.enqueue(WorkItem::Snapshot)
    }

    /// Finishes queued work, persists statistics and closes storage.
    pub async fn close(mut self) -> Result<()> {
        let res = self.enqueue(WorkItem::Close).await;
        if let Some(worker) = self.worker.take() {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                _ => error!("Range server worker for index {} panicked", self.index.id()),
            }
        }
        res
    }
}

impl WorkItem {
    fn fail(self, e: Error) {
        match self {
            WorkItem::Request(_, reply) => reply.send_err(e),
            WorkItem::Snapshot(reply) => reply.send_err(e),
            WorkItem::Close(reply) => reply.send_err(e),
        }
    }
}
