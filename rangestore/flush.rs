//! Collective distribution of slice statistics.
//!
//! Every range server of an index reports its rows to the coordinator, the
//! rank holding server 1. Once all reports are in, the coordinator merges them
//! and broadcasts the table to every rank, which installs it into its copy of
//! the index.
use crate::error::{Error, ErrorCode, Result};
use crate::index::{Index, IndexKind};
use crate::metrics::FLUSH_TIME_HISTOGRAM;
use crate::protocol::{Body, Message};
use crate::stats::StatRow;
use crate::store::Node;
use fnv::FnvHashMap;
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;

#[derive(Default)]
struct Slot {
    /// Reports received by the coordinator, in arrival order.
    gathered: VecDeque<(u32, Vec<StatRow>)>,
    broadcasts: VecDeque<Vec<StatRow>>,
    verdicts: VecDeque<ErrorCode>,
}

/// Collective messages received from peers and not yet consumed: statistics
/// of a flush and the manifest verdict of a new index.
#[derive(Default)]
pub(crate) struct Mailbox {
    slots: Mutex<FnvHashMap<u32, Slot>>,
    notify: Notify,
}

impl Mailbox {
    pub(crate) fn gather(&self, index: u32, source: u32, rows: Vec<StatRow>) {
        trace!(
            "Gathered {} stat rows of index {} from rank {}",
            rows.len(),
            index,
            source
        );
        self.update(index, |slot| slot.gathered.push_back((source, rows)));
    }

    pub(crate) fn broadcast(&self, index: u32, rows: Vec<StatRow>) {
        self.update(index, |slot| slot.broadcasts.push_back(rows));
    }

    pub(crate) fn verdict(&self, index: u32, error: ErrorCode) {
        self.update(index, |slot| slot.verdicts.push_back(error));
    }

    fn update(&self, index: u32, f: impl FnOnce(&mut Slot)) {
        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            f(slots.entry(index).or_default());
        }
        self.notify.notify_waiters();
    }

    /// Waits until `reports` server reports arrived for `index` and takes them.
    async fn take_gathered(&self, index: u32, reports: usize) -> Vec<(u32, Vec<StatRow>)> {
        loop {
            // registered before checking so a report arriving in between
            // still wakes us
            let notified = self.notify.notified();
            {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                let slot = slots.entry(index).or_default();
                if slot.gathered.len() >= reports {
                    return slot.gathered.drain(..reports).collect();
                }
            }
            notified.await;
        }
    }

    async fn take_broadcast(&self, index: u32) -> Vec<StatRow> {
        loop {
            let notified = self.notify.notified();
            {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(rows) = slots.entry(index).or_default().broadcasts.pop_front() {
                    return rows;
                }
            }
            notified.await;
        }
    }

    /// Waits for the manifest verdict on `index`.
    pub(crate) async fn take_verdict(&self, index: u32) -> ErrorCode {
        loop {
            let notified = self.notify.notified();
            {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(error) = slots.entry(index).or_default().verdicts.pop_front() {
                    return error;
                }
            }
            notified.await;
        }
    }
}

fn expect_success(dest: u32, res: Result<Message>) -> Result<()> {
    match res?.body {
        Body::Receipt { error } if error.is_success() => Ok(()),
        Body::Receipt { error } => Err(Error::Protocol(format!(
            "rank {} refused statistics with {:?}",
            dest, error
        ))),
        body => Err(Error::Protocol(format!(
            "rank {} answered statistics with {}",
            dest,
            body.name()
        ))),
    }
}

/// Distributes the statistics of `index` to every rank. Every rank of the
/// group has to call this for the same index.
pub(crate) async fn stat_flush(node: &Node, index: &Index) -> Result<()> {
    let start = Instant::now();
    let id = index.id();

    if index.kind() == IndexKind::Local {
        let rows = node.snapshot(id)?.await?;
        index.install_stats(rows);
        FLUSH_TIME_HISTOGRAM.observe(start.elapsed().as_nanos() as f64);
        return Ok(());
    }

    let coordinator = index
        .topology()
        .coordinator()
        .ok_or_else(|| Error::Routing(format!("index {} has no range servers", id)))?;

    if index.is_server() {
        let rows = node.snapshot(id)?.await?;
        debug!(
            "Rank {} reporting {} stat rows of index {}",
            node.rank(),
            rows.len(),
            id
        );
        let report = Message::new(node.rank(), id, Body::StatGather { rows });
        expect_success(coordinator, node.call(coordinator, report).await)?;
    }

    if node.rank() == coordinator {
        let reports = index.topology().num_servers() as usize;
        let mut rows: Vec<StatRow> = node
            .mailbox()
            .take_gathered(id, reports)
            .await
            .into_iter()
            .flat_map(|(_, rows)| rows)
            .collect();
        rows.sort_by_key(|row| (row.slice, row.rank));
        debug!("Broadcasting {} stat rows of index {}", rows.len(), id);

        let sends = (0..node.size()).map(|dest| {
            let message = Message::new(node.rank(), id, Body::StatBroadcast { rows: rows.clone() });
            let call = node.call(dest, message);
            async move { (dest, call.await) }
        });
        for (dest, res) in join_all(sends).await {
            if let Err(e) = expect_success(dest, res) {
                error!("Unable to broadcast statistics to rank {}: {}", dest, e);
                return Err(e);
            }
        }
    }

    let rows = node.mailbox().take_broadcast(id).await;
    trace!(
        "Rank {} installing {} stat rows of index {}",
        node.rank(),
        rows.len(),
        id
    );
    index.install_stats(rows);
    FLUSH_TIME_HISTOGRAM.observe(start.elapsed().as_nanos() as f64);
    Ok(())
}

/// Receipt for a statistics message delivered to the mailbox.
pub(crate) fn delivered(rank: u32, index: u32) -> Message {
    Message::new(
        rank,
        index,
        Body::Receipt {
            error: ErrorCode::Success,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Stat, StatValue};
    use std::sync::Arc;

    fn row(slice: u64, rank: u32) -> StatRow {
        StatRow {
            slice,
            rank,
            stat: Stat {
                min: StatValue::Int(slice),
                max: StatValue::Int(slice),
                num: 1,
            },
        }
    }

    #[tokio::test]
    async fn gathered_reports_wait_for_all_servers() {
        let mailbox = Arc::new(Mailbox::default());
        let waiter = mailbox.clone();
        let gathered = tokio::spawn(async move { waiter.take_gathered(3, 2).await });

        mailbox.gather(3, 1, vec![row(1, 1)]);
        tokio::task::yield_now().await;
        assert!(!gathered.is_finished());

        mailbox.gather(3, 2, vec![row(2, 2)]);
        let reports = gathered.await.unwrap();
        assert_eq!(vec![1, 2], reports.iter().map(|r| r.0).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn broadcasts_are_per_index() {
        let mailbox = Mailbox::default();
        mailbox.broadcast(1, vec![row(1, 1)]);
        mailbox.broadcast(0, vec![row(5, 2)]);
        assert_eq!(vec![row(5, 2)], mailbox.take_broadcast(0).await);
        assert_eq!(vec![row(1, 1)], mailbox.take_broadcast(1).await);
    }

    #[tokio::test]
    async fn verdict_wakes_waiter() {
        let mailbox = Arc::new(Mailbox::default());
        let waiter = mailbox.clone();
        let verdict = tokio::spawn(async move { waiter.take_verdict(0).await });
        tokio::task::yield_now().await;
        assert!(!verdict.is_finished());

        mailbox.verdict(1, ErrorCode::Success);
        mailbox.verdict(0, ErrorCode::DbError);
        assert_eq!(ErrorCode::DbError, verdict.await.unwrap());
        assert_eq!(ErrorCode::Success, mailbox.take_verdict(1).await);
    }
}
