//! Multi-put result collection
//!
//! Items of one multi-put finish independently: inline items when their log
//! entry is durable, huge items when the keeper's placement is logged,
//! postponed items when the sequence number they wait on commits. Each of
//! them reports to a collector task, which sends the single aggregate reply
//! once the last pending item is in.

use crate::messages::{MultiPutItemStatus, MultiPutResult, Reply, ReplyTo, Response};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{trace, warn};
use vdisk_common::ReplyStatus;

#[derive(Debug)]
pub struct MultiPutCollector {
    items: Vec<MultiPutItemStatus>,
    pending: usize,
    reply: ReplyTo,
}

impl MultiPutCollector {
    /// `items` holds the status known at admission (errors are final);
    /// `pending` counts items whose result is still to arrive
    #[must_use]
    pub const fn new(items: Vec<MultiPutItemStatus>, pending: usize, reply: ReplyTo) -> Self {
        Self { items, pending, reply }
    }

    #[must_use]
    pub const fn pending(&self) -> usize {
        self.pending
    }

    /// Record one item result; returns true once nothing is pending
    pub fn on_item(&mut self, response: &Response) -> bool {
        let Response::MultiPutItem(result) = response else {
            warn!(status = %response.status(), "multi-put collector got a foreign reply");
            return self.pending == 0;
        };
        match self.items.get_mut(result.idx) {
            Some(item) if self.pending > 0 => {
                item.status = result.status;
                self.pending -= 1;
            }
            _ => warn!(idx = result.idx, "multi-put item result out of range"),
        }
        self.pending == 0
    }

    /// Send the aggregate reply
    pub fn finish(self) {
        self.reply.send(Response::MultiPut(MultiPutResult {
            status: ReplyStatus::Ok,
            reason: String::new(),
            items: self.items,
        }));
    }

    /// Collect item results from `rx` until every item has reported. If all
    /// senders go away first (the unit is torn down) no reply is sent.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Reply>) {
        while self.pending > 0 {
            let Some(reply) = rx.recv().await else {
                trace!(pending = self.pending, "multi-put abandoned");
                return;
            };
            self.on_item(&reply.response);
        }
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Addr, MultiPutItemResult};
    use vdisk_common::LogoBlobId;

    fn ids() -> Vec<LogoBlobId> {
        (1..=3).map(|step| LogoBlobId::new(5, 1, step, 0, 8, 0).with_part(1)).collect()
    }

    fn item_reply(id: LogoBlobId, idx: usize, status: ReplyStatus) -> Reply {
        Reply {
            cookie: idx as u64,
            response: Response::MultiPutItem(MultiPutItemResult {
                id,
                idx,
                status,
                reason: String::new(),
            }),
        }
    }

    #[tokio::test]
    async fn test_collects_all_items() {
        let ids = ids();
        let statuses = vec![
            MultiPutItemStatus { id: ids[0], status: ReplyStatus::Ok },
            MultiPutItemStatus { id: ids[1], status: ReplyStatus::Error },
            MultiPutItemStatus { id: ids[2], status: ReplyStatus::Ok },
        ];
        let (client, mut client_rx) = Addr::channel();
        let collector = MultiPutCollector::new(statuses, 2, ReplyTo::new(client, 9));

        let (items, rx) = Addr::channel();
        let task = tokio::spawn(collector.run(rx));
        items.send(item_reply(ids[2], 2, ReplyStatus::Ok));
        items.send(item_reply(ids[0], 0, ReplyStatus::Blocked));
        task.await.unwrap();

        let reply = client_rx.recv().await.unwrap();
        assert_eq!(reply.cookie, 9);
        let Response::MultiPut(result) = reply.response else {
            panic!("expected multi-put result");
        };
        assert_eq!(result.status, ReplyStatus::Ok);
        let statuses: Vec<_> = result.items.iter().map(|i| i.status).collect();
        assert_eq!(statuses, vec![ReplyStatus::Blocked, ReplyStatus::Error, ReplyStatus::Ok]);
    }

    #[tokio::test]
    async fn test_abandoned_without_reply() {
        let ids = ids();
        let statuses = vec![MultiPutItemStatus { id: ids[0], status: ReplyStatus::Ok }];
        let (client, mut client_rx) = Addr::channel();
        let collector = MultiPutCollector::new(statuses, 1, ReplyTo::new(client, 1));

        let (items, rx) = Addr::<Reply>::channel();
        drop(items);
        collector.run(rx).await;
        assert!(client_rx.try_recv().is_err());
    }
}
