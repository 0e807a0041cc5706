//! Read-path query tasks
//!
//! Each query runs as its own task against an immutable index snapshot
//! taken by the skeleton when the request arrived, and sends the reply
//! itself. Request shape is validated up front by [`validate_get`] so a
//! malformed get never costs a snapshot.

use crate::index::{BlobValue, IndexSnapshot};
use crate::messages::{
    DbStatRequest, DbStatResult, ExtremeQuery, GetBarrierRequest, GetBarrierResult, GetRequest, GetResult,
    QueryResult, ReplyTo, Response, StatusInfo, StatusResult,
};
use std::sync::Arc;
use tracing::trace;
use vdisk_common::{Error, LogoBlobId, ReplyStatus, Result, VDiskConfig};

/// Reject malformed gets before any snapshot is taken
pub fn validate_get(req: &GetRequest, config: &VDiskConfig) -> Result<()> {
    match (req.extreme.is_empty(), &req.range) {
        (true, None) => return Err(Error::invalid_request("no queries")),
        (false, Some(_)) => return Err(Error::invalid_request("extreme and range queries are mutually exclusive")),
        _ => {}
    }
    if req.extreme.len() > config.max_get_queries {
        return Err(Error::invalid_request(format!(
            "too many queries: {} (limit {})",
            req.extreme.len(),
            config.max_get_queries
        )));
    }
    if req.acquire_blocked_generation && req.reader_tablet.is_none() {
        return Err(Error::invalid_request(
            "blocked generation requested without a reader tablet",
        ));
    }
    if let Some(range) = &req.range
        && range.from.tablet_id != range.to.tablet_id
    {
        return Err(Error::invalid_request("range query spans tablets"));
    }
    Ok(())
}

fn read_value(id: LogoBlobId, value: Option<BlobValue>, shift: u32, size: u32, index_only: bool) -> QueryResult {
    match value {
        None | Some(BlobValue::Metadata) => QueryResult::status_only(id, ReplyStatus::NoData),
        Some(BlobValue::Huge(placement)) => QueryResult {
            id,
            status: ReplyStatus::Ok,
            data: None,
            placement: Some(placement),
        },
        Some(BlobValue::Inline(_)) if index_only => QueryResult::status_only(id, ReplyStatus::Ok),
        Some(BlobValue::Inline(data)) => {
            let start = shift as usize;
            if start > data.len() {
                return QueryResult::status_only(id, ReplyStatus::Error);
            }
            let end = if size == 0 {
                data.len()
            } else {
                data.len().min(start + size as usize)
            };
            QueryResult {
                id,
                status: ReplyStatus::Ok,
                data: Some(data.slice(start..end)),
                placement: None,
            }
        }
    }
}

fn extreme(snapshot: &dyn IndexSnapshot, q: &ExtremeQuery, index_only: bool) -> QueryResult {
    read_value(q.id, snapshot.get(&q.id), q.shift, q.size, index_only)
}

pub async fn run_get(snapshot: Arc<dyn IndexSnapshot>, req: GetRequest, reply: ReplyTo) {
    let results: Vec<QueryResult> = match &req.range {
        Some(range) => {
            let max = range.max_results as usize;
            snapshot
                .range(&range.from, &range.to, max)
                .into_iter()
                .map(|(id, value)| read_value(id, Some(value), 0, 0, req.index_only))
                .collect()
        }
        None => req
            .extreme
            .iter()
            .map(|q| extreme(snapshot.as_ref(), q, req.index_only))
            .collect(),
    };
    let blocked_generation = if req.acquire_blocked_generation {
        req.reader_tablet.and_then(|tablet| snapshot.blocked_generation(tablet))
    } else {
        None
    };
    trace!(lsn = snapshot.lsn(), results = results.len(), "get done");
    reply.send(Response::Get(GetResult {
        status: ReplyStatus::Ok,
        reason: String::new(),
        results,
        blocked_generation,
    }));
}

pub async fn run_get_barrier(snapshot: Arc<dyn IndexSnapshot>, req: GetBarrierRequest, reply: ReplyTo) {
    let barriers = snapshot.barriers(&req.from, &req.to);
    reply.send(Response::GetBarrier(GetBarrierResult {
        status: ReplyStatus::Ok,
        reason: String::new(),
        barriers,
    }));
}

pub async fn run_db_stat(snapshot: Arc<dyn IndexSnapshot>, req: DbStatRequest, reply: ReplyTo) {
    reply.send(Response::DbStat(DbStatResult {
        status: ReplyStatus::Ok,
        reason: String::new(),
        db: req.db,
        records: snapshot.stat().get(req.db),
    }));
}

/// Complete `info` with snapshot counters and reply
pub async fn run_status(snapshot: Arc<dyn IndexSnapshot>, mut info: StatusInfo, reply: ReplyTo) {
    info.stat = snapshot.stat();
    reply.send(Response::Status(StatusResult {
        status: ReplyStatus::Ok,
        reason: String::new(),
        info: Some(info),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexStore, IndexUpdate};
    use crate::mem_index::MemIndexStore;
    use crate::messages::{Addr, RangeQuery};
    use bytes::Bytes;
    use vdisk_common::{DiskPart, LsnSeg, VDiskId};

    fn blob(step: u32) -> LogoBlobId {
        LogoBlobId::new(4, 1, step, 0, 6, 0).with_part(1)
    }

    fn snapshot() -> Arc<dyn IndexSnapshot> {
        let mut index = MemIndexStore::new();
        index.apply(
            IndexUpdate::LogoBlob {
                id: blob(1),
                data: Bytes::from_static(b"abcdef"),
            },
            LsnSeg::point(1),
        );
        index.apply(
            IndexUpdate::HugeBlob {
                id: blob(2),
                placement: DiskPart::new(3, 0, 6),
            },
            LsnSeg::point(2),
        );
        index.apply(
            IndexUpdate::Block {
                tablet_id: 4,
                generation: 0,
                issuer_guid: 0,
            },
            LsnSeg::point(3),
        );
        index.take_snapshot()
    }

    #[test]
    fn test_validate_get() {
        let config = VDiskConfig {
            max_get_queries: 2,
            ..VDiskConfig::default()
        };
        let query = |step| ExtremeQuery {
            id: blob(step),
            shift: 0,
            size: 0,
        };
        assert!(validate_get(&GetRequest::default(), &config).is_err());

        let ok = GetRequest {
            extreme: vec![query(1)],
            ..GetRequest::default()
        };
        assert!(validate_get(&ok, &config).is_ok());

        let too_many = GetRequest {
            extreme: vec![query(1), query(2), query(3)],
            ..GetRequest::default()
        };
        assert!(validate_get(&too_many, &config)
            .unwrap_err()
            .to_string()
            .contains("too many"));

        let both = GetRequest {
            extreme: vec![query(1)],
            range: Some(RangeQuery {
                from: blob(0),
                to: blob(9),
                max_results: 0,
            }),
            ..GetRequest::default()
        };
        assert!(validate_get(&both, &config).is_err());

        let no_reader = GetRequest {
            extreme: vec![query(1)],
            acquire_blocked_generation: true,
            ..GetRequest::default()
        };
        assert!(validate_get(&no_reader, &config).is_err());
    }

    #[tokio::test]
    async fn test_extreme_get() {
        let (addr, mut rx) = Addr::channel();
        let req = GetRequest {
            vdisk_id: VDiskId::default(),
            extreme: vec![
                ExtremeQuery {
                    id: blob(1),
                    shift: 2,
                    size: 3,
                },
                ExtremeQuery {
                    id: blob(2),
                    shift: 0,
                    size: 0,
                },
                ExtremeQuery {
                    id: blob(7),
                    shift: 0,
                    size: 0,
                },
            ],
            acquire_blocked_generation: true,
            reader_tablet: Some(4),
            ..GetRequest::default()
        };
        run_get(snapshot(), req, ReplyTo::new(addr, 1)).await;

        let Response::Get(result) = rx.recv().await.unwrap().response else {
            panic!("expected get result");
        };
        assert_eq!(result.blocked_generation, Some(0));
        assert_eq!(result.results[0].data.as_deref(), Some(&b"cde"[..]));
        assert_eq!(result.results[1].placement, Some(DiskPart::new(3, 0, 6)));
        assert_eq!(result.results[2].status, ReplyStatus::NoData);
    }

    #[tokio::test]
    async fn test_range_index_only() {
        let (addr, mut rx) = Addr::channel();
        let req = GetRequest {
            range: Some(RangeQuery {
                from: blob(0),
                to: blob(9),
                max_results: 1,
            }),
            index_only: true,
            ..GetRequest::default()
        };
        run_get(snapshot(), req, ReplyTo::new(addr, 1)).await;

        let Response::Get(result) = rx.recv().await.unwrap().response else {
            panic!("expected get result");
        };
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].id, blob(1));
        assert!(result.results[0].data.is_none());
    }
}
