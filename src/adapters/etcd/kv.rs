//! Conversions between etcd wire messages and store types.
//!
//! Requests are validated on the way in: unknown enum values, empty
//! request ops and compare operands that do not match their target are
//! rejected as invalid arguments before anything reaches the log.

use super::proto;
use crate::core::error::{TesseraError, TesseraResult};
use crate::kv::{
    Compare, CompareResult, CompareTarget, DeleteRangeRequest, DeleteRangeResponse, Event,
    EventKind, KeyValue, Permission, PermissionType, PutRequest, PutResponse, RangeRequest,
    RangeResponse, RequestOp, ResponseOp, SortOrder, SortTarget, TxnRequest, TxnResponse,
    WatchFilters, WatchRequest,
};
use crate::raft::MemberInfo;

// ============================================================================
// Requests
// ============================================================================

pub fn range_request(req: proto::RangeRequest) -> TesseraResult<RangeRequest> {
    let sort_order = match proto::SortOrder::try_from(req.sort_order) {
        Ok(proto::SortOrder::None) => SortOrder::None,
        Ok(proto::SortOrder::Ascend) => SortOrder::Ascend,
        Ok(proto::SortOrder::Descend) => SortOrder::Descend,
        Err(_) => return Err(invalid_enum("sort order", req.sort_order)),
    };
    let sort_target = match proto::SortTarget::try_from(req.sort_target) {
        Ok(proto::SortTarget::Key) => SortTarget::Key,
        Ok(proto::SortTarget::Version) => SortTarget::Version,
        Ok(proto::SortTarget::Create) => SortTarget::Create,
        Ok(proto::SortTarget::Mod) => SortTarget::Mod,
        Ok(proto::SortTarget::Value) => SortTarget::Value,
        Err(_) => return Err(invalid_enum("sort target", req.sort_target)),
    };
    Ok(RangeRequest {
        key: req.key,
        range_end: req.range_end,
        limit: req.limit,
        revision: req.revision,
        sort_order,
        sort_target,
        keys_only: req.keys_only,
        count_only: req.count_only,
        min_mod_revision: req.min_mod_revision,
        max_mod_revision: req.max_mod_revision,
        min_create_revision: req.min_create_revision,
        max_create_revision: req.max_create_revision,
    })
}

pub fn put_request(req: proto::PutRequest) -> PutRequest {
    PutRequest {
        key: req.key,
        value: req.value,
        lease: req.lease,
        prev_kv: req.prev_kv,
        ignore_value: req.ignore_value,
        ignore_lease: req.ignore_lease,
    }
}

pub fn delete_range_request(req: proto::DeleteRangeRequest) -> DeleteRangeRequest {
    DeleteRangeRequest {
        key: req.key,
        range_end: req.range_end,
        prev_kv: req.prev_kv,
    }
}

pub fn txn_request(req: proto::TxnRequest) -> TesseraResult<TxnRequest> {
    Ok(TxnRequest {
        compare: req
            .compare
            .into_iter()
            .map(compare)
            .collect::<TesseraResult<_>>()?,
        success: request_ops(req.success)?,
        failure: request_ops(req.failure)?,
    })
}

fn request_ops(ops: Vec<proto::RequestOp>) -> TesseraResult<Vec<RequestOp>> {
    ops.into_iter().map(request_op).collect()
}

fn request_op(op: proto::RequestOp) -> TesseraResult<RequestOp> {
    use proto::request_op::Request;
    match op.request {
        Some(Request::RequestRange(r)) => Ok(RequestOp::Range(range_request(r)?)),
        Some(Request::RequestPut(r)) => Ok(RequestOp::Put(put_request(r))),
        Some(Request::RequestDeleteRange(r)) => Ok(RequestOp::DeleteRange(delete_range_request(r))),
        Some(Request::RequestTxn(r)) => Ok(RequestOp::Txn(txn_request(r)?)),
        None => Err(TesseraError::invalid_argument("empty request op in txn")),
    }
}

fn compare(cmp: proto::Compare) -> TesseraResult<Compare> {
    use proto::compare::TargetUnion;
    let result = match proto::CompareResult::try_from(cmp.result) {
        Ok(proto::CompareResult::Equal) => CompareResult::Equal,
        Ok(proto::CompareResult::Greater) => CompareResult::Greater,
        Ok(proto::CompareResult::Less) => CompareResult::Less,
        Ok(proto::CompareResult::NotEqual) => CompareResult::NotEqual,
        Err(_) => return Err(invalid_enum("compare result", cmp.result)),
    };
    let wanted = proto::CompareTarget::try_from(cmp.target)
        .map_err(|_| invalid_enum("compare target", cmp.target))?;
    // An unset operand compares against the zero value of its target.
    let target = match (wanted, cmp.target_union) {
        (proto::CompareTarget::Version, Some(TargetUnion::Version(v))) => CompareTarget::Version(v),
        (proto::CompareTarget::Version, None) => CompareTarget::Version(0),
        (proto::CompareTarget::Create, Some(TargetUnion::CreateRevision(v))) => CompareTarget::Create(v),
        (proto::CompareTarget::Create, None) => CompareTarget::Create(0),
        (proto::CompareTarget::Mod, Some(TargetUnion::ModRevision(v))) => CompareTarget::Mod(v),
        (proto::CompareTarget::Mod, None) => CompareTarget::Mod(0),
        (proto::CompareTarget::Value, Some(TargetUnion::Value(v))) => CompareTarget::Value(v),
        (proto::CompareTarget::Value, None) => CompareTarget::Value(Vec::new()),
        (proto::CompareTarget::Lease, Some(TargetUnion::Lease(v))) => CompareTarget::Lease(v),
        (proto::CompareTarget::Lease, None) => CompareTarget::Lease(0),
        (target, Some(_)) => {
            return Err(TesseraError::invalid_argument(format!(
                "compare operand does not match target {:?}",
                target
            )))
        }
    };
    Ok(Compare {
        result,
        target,
        key: cmp.key,
        range_end: cmp.range_end,
    })
}

pub fn watch_request(req: proto::WatchCreateRequest) -> TesseraResult<WatchRequest> {
    let mut filters = WatchFilters::empty();
    for raw in req.filters {
        match proto::FilterType::try_from(raw) {
            Ok(proto::FilterType::Noput) => filters |= WatchFilters::NOPUT,
            Ok(proto::FilterType::Nodelete) => filters |= WatchFilters::NODELETE,
            Err(_) => return Err(invalid_enum("watch filter", raw)),
        }
    }
    Ok(WatchRequest {
        key: req.key,
        range_end: req.range_end,
        start_revision: req.start_revision,
        filters,
        prev_kv: req.prev_kv,
    })
}

pub fn permission(perm: proto::Permission) -> TesseraResult<Permission> {
    let perm_type = match proto::PermissionType::try_from(perm.perm_type) {
        Ok(proto::PermissionType::Read) => PermissionType::Read,
        Ok(proto::PermissionType::Write) => PermissionType::Write,
        Ok(proto::PermissionType::Readwrite) => PermissionType::ReadWrite,
        Err(_) => return Err(invalid_enum("permission type", perm.perm_type)),
    };
    Ok(Permission::new(perm_type, perm.key, perm.range_end))
}

fn invalid_enum(what: &str, value: i32) -> TesseraError {
    TesseraError::invalid_argument(format!("unknown {} {}", what, value))
}

// ============================================================================
// Responses
// ============================================================================

pub fn key_value(kv: KeyValue) -> proto::KeyValue {
    proto::KeyValue {
        key: kv.key,
        create_revision: kv.create_revision,
        mod_revision: kv.mod_revision,
        version: kv.version,
        value: kv.value,
        lease: kv.lease,
    }
}

pub fn event(event: Event) -> proto::Event {
    let kind = match event.kind {
        EventKind::Put => proto::EventType::Put,
        EventKind::Delete => proto::EventType::Delete,
    };
    proto::Event {
        r#type: kind as i32,
        kv: Some(key_value(event.kv)),
        prev_kv: event.prev_kv.map(key_value),
    }
}

pub fn range_response(header: proto::ResponseHeader, resp: RangeResponse) -> proto::RangeResponse {
    proto::RangeResponse {
        header: Some(header),
        kvs: resp.kvs.into_iter().map(key_value).collect(),
        more: resp.more,
        count: resp.count,
    }
}

pub fn put_response(header: proto::ResponseHeader, resp: PutResponse) -> proto::PutResponse {
    proto::PutResponse {
        header: Some(header),
        prev_kv: resp.prev_kv.map(key_value),
    }
}

pub fn delete_range_response(
    header: proto::ResponseHeader,
    resp: DeleteRangeResponse,
) -> proto::DeleteRangeResponse {
    proto::DeleteRangeResponse {
        header: Some(header),
        deleted: resp.deleted,
        prev_kvs: resp.prev_kvs.into_iter().map(key_value).collect(),
    }
}

/// Nested responses carry the same header as the enclosing txn.
pub fn txn_response(header: proto::ResponseHeader, resp: TxnResponse) -> proto::TxnResponse {
    use proto::response_op::Response;
    let responses = resp
        .responses
        .into_iter()
        .map(|op| proto::ResponseOp {
            response: Some(match op {
                ResponseOp::Range(r) => Response::ResponseRange(range_response(header.clone(), r)),
                ResponseOp::Put(r) => Response::ResponsePut(put_response(header.clone(), r)),
                ResponseOp::DeleteRange(r) => {
                    Response::ResponseDeleteRange(delete_range_response(header.clone(), r))
                }
                ResponseOp::Txn(r) => Response::ResponseTxn(txn_response(header.clone(), r)),
            }),
        })
        .collect();
    proto::TxnResponse {
        header: Some(header),
        succeeded: resp.succeeded,
        responses,
    }
}

pub fn permission_to_proto(perm: Permission) -> proto::Permission {
    let perm_type = match perm.perm_type {
        PermissionType::Read => proto::PermissionType::Read,
        PermissionType::Write => proto::PermissionType::Write,
        PermissionType::ReadWrite => proto::PermissionType::Readwrite,
    };
    proto::Permission {
        perm_type: perm_type as i32,
        key: perm.key,
        range_end: perm.range_end,
    }
}

pub fn member(info: MemberInfo) -> proto::Member {
    let client_urls = if info.client_addr.is_empty() {
        Vec::new()
    } else {
        vec![info.client_addr]
    };
    proto::Member {
        id: info.id,
        name: info.name,
        peer_urls: vec![info.peer_addr],
        client_urls,
        is_learner: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_without_operand_uses_zero_value() {
        let cmp = proto::Compare {
            target: proto::CompareTarget::Version as i32,
            key: b"k".to_vec(),
            ..Default::default()
        };
        let txn = txn_request(proto::TxnRequest {
            compare: vec![cmp],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(txn.compare[0].target, CompareTarget::Version(0));
        assert_eq!(txn.compare[0].result, CompareResult::Equal);
    }

    #[test]
    fn mismatched_compare_operand_is_rejected() {
        let cmp = proto::Compare {
            target: proto::CompareTarget::Mod as i32,
            target_union: Some(proto::compare::TargetUnion::Value(b"v".to_vec())),
            ..Default::default()
        };
        let err = txn_request(proto::TxnRequest {
            compare: vec![cmp],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, TesseraError::InvalidArgument { .. }));
    }

    #[test]
    fn empty_request_op_is_rejected() {
        let err = txn_request(proto::TxnRequest {
            success: vec![proto::RequestOp { request: None }],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, TesseraError::InvalidArgument { .. }));
    }

    #[test]
    fn unknown_sort_order_is_rejected() {
        let req = proto::RangeRequest {
            sort_order: 7,
            ..Default::default()
        };
        assert!(range_request(req).is_err());
    }

    #[test]
    fn watch_filters_map_to_flags() {
        let req = watch_request(proto::WatchCreateRequest {
            key: b"a".to_vec(),
            filters: vec![proto::FilterType::Nodelete as i32],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(req.filters, WatchFilters::NODELETE);
    }

    #[test]
    fn delete_events_carry_type_and_key() {
        let e = event(Event::delete(b"k".to_vec(), 9, None));
        assert_eq!(e.r#type, proto::EventType::Delete as i32);
        let kv = e.kv.unwrap();
        assert_eq!(kv.key, b"k".to_vec());
        assert_eq!(kv.mod_revision, 9);
    }

    #[test]
    fn nested_txn_responses_share_header() {
        let header = proto::ResponseHeader {
            revision: 4,
            ..Default::default()
        };
        let resp = txn_response(
            header.clone(),
            TxnResponse {
                succeeded: true,
                responses: vec![ResponseOp::Put(PutResponse::default())],
            },
        );
        match &resp.responses[0].response {
            Some(proto::response_op::Response::ResponsePut(put)) => {
                assert_eq!(put.header.as_ref(), Some(&header))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
