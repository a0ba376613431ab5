//! Key-value mutations and multi-op transactions.
//!
//! A [`Writer`] stages every change of one log entry at a single revision.
//! Transactions are fully planned before anything is staged: compares are
//! evaluated against the state before the transaction (nested ones
//! included), the chosen branch is validated, and only then executed, so a
//! rejected transaction leaves no partial writes behind.

use super::lease::LeaseTable;
use super::mvcc::{in_range, KvStore};
use super::request::{
    Compare, CompareResult, CompareTarget, DeleteRangeRequest, DeleteRangeResponse, KeyValue,
    PutRequest, PutResponse, RangeRequest, RangeResponse, RequestOp, ResponseOp, TxnRequest,
    TxnResponse,
};
use crate::core::error::{TesseraError, TesseraResult};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Upper bound on operations in one transaction, nested ones included.
pub const MAX_TXN_OPS: usize = 128;

/// Whether `cmp` holds against the current state of `kv`.
///
/// A missing key compares as a zero-valued key, except for value compares,
/// which always fail. Range compares must hold for every key in the range.
pub fn evaluate(kv: &KvStore, cmp: &Compare) -> bool {
    let matched = kv.live_in_range(&cmp.key, &cmp.range_end);
    if matched.is_empty() {
        if matches!(cmp.target, CompareTarget::Value(_)) {
            return false;
        }
        return compare_one(&KeyValue::default(), cmp);
    }
    matched.into_iter().all(|item| compare_one(item, cmp))
}

fn compare_one(kv: &KeyValue, cmp: &Compare) -> bool {
    let ord = match &cmp.target {
        CompareTarget::Version(v) => kv.version.cmp(v),
        CompareTarget::Create(v) => kv.create_revision.cmp(v),
        CompareTarget::Mod(v) => kv.mod_revision.cmp(v),
        CompareTarget::Value(v) => kv.value.as_slice().cmp(v.as_slice()),
        CompareTarget::Lease(v) => kv.lease.cmp(v),
    };
    match cmp.result {
        CompareResult::Equal => ord == Ordering::Equal,
        CompareResult::NotEqual => ord != Ordering::Equal,
        CompareResult::Greater => ord == Ordering::Greater,
        CompareResult::Less => ord == Ordering::Less,
    }
}

/// Bound compares and both branches of `txn`, at every nesting level,
/// whichever branch the compares would pick.
fn check_txn_size(txn: &TxnRequest) -> TesseraResult<()> {
    if txn.compare.len() > MAX_TXN_OPS
        || txn.success.len() > MAX_TXN_OPS
        || txn.failure.len() > MAX_TXN_OPS
    {
        return Err(too_many_ops());
    }
    for op in txn.success.iter().chain(txn.failure.iter()) {
        if let RequestOp::Txn(nested) = op {
            check_txn_size(nested)?;
        }
    }
    Ok(())
}

fn too_many_ops() -> TesseraError {
    TesseraError::invalid_argument("too many operations in txn request")
}

/// Stages writes for one entry at `revision`.
pub struct Writer<'a> {
    kv: &'a mut KvStore,
    leases: &'a mut LeaseTable,
    revision: i64,
}

impl<'a> Writer<'a> {
    pub fn new(kv: &'a mut KvStore, leases: &'a mut LeaseTable) -> Self {
        let revision = kv.next_revision();
        Self {
            kv,
            leases,
            revision,
        }
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn put(&mut self, req: &PutRequest) -> TesseraResult<PutResponse> {
        self.check_put(req)?;
        self.exec_put(req)
    }

    pub fn delete_range(&mut self, req: &DeleteRangeRequest) -> TesseraResult<DeleteRangeResponse> {
        check_key(&req.key)?;
        Ok(self.exec_delete(req))
    }

    pub fn txn(&mut self, txn: &TxnRequest) -> TesseraResult<TxnResponse> {
        check_txn_size(txn)?;
        let mut decisions = Vec::new();
        plan(self.kv, txn, &mut decisions);

        let mut chosen = Vec::new();
        collect(txn, &mut decisions.iter().copied(), &mut chosen);
        if chosen.len() > MAX_TXN_OPS {
            return Err(too_many_ops());
        }
        self.check_ops(&chosen)?;

        self.exec_txn(txn, &mut decisions.into_iter())
    }

    fn check_put(&self, req: &PutRequest) -> TesseraResult<()> {
        check_key(&req.key)?;
        if (req.ignore_value || req.ignore_lease) && self.kv.latest(&req.key).is_none() {
            return Err(TesseraError::invalid_argument("key not found"));
        }
        if req.ignore_value && !req.value.is_empty() {
            return Err(TesseraError::invalid_argument(
                "value is provided with ignore_value",
            ));
        }
        if req.ignore_lease && req.lease != 0 {
            return Err(TesseraError::invalid_argument(
                "lease is provided with ignore_lease",
            ));
        }
        if !req.ignore_lease && req.lease != 0 && !self.leases.contains(req.lease) {
            return Err(TesseraError::LeaseNotFound {
                lease_id: req.lease,
            });
        }
        Ok(())
    }

    fn check_ops(&self, ops: &[&RequestOp]) -> TesseraResult<()> {
        let mut put_keys: BTreeSet<&[u8]> = BTreeSet::new();
        let mut deleted: Vec<(&[u8], &[u8])> = Vec::new();
        for op in ops {
            match op {
                RequestOp::Range(r) => {
                    if r.revision > 0 {
                        self.kv.check_revision(r.revision)?;
                    }
                }
                RequestOp::Put(p) => {
                    self.check_put(p)?;
                    if !put_keys.insert(p.key.as_slice()) {
                        return Err(duplicate_key());
                    }
                }
                RequestOp::DeleteRange(d) => {
                    check_key(&d.key)?;
                    deleted.push((d.key.as_slice(), d.range_end.as_slice()));
                }
                RequestOp::Txn(_) => {}
            }
        }
        for key in &put_keys {
            if deleted.iter().any(|(start, end)| in_range(key, start, end)) {
                return Err(duplicate_key());
            }
        }
        Ok(())
    }

    fn exec_txn(
        &mut self,
        txn: &TxnRequest,
        decisions: &mut impl Iterator<Item = bool>,
    ) -> TesseraResult<TxnResponse> {
        let succeeded = decisions.next().unwrap_or(false);
        let branch = if succeeded { &txn.success } else { &txn.failure };
        let mut responses = Vec::with_capacity(branch.len());
        for op in branch {
            let response = match op {
                RequestOp::Range(r) => ResponseOp::Range(self.kv.range(r)?),
                RequestOp::Put(p) => ResponseOp::Put(self.exec_put(p)?),
                RequestOp::DeleteRange(d) => ResponseOp::DeleteRange(self.exec_delete(d)),
                RequestOp::Txn(t) => ResponseOp::Txn(self.exec_txn(t, decisions)?),
            };
            responses.push(response);
        }
        Ok(TxnResponse {
            succeeded,
            responses,
        })
    }

    fn exec_put(&mut self, req: &PutRequest) -> TesseraResult<PutResponse> {
        let prev = self.kv.latest(&req.key).cloned();
        let (value, lease) = match &prev {
            Some(p) => (
                if req.ignore_value {
                    p.value.clone()
                } else {
                    req.value.clone()
                },
                if req.ignore_lease { p.lease } else { req.lease },
            ),
            None => (req.value.clone(), req.lease),
        };
        if let Some(p) = &prev {
            if p.lease != 0 && p.lease != lease {
                self.leases.detach(p.lease, &req.key);
            }
        }
        if lease != 0 {
            self.leases.attach(lease, &req.key)?;
        }
        self.kv.put(self.revision, &req.key, value, lease);
        Ok(PutResponse {
            prev_kv: if req.prev_kv { prev } else { None },
        })
    }

    fn exec_delete(&mut self, req: &DeleteRangeRequest) -> DeleteRangeResponse {
        let deleted = self
            .kv
            .delete_range(self.revision, &req.key, &req.range_end);
        for kv in &deleted {
            if kv.lease != 0 {
                self.leases.detach(kv.lease, &kv.key);
            }
        }
        DeleteRangeResponse {
            deleted: deleted.len() as i64,
            prev_kvs: if req.prev_kv { deleted } else { Vec::new() },
        }
    }

    /// Delete every key attached to a revoked lease.
    pub fn delete_keys(&mut self, keys: &BTreeSet<Vec<u8>>) -> usize {
        keys.iter()
            .filter(|key| self.kv.delete(self.revision, key).is_some())
            .count()
    }

    /// Read inside the entry, seeing writes staged so far.
    pub fn range(&self, req: &RangeRequest) -> TesseraResult<RangeResponse> {
        self.kv.range(req)
    }
}

fn check_key(key: &[u8]) -> TesseraResult<()> {
    if key.is_empty() {
        Err(TesseraError::invalid_argument("key is not provided"))
    } else {
        Ok(())
    }
}

fn duplicate_key() -> TesseraError {
    TesseraError::invalid_argument("duplicate key given in txn request")
}

/// Record the branch decision of `txn` and of every nested transaction on
/// the chosen path, in execution order.
fn plan(kv: &KvStore, txn: &TxnRequest, out: &mut Vec<bool>) {
    let succeeded = txn.compare.iter().all(|c| evaluate(kv, c));
    out.push(succeeded);
    let branch = if succeeded { &txn.success } else { &txn.failure };
    for op in branch {
        if let RequestOp::Txn(nested) = op {
            plan(kv, nested, out);
        }
    }
}

/// Flatten the operations on the chosen path.
fn collect<'t>(
    txn: &'t TxnRequest,
    decisions: &mut impl Iterator<Item = bool>,
    out: &mut Vec<&'t RequestOp>,
) {
    let succeeded = decisions.next().unwrap_or(false);
    let branch = if succeeded { &txn.success } else { &txn.failure };
    for op in branch {
        match op {
            RequestOp::Txn(nested) => collect(nested, decisions, out),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::Tick;

    fn store() -> (KvStore, LeaseTable) {
        let mut kv = KvStore::new();
        let mut leases = LeaseTable::new();
        let mut w = Writer::new(&mut kv, &mut leases);
        w.put(&PutRequest::new("a", "1")).unwrap();
        let rev = w.revision();
        kv.finish(rev);
        (kv, leases)
    }

    #[test]
    fn compare_on_missing_key() {
        let (kv, _) = store();
        let c = Compare::new("nope", CompareResult::Equal, CompareTarget::Version(0));
        assert!(evaluate(&kv, &c));
        let c = Compare::new("nope", CompareResult::Equal, CompareTarget::Value(vec![]));
        assert!(!evaluate(&kv, &c));
        let c = Compare::new("a", CompareResult::Greater, CompareTarget::Mod(0));
        assert!(evaluate(&kv, &c));
    }

    #[test]
    fn txn_picks_branch_and_shares_revision() {
        let (mut kv, mut leases) = store();
        let txn = TxnRequest {
            compare: vec![Compare::new(
                "a",
                CompareResult::Equal,
                CompareTarget::Value(b"1".to_vec()),
            )],
            success: vec![
                RequestOp::Put(PutRequest::new("b", "2")),
                RequestOp::Put(PutRequest::new("c", "3")),
                RequestOp::Range(RangeRequest::range("a", vec![0])),
            ],
            failure: vec![],
        };
        let mut w = Writer::new(&mut kv, &mut leases);
        let rev = w.revision();
        let resp = w.txn(&txn).unwrap();
        assert!(resp.succeeded);
        match &resp.responses[2] {
            ResponseOp::Range(r) => assert_eq!(r.count, 3),
            other => panic!("unexpected {:?}", other),
        }
        let events = kv.finish(rev);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.revision() == 2));
    }

    #[test]
    fn nested_compares_see_pre_txn_state() {
        let (mut kv, mut leases) = store();
        let inner = TxnRequest {
            compare: vec![Compare::new(
                "b",
                CompareResult::Equal,
                CompareTarget::Version(0),
            )],
            success: vec![RequestOp::Put(PutRequest::new("c", "inner"))],
            failure: vec![],
        };
        let outer = TxnRequest {
            compare: vec![],
            success: vec![
                RequestOp::Put(PutRequest::new("b", "x")),
                RequestOp::Txn(inner),
            ],
            failure: vec![],
        };
        let mut w = Writer::new(&mut kv, &mut leases);
        let rev = w.revision();
        let resp = w.txn(&outer).unwrap();
        match &resp.responses[1] {
            ResponseOp::Txn(t) => assert!(t.succeeded),
            other => panic!("unexpected {:?}", other),
        }
        kv.finish(rev);
        assert_eq!(kv.get(b"c", 0).unwrap().unwrap().value, b"inner");
    }

    #[test]
    fn invalid_txn_stages_nothing() {
        let (mut kv, mut leases) = store();
        let txn = TxnRequest {
            compare: vec![],
            success: vec![
                RequestOp::Put(PutRequest::new("x", "1")),
                RequestOp::DeleteRange(DeleteRangeRequest::new("w", "y")),
            ],
            failure: vec![],
        };
        let mut w = Writer::new(&mut kv, &mut leases);
        let rev = w.revision();
        assert!(w.txn(&txn).is_err());
        let missing_lease = TxnRequest {
            compare: vec![],
            success: vec![RequestOp::Put(PutRequest::new("x", "1").with_lease(42))],
            failure: vec![],
        };
        assert!(matches!(
            w.txn(&missing_lease),
            Err(TesseraError::LeaseNotFound { lease_id: 42 })
        ));
        assert!(kv.finish(rev).is_empty());
        assert_eq!(kv.current_revision(), 1);
    }

    #[test]
    fn oversized_failure_branch_is_rejected_when_compares_pass() {
        let (mut kv, mut leases) = store();
        let failure = (0..=MAX_TXN_OPS)
            .map(|i| RequestOp::Put(PutRequest::new(format!("f{}", i), "v")))
            .collect();
        let txn = TxnRequest {
            compare: vec![Compare::new(
                "a",
                CompareResult::Equal,
                CompareTarget::Value(b"1".to_vec()),
            )],
            success: vec![RequestOp::Put(PutRequest::new("b", "2"))],
            failure,
        };
        let mut w = Writer::new(&mut kv, &mut leases);
        let rev = w.revision();
        assert!(matches!(
            w.txn(&txn),
            Err(TesseraError::InvalidArgument { .. })
        ));
        assert!(kv.finish(rev).is_empty());
    }

    #[test]
    fn puts_move_keys_between_leases() {
        let (mut kv, mut leases) = store();
        leases.grant(1, 10, Tick::zero()).unwrap();
        leases.grant(2, 10, Tick::zero()).unwrap();

        let mut w = Writer::new(&mut kv, &mut leases);
        w.put(&PutRequest::new("k", "v").with_lease(1)).unwrap();
        let rev = w.revision();
        kv.finish(rev);

        let mut w = Writer::new(&mut kv, &mut leases);
        let mut keep_value = PutRequest::new("k", "").with_lease(2);
        keep_value.ignore_value = true;
        w.put(&keep_value).unwrap();
        let rev = w.revision();
        kv.finish(rev);

        assert!(leases.get(1).unwrap().keys.is_empty());
        assert!(leases.get(2).unwrap().keys.contains(b"k".as_slice()));
        let stored = kv.get(b"k", 0).unwrap().unwrap();
        assert_eq!((stored.value.as_slice(), stored.lease), (b"v".as_slice(), 2));
    }

    #[test]
    fn ignore_value_requires_existing_key() {
        let (mut kv, mut leases) = store();
        let mut req = PutRequest::new("missing", "");
        req.ignore_value = true;
        let mut w = Writer::new(&mut kv, &mut leases);
        assert!(matches!(
            w.put(&req),
            Err(TesseraError::InvalidArgument { .. })
        ));
    }
}
