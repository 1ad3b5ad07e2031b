//! Routes a [`Mutation`] to the one tree algorithm that applies it.

use tracing::trace;

use crate::primitives::cache::{Access, BlockCache, EvictionPriority, Transaction};
use crate::primitives::concurrency::{Admission, SequenceGroup};
use crate::storage::algorithms::BTreeAlgorithms;
use crate::storage::mutation::{CasTime, Mutation, MutationResult};
use crate::storage::superblock::GotSuperblock;
use crate::types::Result;

/// Applies `mutation` inside a transaction the caller already holds.
pub fn change_in_txn<A: BTreeAlgorithms + ?Sized>(
    algorithms: &A,
    mutation: &Mutation,
    castime: CasTime,
    txn: &mut Transaction<'_>,
    sb: &mut GotSuperblock,
) -> Result<MutationResult> {
    trace!(
        kind = mutation.kind(),
        key = %mutation.key(),
        cas = castime.proposed_cas,
        timestamp = %castime.timestamp,
        "dispatch.change"
    );
    Ok(match mutation {
        Mutation::GetCas(m) => {
            MutationResult::GetCas(algorithms.get_cas(&m.key, castime, txn, sb)?)
        }
        Mutation::Sarc(m) => MutationResult::Sarc(algorithms.set(m, castime, txn, sb)?),
        Mutation::IncrDecr(m) => MutationResult::IncrDecr(
            algorithms.incr_decr(&m.key, m.kind, m.amount, castime, txn, sb)?,
        ),
        Mutation::AppendPrepend(m) => MutationResult::AppendPrepend(
            algorithms.append_prepend(&m.key, m.kind, &m.data, castime, txn, sb)?,
        ),
        Mutation::Delete(m) => MutationResult::Delete(algorithms.delete(
            &m.key,
            m.dont_put_in_delete_queue,
            castime.timestamp,
            txn,
            sb,
        )?),
    })
}

/// Opens a write transaction on `seq_group`, then applies `mutation`.
///
/// The admission is released once the transaction holds its lane ticket, so
/// the superblock lock is taken in token order.
pub fn change_ordered<A: BTreeAlgorithms + ?Sized>(
    algorithms: &A,
    cache: &BlockCache,
    seq_group: &SequenceGroup,
    admission: Admission,
    mutation: &Mutation,
    castime: CasTime,
    root_eviction_priority: EvictionPriority,
) -> Result<MutationResult> {
    let mut txn = Transaction::begin(cache, seq_group, Access::Write, 1, castime.timestamp)?;
    txn.set_order_token(admission.release());
    let mut sb = GotSuperblock::acquire(&mut txn, Access::Write, root_eviction_priority)?;
    change_in_txn(algorithms, mutation, castime, &mut txn, &mut sb)
}
