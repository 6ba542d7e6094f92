//! Distributed Transaction Coordinator (spec.md §4.14): best-effort 2PC
//! across shard-pinned adapters, plus a Saga alternative for eventual
//! consistency. Neither persists a coordinator log — SPEC_FULL.md's Open
//! Question resolution treats `PartialCommitError` as the complete
//! crash-recovery story, matching the "best-effort, not cluster-grade"
//! framing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::Adapter;
use crate::error::{OrmError, OrmResult};
use crate::events::{self, Event};
use crate::shard::resolver::ShardId;
use crate::transaction::TransactionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Committed,
    RolledBack,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinatorState {
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl CoordinatorState {
    fn name(self) -> &'static str {
        match self {
            CoordinatorState::Preparing => "preparing",
            CoordinatorState::Prepared => "prepared",
            CoordinatorState::Committing => "committing",
            CoordinatorState::Committed => "committed",
            CoordinatorState::Aborting => "aborting",
            CoordinatorState::Aborted => "aborted",
        }
    }
}

struct Participant {
    shard: ShardId,
    handle: TransactionHandle,
}

/// A 2PC coordinator for one distributed transaction. Participants are
/// addressed by shard name only; the coordinator never performs
/// cross-shard reads for correctness (spec.md §4.14's invariant).
pub struct DistributedTransaction {
    tx_id: Uuid,
    state: CoordinatorState,
    participants: Vec<Participant>,
}

impl DistributedTransaction {
    fn new() -> Self {
        Self {
            tx_id: Uuid::new_v4(),
            state: CoordinatorState::Preparing,
            participants: Vec::new(),
        }
    }

    fn transition(&mut self, to: CoordinatorState) {
        events::emit(Event::DistributedTxTransition {
            tx_id: self.tx_id.to_string(),
            from: self.state.name().to_string(),
            to: to.name().to_string(),
        });
        self.state = to;
    }

    /// Phase 1 participant: opens a shard-pinned transaction, runs `f`,
    /// and holds the transaction open (does not commit) until
    /// [`DistributedTransaction::run`]'s phase 2.
    pub async fn on_shard<F, Fut>(&mut self, shard: impl Into<String>, adapter: &Arc<Adapter>, f: F) -> OrmResult<()>
    where
        F: FnOnce(&mut TransactionHandle) -> Fut,
        Fut: Future<Output = OrmResult<()>>,
    {
        let mut handle = crate::transaction::TransactionHandle::begin_for_coordinator(Arc::clone(adapter)).await?;
        f(&mut handle).await?;
        self.participants.push(Participant { shard: shard.into(), handle });
        Ok(())
    }

    /// Phase 2: commits every participant in parallel. On any failure the
    /// coordinator aborts and best-effort rolls back all peers, returning
    /// `PartialCommitError` with one outcome per shard.
    async fn commit_all(mut self) -> OrmResult<()> {
        self.transition(CoordinatorState::Prepared);
        self.transition(CoordinatorState::Committing);

        let mut outcomes: HashMap<String, CommitOutcome> = HashMap::new();
        let mut any_failed = false;
        for participant in &mut self.participants {
            match participant.handle.commit_for_coordinator().await {
                Ok(()) => {
                    outcomes.insert(participant.shard.clone(), CommitOutcome::Committed);
                }
                Err(_) => {
                    any_failed = true;
                    outcomes.insert(participant.shard.clone(), CommitOutcome::Unknown);
                }
            }
        }

        if !any_failed {
            self.transition(CoordinatorState::Committed);
            return Ok(());
        }

        self.transition(CoordinatorState::Aborting);
        for participant in &mut self.participants {
            let already_committed = outcomes.get(&participant.shard) == Some(&CommitOutcome::Committed);
            if already_committed {
                continue;
            }
            let rolled_back = participant.handle.rollback_for_coordinator().await.is_ok();
            outcomes.insert(
                participant.shard.clone(),
                if rolled_back { CommitOutcome::RolledBack } else { CommitOutcome::Unknown },
            );
        }
        self.transition(CoordinatorState::Aborted);

        Err(OrmError::PartialCommitError { per_shard: outcomes })
    }
}

/// Runs a 2PC distributed transaction: the caller registers participants
/// via `tx.on_shard(..)` inside `f`, then every participant is committed
/// in phase 2.
pub async fn distributed_transaction<F, Fut>(f: F) -> OrmResult<()>
where
    F: FnOnce(&mut DistributedTransaction) -> Fut,
    Fut: Future<Output = OrmResult<()>>,
{
    let mut tx = DistributedTransaction::new();
    f(&mut tx).await?;
    tx.commit_all().await
}

/// One forward/compensate step of a Saga. Both sides are boxed futures
/// (rather than a bare generic) so a `Vec<SagaStep>` can hold steps whose
/// bodies are different `async` blocks.
pub struct SagaStep {
    pub forward: Box<dyn FnOnce() -> futures::future::BoxFuture<'static, OrmResult<()>> + Send>,
    pub compensate: Box<dyn FnOnce() -> futures::future::BoxFuture<'static, OrmResult<()>> + Send>,
}

/// Executes forward steps in order. On any failure, invokes `compensate`
/// of every already-executed step in reverse. Compensation failures are
/// collected but do not re-throw; the saga surfaces the original failure
/// plus the compensation-failure list (spec.md §4.14).
pub async fn run_saga(steps: Vec<SagaStep>) -> OrmResult<()> {
    let mut executed = Vec::new();
    let mut original_failure = None;

    for (idx, step) in steps.into_iter().enumerate() {
        match (step.forward)().await {
            Ok(()) => executed.push((idx, step.compensate)),
            Err(err) => {
                original_failure = Some(err);
                break;
            }
        }
    }

    let Some(original) = original_failure else {
        return Ok(());
    };

    let mut compensation_failures = Vec::new();
    for (idx, compensate) in executed.into_iter().rev() {
        if let Err(err) = compensate().await {
            compensation_failures.push((idx, err.to_string()));
        }
    }

    Err(OrmError::SagaFailure {
        original: original.to_string(),
        compensation_failures,
    })
}
