//! Work item phase graph.
//!
//! A lifecycle is a set of directed edges (`LifeCyclePhase`) between named
//! statuses. A transition is legal only when an edge exists whose id matches
//! the requested transition and whose source matches the item's current
//! status. `None` as a source means "not started yet".

use crate::error::{EngineError, Result};
use crate::handler::WorkItemHandler;
use crate::manager::WorkItemManager;
use crate::types::now;
use crate::work_item::{
    Termination, TransitionOutcome, WorkItem, WorkItemPhaseState, WorkItemTransition,
};

// ─── Well-known phase ids and statuses ────────────────────────

pub const ACTIVATE: &str = "activate";
pub const COMPLETE: &str = "complete";
pub const ABORT: &str = "abort";
pub const CLAIM: &str = "claim";
pub const RELEASE: &str = "release";
pub const SKIP: &str = "skip";

pub const ACTIVE: &str = "Active";
pub const READY: &str = "Ready";
pub const RESERVED: &str = "Reserved";
pub const COMPLETED: &str = "Completed";
pub const ABORTED: &str = "Aborted";
pub const SKIPPED: &str = "Skipped";

// ─── Phase ────────────────────────────────────────────────────

/// One directed edge of the phase graph.
#[derive(Debug, Clone, PartialEq)]
pub struct LifeCyclePhase {
    pub id: String,
    pub source_status: Option<String>,
    pub target: WorkItemPhaseState,
    pub starting: bool,
}

impl LifeCyclePhase {
    pub fn new(id: impl Into<String>, source_status: Option<&str>, target: WorkItemPhaseState) -> Self {
        Self {
            id: id.into(),
            source_status: source_status.map(String::from),
            target,
            starting: false,
        }
    }

    pub fn starting(mut self) -> Self {
        self.starting = true;
        self
    }

    pub fn applies_to(&self, status: Option<&str>) -> bool {
        self.source_status.as_deref() == status
    }

    /// Hand the transition to the handler. The item passed in is a staged
    /// copy; the caller commits it only when the outcome is `Applied`.
    pub async fn execute(
        &self,
        manager: &WorkItemManager,
        handler: &dyn WorkItemHandler,
        work_item: &mut WorkItem,
        transition: &WorkItemTransition,
    ) -> anyhow::Result<TransitionOutcome> {
        handler
            .transition_to_phase(manager, work_item, transition)
            .await
    }
}

// ─── Lifecycle ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemLifeCycle {
    phases: Vec<LifeCyclePhase>,
}

impl WorkItemLifeCycle {
    pub fn new(phases: Vec<LifeCyclePhase>) -> Self {
        Self { phases }
    }

    /// activate → Active, then complete or abort.
    pub fn default_lifecycle() -> Self {
        Self::new(vec![
            LifeCyclePhase::new(ACTIVATE, None, WorkItemPhaseState::of(ACTIVE)).starting(),
            LifeCyclePhase::new(
                COMPLETE,
                Some(ACTIVE),
                WorkItemPhaseState::terminating(COMPLETED, Termination::Complete),
            ),
            LifeCyclePhase::new(
                ABORT,
                Some(ACTIVE),
                WorkItemPhaseState::terminating(ABORTED, Termination::Abort),
            ),
        ])
    }

    /// Human task graph: Ready ⇄ Reserved via claim/release; complete, skip
    /// and abort are allowed from either.
    pub fn human_task() -> Self {
        let mut phases = vec![
            LifeCyclePhase::new(ACTIVATE, None, WorkItemPhaseState::of(READY)).starting(),
            LifeCyclePhase::new(CLAIM, Some(READY), WorkItemPhaseState::of(RESERVED)),
            LifeCyclePhase::new(RELEASE, Some(RESERVED), WorkItemPhaseState::of(READY)),
        ];
        for source in [READY, RESERVED] {
            phases.push(LifeCyclePhase::new(
                COMPLETE,
                Some(source),
                WorkItemPhaseState::terminating(COMPLETED, Termination::Complete),
            ));
            phases.push(LifeCyclePhase::new(
                SKIP,
                Some(source),
                WorkItemPhaseState::terminating(SKIPPED, Termination::Abort),
            ));
            phases.push(LifeCyclePhase::new(
                ABORT,
                Some(source),
                WorkItemPhaseState::terminating(ABORTED, Termination::Abort),
            ));
        }
        Self::new(phases)
    }

    pub fn phases(&self) -> &[LifeCyclePhase] {
        &self.phases
    }

    pub fn phase_by_id(&self, id: &str, source_status: Option<&str>) -> Option<&LifeCyclePhase> {
        self.phases
            .iter()
            .find(|p| p.id == id && p.applies_to(source_status))
    }

    pub fn phases_by_status<'a>(
        &'a self,
        source_status: Option<&'a str>,
    ) -> impl Iterator<Item = &'a LifeCyclePhase> + 'a {
        self.phases.iter().filter(move |p| p.applies_to(source_status))
    }

    pub fn starting_phase(&self) -> Option<&LifeCyclePhase> {
        self.phases.iter().find(|p| p.starting)
    }

    /// Execute one transition against `work_item`.
    ///
    /// When the handler applies a transition naming a different phase id,
    /// that follow-up is executed from the new status, up to `max_hops`
    /// times. The returned outcome is the one of the last executed hop.
    ///
    /// An error in any hop leaves the item as it was before the call. A
    /// `Deferred` or `Rejected` hop keeps the hops applied before it.
    pub async fn transition_to(
        &self,
        manager: &WorkItemManager,
        handler: &dyn WorkItemHandler,
        work_item: &mut WorkItem,
        transition: WorkItemTransition,
        max_hops: usize,
    ) -> Result<TransitionOutcome> {
        let mut current = work_item.clone();
        let outcome = self
            .run_hops(manager, handler, &mut current, transition, max_hops)
            .await?;
        *work_item = current;
        Ok(outcome)
    }

    async fn run_hops(
        &self,
        manager: &WorkItemManager,
        handler: &dyn WorkItemHandler,
        work_item: &mut WorkItem,
        transition: WorkItemTransition,
        max_hops: usize,
    ) -> Result<TransitionOutcome> {
        let mut requested = transition;
        let mut hops = 0;

        loop {
            let status = work_item.phase_status.clone();
            let phase = self
                .phase_by_id(&requested.id, status.as_deref())
                .ok_or_else(|| EngineError::InvalidTransition {
                    work_item_id: work_item.id.clone(),
                    transition: requested.id.clone(),
                    status: status.clone().unwrap_or_else(|| "<not started>".to_string()),
                })?;

            for policy in &requested.policies {
                policy
                    .enforce(work_item)
                    .map_err(|reason| EngineError::PolicyViolation {
                        work_item_id: work_item.id.clone(),
                        policy: policy.name().to_string(),
                        reason,
                    })?;
            }

            let mut staged = work_item.clone();
            let outcome = phase
                .execute(manager, handler, &mut staged, &requested)
                .await
                .map_err(EngineError::Internal)?;

            let applied = match outcome {
                TransitionOutcome::Applied(applied) => applied,
                other => {
                    tracing::debug!(
                        work_item_id = %work_item.id,
                        transition = %requested.id,
                        outcome = ?other,
                        "Transition not applied"
                    );
                    return Ok(other);
                }
            };

            commit_phase(&mut staged, phase, &applied);
            *work_item = staged;

            tracing::debug!(
                work_item_id = %work_item.id,
                phase = %phase.id,
                status = %phase.target.name,
                "Work item transitioned"
            );

            if applied.id == phase.id || work_item.is_terminal() {
                return Ok(TransitionOutcome::Applied(applied));
            }
            if hops >= max_hops {
                tracing::warn!(
                    work_item_id = %work_item.id,
                    follow_up = %applied.id,
                    "Follow-up transition limit reached"
                );
                return Ok(TransitionOutcome::Applied(applied));
            }
            hops += 1;
            requested = applied;
        }
    }
}

fn commit_phase(item: &mut WorkItem, phase: &LifeCyclePhase, applied: &WorkItemTransition) {
    item.phase_id = Some(phase.id.clone());
    item.phase_status = Some(phase.target.name.clone());
    item.termination = phase.target.termination;
    item.results
        .extend(applied.data.iter().map(|(k, v)| (k.clone(), v.clone())));
    if phase.starting && item.start_date.is_none() {
        item.start_date = Some(now());
    }
    if item.termination.is_some() {
        item.complete_date = Some(now());
    }
}
