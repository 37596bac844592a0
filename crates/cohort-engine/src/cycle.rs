//! # Cycle Manager
//!
//! State machine for the weekly window: `open -> closed -> compiled`.
//! At most one cycle is `open`; a cycle left `closed` by a failed close is
//! finished by [`CycleManager::manual_compile`] (or the scheduler's resume
//! trigger) and blocks new opens until then.

use std::collections::HashSet;

use cohort_core::error::{AppError, Result, StoreError};
use cohort_core::models::{Cycle, CycleStatus, Member, Submission, SubmissionFields};
use cohort_core::traits::{CycleRepo, MemberRepo, SubmissionRepo};
use cohort_core::{CycleId, CycleSchedule};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::notify::deliver;
use crate::streak::{StreakResult, StreakTracker};
use crate::Ports;

/// A freshly opened window plus the members to notify.
#[derive(Debug, Clone, Serialize)]
pub struct OpenedCycle {
    pub cycle: Cycle,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompiledCycle {
    pub cycle: Cycle,
    pub submissions: usize,
    pub streaks: Vec<StreakResult>,
    /// Members whose streak had already been evaluated for this cycle by an
    /// earlier, interrupted compile.
    pub already_evaluated: usize,
}

#[derive(Clone)]
pub struct CycleManager {
    ports: Ports,
    schedule: CycleSchedule,
    streaks: StreakTracker,
}

impl CycleManager {
    pub fn new(ports: Ports, schedule: CycleSchedule, streaks: StreakTracker) -> Self {
        Self { ports, schedule, streaks }
    }

    pub fn schedule(&self) -> &CycleSchedule {
        &self.schedule
    }

    /// `openCycle()`. A `Conflict` here means "already running".
    #[instrument(skip_all)]
    pub async fn open_cycle(&self) -> Result<OpenedCycle> {
        let store = &self.ports.store;
        if let Some(open) = store.find_open_cycle().await? {
            return Err(AppError::Conflict(format!("cycle {} is already open", open.id)));
        }
        if let Some(pending) = store.list_cycles_with_status(CycleStatus::Closed).await?.first() {
            return Err(AppError::Conflict(format!(
                "cycle {} is closed but not yet compiled",
                pending.id
            )));
        }

        let now = self.ports.clock.now();
        let window = self.schedule.window_for(now)?;
        if now >= window.deadline {
            return Err(AppError::Conflict(format!(
                "cycle {} already passed its deadline {}",
                window.cycle, window.deadline
            )));
        }
        let cycle = Cycle {
            id: window.cycle,
            opens_at: window.opens_at,
            deadline: window.deadline,
            status: CycleStatus::Open,
            created_at: now,
        };

        store.insert_cycle(cycle.clone()).await.map_err(|err| match err {
            StoreError::Conflict(_) => {
                AppError::Conflict(format!("cycle {} already exists or another is open", cycle.id))
            }
            other => other.into(),
        })?;

        let members = store.list_active_members().await?;
        info!(cycle = %cycle.id, deadline = %cycle.deadline, members = members.len(), "cycle opened");
        deliver(
            "window_open",
            self.ports.notifier.send_window_open_notice(&members, &cycle),
        )
        .await;

        Ok(OpenedCycle { cycle, members })
    }

    /// `acceptSubmission(member, payload)`.
    ///
    /// The pre-check only produces a friendlier error; the store's
    /// (member, cycle) uniqueness constraint is what actually prevents a
    /// double insert under concurrent deliveries.
    #[instrument(skip_all, fields(member = %member.email))]
    pub async fn accept_submission(
        &self,
        member: &Member,
        fields: SubmissionFields,
    ) -> Result<Submission> {
        if !member.is_active {
            return Err(AppError::ValidationError(format!("{} is not active", member.email)));
        }
        let store = &self.ports.store;
        let cycle = store.find_open_cycle().await?.ok_or(AppError::NoActiveWindow)?;

        let duplicate = || AppError::DuplicateSubmission {
            member: member.email.clone(),
            cycle: cycle.id,
        };
        if store.find_submission(member.id, cycle.id).await?.is_some() {
            return Err(duplicate());
        }

        let submission = Submission {
            id: Uuid::now_v7(),
            member_id: member.id,
            cycle_id: cycle.id,
            fields,
            submitted_at: self.ports.clock.now(),
        };
        store
            .insert_submission(submission.clone())
            .await
            .map_err(|err| match err {
                StoreError::Conflict(_) => duplicate(),
                other => other.into(),
            })?;

        info!(cycle = %cycle.id, "submission accepted");
        deliver(
            "submission_ack",
            self.ports.notifier.send_submission_ack(member, &submission),
        )
        .await;
        Ok(submission)
    }

    /// `closeCycle()`: `open -> closed`, streaks, distribution, `compiled`.
    #[instrument(skip_all)]
    pub async fn close_cycle(&self) -> Result<CompiledCycle> {
        let store = &self.ports.store;
        let mut cycle = store.find_open_cycle().await?.ok_or(AppError::NoActiveWindow)?;

        if !store
            .update_cycle_status(cycle.id, CycleStatus::Open, CycleStatus::Closed)
            .await?
        {
            return Err(AppError::Conflict(format!("cycle {} was closed concurrently", cycle.id)));
        }
        cycle.status = CycleStatus::Closed;
        info!(cycle = %cycle.id, "cycle closed");

        self.compile(cycle).await
    }

    /// `manualCompile(cycleId)`: compiles a `closed` cycle out of band.
    #[instrument(skip(self))]
    pub async fn manual_compile(&self, id: CycleId) -> Result<CompiledCycle> {
        let cycle = self
            .ports
            .store
            .get_cycle(id)
            .await?
            .ok_or_else(|| AppError::NotFound("cycle".into(), id.to_string()))?;

        match cycle.status {
            CycleStatus::Open => Err(AppError::Conflict(format!(
                "cycle {id} is still open; close it instead"
            ))),
            CycleStatus::Compiled => Err(AppError::AlreadyCompiled(id)),
            CycleStatus::Closed => self.compile(cycle).await,
        }
    }

    /// Every active member gets exactly one streak evaluation before the
    /// cycle may reach `compiled`. A failure leaves the cycle `closed`.
    async fn compile(&self, mut cycle: Cycle) -> Result<CompiledCycle> {
        let store = &self.ports.store;
        let submissions = store.list_submissions(cycle.id).await?;
        let submitted: HashSet<Uuid> = submissions.iter().map(|s| s.member_id).collect();
        let members = store.list_active_members().await?;

        let mut streaks = Vec::with_capacity(members.len());
        let mut already_evaluated = 0;
        for member in &members {
            match self
                .streaks
                .update_streak(member, cycle.id, submitted.contains(&member.id))
                .await
            {
                Ok(result) => streaks.push(result),
                Err(AppError::AlreadyProcessed(reason)) => {
                    debug!(%reason, "skipping streak evaluated by an earlier compile");
                    already_evaluated += 1;
                }
                Err(err) => {
                    warn!(cycle = %cycle.id, member = %member.email, error = %err, "compile aborted; cycle stays closed");
                    return Err(err);
                }
            }
        }

        if !submissions.is_empty() {
            deliver(
                "compilation",
                self.ports
                    .notifier
                    .send_compilation_notice(&members, &submissions, &cycle),
            )
            .await;
        }

        if !store
            .update_cycle_status(cycle.id, CycleStatus::Closed, CycleStatus::Compiled)
            .await?
        {
            return Err(AppError::AlreadyCompiled(cycle.id));
        }
        cycle.status = CycleStatus::Compiled;
        info!(cycle = %cycle.id, submissions = submissions.len(), "cycle compiled");

        Ok(CompiledCycle {
            cycle,
            submissions: submissions.len(),
            streaks,
            already_evaluated,
        })
    }
}
