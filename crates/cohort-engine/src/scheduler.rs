//! # Trigger Scheduler
//!
//! Polls the clock and the store on a fixed tick and fires whatever is due.
//! Triggers are derived from persisted state on every tick, so a restart
//! or a missed tick simply catches up on the next one. A failing trigger is
//! logged and tried again next tick.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use cohort_core::error::Result;
use cohort_core::models::CycleStatus;
use cohort_core::traits::CycleRepo;
use cohort_core::CycleId;
use serde::Serialize;
use tracing::{debug, error, info, instrument};

use crate::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "trigger", content = "arg", rename_all = "snake_case")]
pub enum Trigger {
    OpenWindow,
    CloseWindow,
    /// Finish a cycle left `closed` by an interrupted close.
    Compile(CycleId),
    /// Eligibility and invitation-expiry sweeps for one local day.
    DailySweep(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Local hour from which the daily sweep may run.
    pub sweep_hour: u32,
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_hour: 3,
            tick: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fired: Vec<Trigger>,
    pub failed: Vec<Trigger>,
}

pub struct Scheduler {
    engine: Engine,
    config: SchedulerConfig,
    last_sweep: Option<NaiveDate>,
}

impl Scheduler {
    pub fn new(engine: Engine, config: SchedulerConfig) -> Self {
        Self { engine, config, last_sweep: None }
    }

    /// Everything due at `now`, in the order it should run: resumes first,
    /// then the close, then the open, then the sweep.
    pub async fn due_triggers(&self, now: DateTime<Utc>) -> Result<Vec<Trigger>> {
        let store = &self.engine.ports().store;
        let schedule = self.engine.cycles.schedule();
        let mut due: Vec<Trigger> = store
            .list_cycles_with_status(CycleStatus::Closed)
            .await?
            .into_iter()
            .map(|c| Trigger::Compile(c.id))
            .collect();

        match store.find_open_cycle().await? {
            Some(open) if now >= open.deadline => due.push(Trigger::CloseWindow),
            Some(_) => {}
            None if due.is_empty() => {
                let window = schedule.window_for(now)?;
                if now >= window.opens_at
                    && now < window.deadline
                    && store.get_cycle(window.cycle).await?.is_none()
                {
                    due.push(Trigger::OpenWindow);
                }
            }
            None => {}
        }

        let local = now.with_timezone(&schedule.timezone);
        let today = local.date_naive();
        if local.hour() >= self.config.sweep_hour && self.last_sweep != Some(today) {
            due.push(Trigger::DailySweep(today));
        }
        Ok(due)
    }

    /// Runs one round of due triggers.
    #[instrument(skip(self))]
    pub async fn tick(&mut self) -> TickReport {
        let now = self.engine.ports().clock.now();
        let mut report = TickReport::default();
        let due = match self.due_triggers(now).await {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "could not determine due triggers");
                return report;
            }
        };

        for trigger in due {
            match self.fire(trigger).await {
                Ok(()) => {
                    if let Trigger::DailySweep(day) = trigger {
                        self.last_sweep = Some(day);
                    }
                    report.fired.push(trigger);
                }
                Err(err) => {
                    error!(?trigger, kind = err.kind(), error = %err, "trigger failed; retrying next tick");
                    report.failed.push(trigger);
                }
            }
        }
        report
    }

    async fn fire(&self, trigger: Trigger) -> Result<()> {
        match trigger {
            Trigger::OpenWindow => {
                let opened = self.engine.cycles.open_cycle().await?;
                info!(cycle = %opened.cycle.id, "scheduled open");
            }
            Trigger::CloseWindow => {
                let compiled = self.engine.cycles.close_cycle().await?;
                info!(cycle = %compiled.cycle.id, submissions = compiled.submissions, "scheduled close");
            }
            Trigger::Compile(id) => {
                let compiled = self.engine.cycles.manual_compile(id).await?;
                info!(cycle = %id, resumed = compiled.already_evaluated, "resumed compile");
            }
            Trigger::DailySweep(day) => {
                let eligibility = self.engine.invitations.sweep_eligibility().await?;
                let expiry = self.engine.invitations.sweep_expired_invitations().await?;
                info!(%day, ?eligibility, ?expiry, "daily sweep finished");
            }
        }
        Ok(())
    }

    /// Ticks until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(tick = ?self.config.tick, sweep_hour = self.config.sweep_hour, "scheduler started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.fired.is_empty() || !report.failed.is_empty() {
                        debug!(?report, "tick");
                    }
                }
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }
}
