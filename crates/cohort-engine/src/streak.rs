//! # Streak Tracker
//!
//! Per-member consecutive-participation counter, advanced once per member
//! for every cycle close. Continuity is decided by
//! [`are_adjacent`](cohort_core::are_adjacent), never by subtracting ids.

use chrono::{DateTime, Utc};
use cohort_core::error::{AppError, Result};
use cohort_core::models::{Member, Streak};
use cohort_core::traits::StreakRepo;
use cohort_core::{are_adjacent, CycleId, EligibilityRules};
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::notify::deliver;
use crate::Ports;

/// What happened to a member's streak at one cycle close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreakResult {
    pub member_id: Uuid,
    pub cycle: CycleId,
    pub current: u32,
    pub longest: u32,
    pub invite_eligible: bool,
    /// Eligibility flipped from false to true during this update.
    pub eligibility_granted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EligibilityChange {
    Unchanged,
    Granted,
    Revoked,
}

/// Recomputes the eligibility flag from the pure rule. The only place the
/// flag is ever written.
pub fn apply_eligibility(
    streak: &mut Streak,
    rules: &EligibilityRules,
    invitations_sent: u32,
    now: DateTime<Utc>,
) -> EligibilityChange {
    let eligible = rules.is_eligible(streak.current, invitations_sent);
    let change = match (streak.invite_eligible, eligible) {
        (false, true) => {
            streak.eligible_since.get_or_insert(now);
            EligibilityChange::Granted
        }
        (true, false) => EligibilityChange::Revoked,
        _ => EligibilityChange::Unchanged,
    };
    streak.invite_eligible = eligible;
    change
}

/// The raw streak transition. Has no guard: applying the same submission
/// twice corrupts the count, so only [`StreakTracker::update_streak`]
/// may call it.
pub fn advance(
    existing: Option<Streak>,
    member_id: Uuid,
    cycle: CycleId,
    did_submit: bool,
    rules: &EligibilityRules,
    invitations_sent: u32,
    now: DateTime<Utc>,
) -> (Streak, EligibilityChange) {
    let mut streak = match existing {
        None => {
            let mut fresh = Streak::empty(member_id, now);
            if did_submit {
                fresh.current = 1;
                fresh.last_cycle = Some(cycle);
            }
            fresh
        }
        Some(mut streak) => {
            if did_submit {
                streak.current = match streak.last_cycle {
                    Some(last) if are_adjacent(last, cycle) => streak.current + 1,
                    _ => 1,
                };
                streak.last_cycle = Some(cycle);
            } else {
                streak.current = 0;
            }
            streak
        }
    };

    streak.longest = streak.longest.max(streak.current);
    streak.last_evaluated_cycle = Some(cycle);
    streak.updated_at = now;
    let change = apply_eligibility(&mut streak, rules, invitations_sent, now);
    (streak, change)
}

#[derive(Clone)]
pub struct StreakTracker {
    ports: Ports,
    rules: EligibilityRules,
}

impl StreakTracker {
    pub fn new(ports: Ports, rules: EligibilityRules) -> Self {
        Self { ports, rules }
    }

    pub fn rules(&self) -> &EligibilityRules {
        &self.rules
    }

    /// `updateStreak(member, cycleId, didSubmit)`.
    ///
    /// Refuses with `AlreadyProcessed` when this member was already evaluated
    /// for `cycle` (or a later one), which makes a resumed close safe.
    #[instrument(skip_all, fields(member = %member.email, cycle = %cycle, did_submit))]
    pub async fn update_streak(
        &self,
        member: &Member,
        cycle: CycleId,
        did_submit: bool,
    ) -> Result<StreakResult> {
        let existing = self.ports.store.get_streak(member.id).await?;
        if let Some(evaluated) = existing.as_ref().and_then(|s| s.last_evaluated_cycle) {
            if evaluated >= cycle {
                return Err(AppError::AlreadyProcessed(format!(
                    "streak for {} already evaluated for {evaluated}",
                    member.email
                )));
            }
        }

        let now = self.ports.clock.now();
        let (streak, change) = advance(
            existing,
            member.id,
            cycle,
            did_submit,
            &self.rules,
            member.invitations_sent,
            now,
        );
        self.ports.store.save_streak(streak.clone()).await?;
        debug!(current = streak.current, longest = streak.longest, did_submit, "streak updated");

        if change == EligibilityChange::Granted {
            info!(streak = streak.current, "invite eligibility granted");
            deliver(
                "eligibility_granted",
                self.ports.notifier.send_eligibility_granted(member, streak.current),
            )
            .await;
        }

        Ok(StreakResult {
            member_id: member.id,
            cycle,
            current: streak.current,
            longest: streak.longest,
            invite_eligible: streak.invite_eligible,
            eligibility_granted: change == EligibilityChange::Granted,
        })
    }

    /// Re-derives the flag for one member outside a cycle close (invitation
    /// sent, periodic sweep). Emits the granted notice on a false->true flip.
    pub async fn refresh_eligibility(&self, member: &Member) -> Result<EligibilityChange> {
        let Some(mut streak) = self.ports.store.get_streak(member.id).await? else {
            return Ok(EligibilityChange::Unchanged);
        };
        let now = self.ports.clock.now();
        let change = apply_eligibility(&mut streak, &self.rules, member.invitations_sent, now);
        if change == EligibilityChange::Unchanged {
            return Ok(change);
        }

        streak.updated_at = now;
        let current = streak.current;
        self.ports.store.save_streak(streak).await?;
        if change == EligibilityChange::Granted {
            deliver(
                "eligibility_granted",
                self.ports.notifier.send_eligibility_granted(member, current),
            )
            .await;
        }
        Ok(change)
    }
}
