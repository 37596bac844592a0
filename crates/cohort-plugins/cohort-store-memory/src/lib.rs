//! # cohort-store-memory
//!
//! In-process implementation of every store port.
//! Enforces the same uniqueness rules as the SQLite schema so engine
//! behaviour does not depend on which backend is plugged in.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cohort_core::error::{StoreError, StoreResult};
use cohort_core::models::{
    Cycle, CycleStatus, Invitation, InvitationStatus, Member, Streak, Submission,
};
use cohort_core::traits::{
    constraint, CycleRepo, InvitationRepo, MemberRepo, StreakRepo, SubmissionRepo,
};
use cohort_core::CycleId;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    cycles: HashMap<CycleId, Cycle>,
    members: HashMap<Uuid, Member>,
    submissions: Vec<Submission>,
    streaks: HashMap<Uuid, Streak>,
    invitations: Vec<Invitation>,
}

impl Tables {
    fn check_member(&self, member: &Member) -> StoreResult<()> {
        if self.members.values().any(|m| m.email == member.email) {
            return Err(StoreError::Conflict(constraint::MEMBER_EMAIL.into()));
        }
        Ok(())
    }

    fn check_invitation(&self, invitation: &Invitation) -> StoreResult<()> {
        if self.invitations.iter().any(|i| i.token == invitation.token) {
            return Err(StoreError::Conflict(constraint::INVITATION_TOKEN.into()));
        }
        if invitation.status == InvitationStatus::Pending
            && self.invitations.iter().any(|i| {
                i.status == InvitationStatus::Pending && i.invitee_email == invitation.invitee_email
            })
        {
            return Err(StoreError::Conflict(constraint::PENDING_INVITEE.into()));
        }
        Ok(())
    }
}

/// Every multi-row operation runs under a single write guard, which is what
/// makes it atomic here.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CycleRepo for MemoryStore {
    async fn insert_cycle(&self, cycle: Cycle) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t.cycles.contains_key(&cycle.id) {
            return Err(StoreError::Conflict(constraint::CYCLE_ID.into()));
        }
        if cycle.status == CycleStatus::Open
            && t.cycles.values().any(|c| c.status == CycleStatus::Open)
        {
            return Err(StoreError::Conflict(constraint::SINGLE_OPEN_CYCLE.into()));
        }
        t.cycles.insert(cycle.id, cycle);
        Ok(())
    }

    async fn get_cycle(&self, id: CycleId) -> StoreResult<Option<Cycle>> {
        Ok(self.tables.read().await.cycles.get(&id).cloned())
    }

    async fn find_open_cycle(&self) -> StoreResult<Option<Cycle>> {
        let t = self.tables.read().await;
        Ok(t.cycles.values().find(|c| c.status == CycleStatus::Open).cloned())
    }

    async fn list_cycles_with_status(&self, status: CycleStatus) -> StoreResult<Vec<Cycle>> {
        let t = self.tables.read().await;
        let mut cycles: Vec<Cycle> = t.cycles.values().filter(|c| c.status == status).cloned().collect();
        cycles.sort_by_key(|c| c.id);
        Ok(cycles)
    }

    async fn list_cycle_ids(&self) -> StoreResult<Vec<CycleId>> {
        let t = self.tables.read().await;
        let mut ids: Vec<CycleId> = t.cycles.keys().copied().collect();
        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    async fn update_cycle_status(
        &self,
        id: CycleId,
        from: CycleStatus,
        to: CycleStatus,
    ) -> StoreResult<bool> {
        let mut t = self.tables.write().await;
        match t.cycles.get_mut(&id) {
            Some(cycle) if cycle.status == from => {
                cycle.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl MemberRepo for MemoryStore {
    async fn insert_member(&self, member: Member) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.check_member(&member)?;
        t.members.insert(member.id, member);
        Ok(())
    }

    async fn enroll_member(&self, member: Member, streak: Streak) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        t.check_member(&member)?;
        t.streaks.insert(streak.member_id, streak);
        t.members.insert(member.id, member);
        Ok(())
    }

    async fn get_member(&self, id: Uuid) -> StoreResult<Option<Member>> {
        Ok(self.tables.read().await.members.get(&id).cloned())
    }

    async fn find_member_by_email(&self, email: &str) -> StoreResult<Option<Member>> {
        let t = self.tables.read().await;
        Ok(t.members.values().find(|m| m.email == email).cloned())
    }

    async fn list_active_members(&self) -> StoreResult<Vec<Member>> {
        let t = self.tables.read().await;
        let mut members: Vec<Member> = t.members.values().filter(|m| m.is_active).cloned().collect();
        members.sort_by_key(|m| (m.joined_at, m.id));
        Ok(members)
    }

    async fn set_member_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let mut t = self.tables.write().await;
        Ok(t.members.get_mut(&id).map(|m| m.is_active = active).is_some())
    }
}

#[async_trait]
impl SubmissionRepo for MemoryStore {
    async fn insert_submission(&self, submission: Submission) -> StoreResult<()> {
        let mut t = self.tables.write().await;
        if t
            .submissions
            .iter()
            .any(|s| s.member_id == submission.member_id && s.cycle_id == submission.cycle_id)
        {
            return Err(StoreError::Conflict(constraint::SUBMISSION_MEMBER_CYCLE.into()));
        }
        t.submissions.push(submission);
        Ok(())
    }

    async fn find_submission(
        &self,
        member_id: Uuid,
        cycle_id: CycleId,
    ) -> StoreResult<Option<Submission>> {
        let t = self.tables.read().await;
        Ok(t.submissions
            .iter()
            .find(|s| s.member_id == member_id && s.cycle_id == cycle_id)
            .cloned())
    }

    async fn list_submissions(&self, cycle_id: CycleId) -> StoreResult<Vec<Submission>> {
        let t = self.tables.read().await;
        let mut submissions: Vec<Submission> =
            t.submissions.iter().filter(|s| s.cycle_id == cycle_id).cloned().collect();
        submissions.sort_by_key(|s| (s.submitted_at, s.id));
        Ok(submissions)
    }

    async fn delete_submissions_before(&self, cycle_id: CycleId) -> StoreResult<u64> {
        let mut t = self.tables.write().await;
        let before = t.submissions.len();
        t.submissions.retain(|s| s.cycle_id >= cycle_id);
        Ok((before - t.submissions.len()) as u64)
    }
}

#[async_trait]
impl StreakRepo for MemoryStore {
    async fn get_streak(&self, member_id: Uuid) -> StoreResult<Option<Streak>> {
        Ok(self.tables.read().await.streaks.get(&member_id).cloned())
    }

    async fn save_streak(&self, streak: Streak) -> StoreResult<()> {
        self.tables.write().await.streaks.insert(streak.member_id, streak);
        Ok(())
    }
}

#[async_trait]
impl InvitationRepo for MemoryStore {
    async fn issue_invitation(&self, invitation: Invitation, cap: u32) -> StoreResult<Option<u32>> {
        let mut t = self.tables.write().await;
        let sent = match t.members.get(&invitation.inviter_id) {
            Some(inviter) if inviter.invitations_sent < cap => inviter.invitations_sent + 1,
            _ => return Ok(None),
        };
        t.check_invitation(&invitation)?;
        if let Some(inviter) = t.members.get_mut(&invitation.inviter_id) {
            inviter.invitations_sent = sent;
        }
        t.invitations.push(invitation);
        Ok(Some(sent))
    }

    async fn find_invitation_by_token(&self, token: &str) -> StoreResult<Option<Invitation>> {
        let t = self.tables.read().await;
        Ok(t.invitations.iter().find(|i| i.token == token).cloned())
    }

    async fn find_pending_invitation(&self, email: &str) -> StoreResult<Option<Invitation>> {
        let t = self.tables.read().await;
        Ok(t.invitations
            .iter()
            .find(|i| i.status == InvitationStatus::Pending && i.invitee_email == email)
            .cloned())
    }

    async fn list_expired_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<Invitation>> {
        let t = self.tables.read().await;
        let mut lapsed: Vec<Invitation> = t
            .invitations
            .iter()
            .filter(|i| i.status == InvitationStatus::Pending && i.is_expired_at(now))
            .cloned()
            .collect();
        lapsed.sort_by_key(|i| (i.expires_at, i.id));
        Ok(lapsed)
    }

    async fn transition_invitation(
        &self,
        id: Uuid,
        from: InvitationStatus,
        to: InvitationStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut t = self.tables.write().await;
        match t.invitations.iter_mut().find(|i| i.id == id) {
            Some(invitation) if invitation.status == from => {
                invitation.status = to;
                if to == InvitationStatus::Accepted {
                    invitation.accepted_at = Some(at);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn redeem_invitation(
        &self,
        invitation_id: Uuid,
        member: Member,
        streak: Streak,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut t = self.tables.write().await;
        let Some(index) = t
            .invitations
            .iter()
            .position(|i| i.id == invitation_id && i.status == InvitationStatus::Pending)
        else {
            return Ok(false);
        };
        t.check_member(&member)?;
        let invitation = &mut t.invitations[index];
        invitation.status = InvitationStatus::Accepted;
        invitation.accepted_at = Some(at);
        t.streaks.insert(streak.member_id, streak);
        t.members.insert(member.id, member);
        Ok(true)
    }
}
