//! Shared fixtures for the engine's unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cohort_core::error::{StoreError, StoreResult};
use cohort_core::models::{
    Cycle, CycleStatus, Invitation, InvitationStatus, Member, Streak, Submission, SubmissionFields,
};
use cohort_core::traits::{
    CycleRepo, InvitationRepo, ManualClock, MemberRepo, MockNotifier, StreakRepo, SubmissionRepo,
};
use cohort_core::CycleId;
use cohort_store_memory::MemoryStore;
use uuid::Uuid;

use crate::{Engine, EngineSettings, Ports};

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

pub fn fields(highlight: &str) -> SubmissionFields {
    SubmissionFields {
        highlight: highlight.to_string(),
        ..Default::default()
    }
}

/// A notifier that accepts every message.
pub fn quiet_notifier() -> MockNotifier {
    let mut notifier = MockNotifier::new();
    notifier.expect_send_window_open_notice().returning(|_, _| Ok(()));
    notifier.expect_send_compilation_notice().returning(|_, _, _| Ok(()));
    notifier.expect_send_submission_ack().returning(|_, _| Ok(()));
    notifier.expect_send_invitation().returning(|_, _, _| Ok(()));
    notifier.expect_send_eligibility_granted().returning(|_, _| Ok(()));
    notifier
}

pub struct Harness {
    pub engine: Engine,
    /// The backing tables, bypassing `faults`.
    pub store: Arc<MemoryStore>,
    /// What the engine actually talks to.
    pub faults: Arc<FaultyStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    /// Clock starts Monday 2024-01-01 10:00 UTC, inside the default window
    /// of cycle 202401.
    pub fn new(notifier: MockNotifier) -> Self {
        Self::with_settings(notifier, EngineSettings::default())
    }

    pub fn with_settings(notifier: MockNotifier, settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let clock = Arc::new(ManualClock::new(at(2024, 1, 1, 10)));
        let ports = Ports {
            store: faults.clone(),
            notifier: Arc::new(notifier),
            clock: clock.clone(),
        };
        Self {
            engine: Engine::new(ports, settings),
            store,
            faults,
            clock,
        }
    }

    /// Inserts an active member without a streak record.
    pub async fn member(&self, email: &str) -> Member {
        self.insert(Member::new(email, None, at(2023, 12, 1, 0))).await
    }

    pub async fn named_member(&self, email: &str, name: &str) -> Member {
        self.insert(Member::new(email, Some(name.to_string()), at(2023, 12, 1, 0)))
            .await
    }

    async fn insert(&self, member: Member) -> Member {
        self.store.insert_member(member.clone()).await.unwrap();
        member
    }

    /// Overwrites the member's streak, leaving it never evaluated.
    pub async fn seed_streak(&self, member: &Member, current: u32, eligible: bool) {
        let mut streak = Streak::empty(member.id, at(2023, 12, 1, 0));
        streak.current = current;
        streak.longest = current;
        streak.invite_eligible = eligible;
        self.store.save_streak(streak).await.unwrap();
    }
}

/// Delegates to a [`MemoryStore`] except for one chosen row: reading that
/// member's streak or transitioning that invitation fails with a backend
/// error.
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    broken: Mutex<Option<Uuid>>,
}

impl FaultyStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner, broken: Mutex::new(None) }
    }

    pub fn break_on(&self, id: Uuid) {
        *self.broken.lock().unwrap() = Some(id);
    }

    fn check(&self, id: Uuid) -> StoreResult<()> {
        if *self.broken.lock().unwrap() == Some(id) {
            return Err(StoreError::Backend(anyhow::anyhow!("injected failure for {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CycleRepo for FaultyStore {
    async fn insert_cycle(&self, cycle: Cycle) -> StoreResult<()> {
        self.inner.insert_cycle(cycle).await
    }

    async fn get_cycle(&self, id: CycleId) -> StoreResult<Option<Cycle>> {
        self.inner.get_cycle(id).await
    }

    async fn find_open_cycle(&self) -> StoreResult<Option<Cycle>> {
        self.inner.find_open_cycle().await
    }

    async fn list_cycles_with_status(&self, status: CycleStatus) -> StoreResult<Vec<Cycle>> {
        self.inner.list_cycles_with_status(status).await
    }

    async fn list_cycle_ids(&self) -> StoreResult<Vec<CycleId>> {
        self.inner.list_cycle_ids().await
    }

    async fn update_cycle_status(
        &self,
        id: CycleId,
        from: CycleStatus,
        to: CycleStatus,
    ) -> StoreResult<bool> {
        self.inner.update_cycle_status(id, from, to).await
    }
}

#[async_trait]
impl MemberRepo for FaultyStore {
    async fn insert_member(&self, member: Member) -> StoreResult<()> {
        self.inner.insert_member(member).await
    }

    async fn enroll_member(&self, member: Member, streak: Streak) -> StoreResult<()> {
        self.inner.enroll_member(member, streak).await
    }

    async fn get_member(&self, id: Uuid) -> StoreResult<Option<Member>> {
        self.inner.get_member(id).await
    }

    async fn find_member_by_email(&self, email: &str) -> StoreResult<Option<Member>> {
        self.inner.find_member_by_email(email).await
    }

    async fn list_active_members(&self) -> StoreResult<Vec<Member>> {
        self.inner.list_active_members().await
    }

    async fn set_member_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        self.inner.set_member_active(id, active).await
    }
}

#[async_trait]
impl SubmissionRepo for FaultyStore {
    async fn insert_submission(&self, submission: Submission) -> StoreResult<()> {
        self.inner.insert_submission(submission).await
    }

    async fn find_submission(
        &self,
        member_id: Uuid,
        cycle_id: CycleId,
    ) -> StoreResult<Option<Submission>> {
        self.inner.find_submission(member_id, cycle_id).await
    }

    async fn list_submissions(&self, cycle_id: CycleId) -> StoreResult<Vec<Submission>> {
        self.inner.list_submissions(cycle_id).await
    }

    async fn delete_submissions_before(&self, cycle_id: CycleId) -> StoreResult<u64> {
        self.inner.delete_submissions_before(cycle_id).await
    }
}

#[async_trait]
impl StreakRepo for FaultyStore {
    async fn get_streak(&self, member_id: Uuid) -> StoreResult<Option<Streak>> {
        self.check(member_id)?;
        self.inner.get_streak(member_id).await
    }

    async fn save_streak(&self, streak: Streak) -> StoreResult<()> {
        self.inner.save_streak(streak).await
    }
}

#[async_trait]
impl InvitationRepo for FaultyStore {
    async fn issue_invitation(&self, invitation: Invitation, cap: u32) -> StoreResult<Option<u32>> {
        self.inner.issue_invitation(invitation, cap).await
    }

    async fn find_invitation_by_token(&self, token: &str) -> StoreResult<Option<Invitation>> {
        self.inner.find_invitation_by_token(token).await
    }

    async fn find_pending_invitation(&self, email: &str) -> StoreResult<Option<Invitation>> {
        self.inner.find_pending_invitation(email).await
    }

    async fn list_expired_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<Invitation>> {
        self.inner.list_expired_pending(now).await
    }

    async fn transition_invitation(
        &self,
        id: Uuid,
        from: InvitationStatus,
        to: InvitationStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check(id)?;
        self.inner.transition_invitation(id, from, to, at).await
    }

    async fn redeem_invitation(
        &self,
        invitation_id: Uuid,
        member: Member,
        streak: Streak,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.redeem_invitation(invitation_id, member, streak, at).await
    }
}
