//! # Core Traits (Ports)
//!
//! Any plugin must implement these traits to be used by the binary.
//! Stores enforce uniqueness themselves; callers rely on
//! [`StoreError::Conflict`](crate::error::StoreError::Conflict) as the authoritative duplicate guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::calendar::CycleId;
use crate::error::StoreResult;
use crate::models::{
    Cycle, CycleStatus, Invitation, InvitationStatus, Member, Streak, Submission,
};

/// Constraint names reported in `StoreError::Conflict`.
pub mod constraint {
    pub const CYCLE_ID: &str = "cycles.id";
    pub const SINGLE_OPEN_CYCLE: &str = "cycles.single_open";
    pub const MEMBER_EMAIL: &str = "members.email";
    pub const SUBMISSION_MEMBER_CYCLE: &str = "submissions.member_cycle";
    pub const INVITATION_TOKEN: &str = "invitations.token";
    pub const PENDING_INVITEE: &str = "invitations.pending_invitee";
}

#[async_trait]
pub trait CycleRepo: Send + Sync {
    /// Fails with `Conflict` on a duplicate identifier or a second `open` cycle.
    async fn insert_cycle(&self, cycle: Cycle) -> StoreResult<()>;
    async fn get_cycle(&self, id: CycleId) -> StoreResult<Option<Cycle>>;
    /// The single cycle with status `open`, if any.
    async fn find_open_cycle(&self) -> StoreResult<Option<Cycle>>;
    async fn list_cycles_with_status(&self, status: CycleStatus) -> StoreResult<Vec<Cycle>>;
    /// All cycle identifiers, newest first.
    async fn list_cycle_ids(&self) -> StoreResult<Vec<CycleId>>;
    /// Compare-and-set. Returns `false` when the cycle was not in `from`.
    async fn update_cycle_status(
        &self,
        id: CycleId,
        from: CycleStatus,
        to: CycleStatus,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait MemberRepo: Send + Sync {
    /// Fails with `Conflict` when the (normalized) email is taken.
    async fn insert_member(&self, member: Member) -> StoreResult<()>;
    /// Inserts the member and its initial streak as one unit. Nothing is
    /// written when either insert fails.
    async fn enroll_member(&self, member: Member, streak: Streak) -> StoreResult<()>;
    async fn get_member(&self, id: Uuid) -> StoreResult<Option<Member>>;
    /// `email` must already be normalized.
    async fn find_member_by_email(&self, email: &str) -> StoreResult<Option<Member>>;
    async fn list_active_members(&self) -> StoreResult<Vec<Member>>;
    async fn set_member_active(&self, id: Uuid, active: bool) -> StoreResult<bool>;
}

#[async_trait]
pub trait SubmissionRepo: Send + Sync {
    /// Fails with `Conflict` when the (member, cycle) pair already exists.
    async fn insert_submission(&self, submission: Submission) -> StoreResult<()>;
    async fn find_submission(
        &self,
        member_id: Uuid,
        cycle_id: CycleId,
    ) -> StoreResult<Option<Submission>>;
    async fn list_submissions(&self, cycle_id: CycleId) -> StoreResult<Vec<Submission>>;
    /// Bulk retention cleanup. Returns the number of rows removed.
    async fn delete_submissions_before(&self, cycle_id: CycleId) -> StoreResult<u64>;
}

#[async_trait]
pub trait StreakRepo: Send + Sync {
    async fn get_streak(&self, member_id: Uuid) -> StoreResult<Option<Streak>>;
    /// Insert-or-replace keyed by member.
    async fn save_streak(&self, streak: Streak) -> StoreResult<()>;
}

#[async_trait]
pub trait InvitationRepo: Send + Sync {
    /// Reserves one of the inviter's `cap` slots and inserts the invitation
    /// as one unit, returning the inviter's new lifetime count.
    ///
    /// `Ok(None)` when the inviter is unknown or already at `cap`; nothing
    /// is written. Fails with `Conflict` on a duplicate token or a second
    /// `pending` invitation for the same invitee, leaving the count as it was.
    async fn issue_invitation(&self, invitation: Invitation, cap: u32) -> StoreResult<Option<u32>>;
    async fn find_invitation_by_token(&self, token: &str) -> StoreResult<Option<Invitation>>;
    /// A `pending` invitation for `email`, expired or not.
    async fn find_pending_invitation(&self, email: &str) -> StoreResult<Option<Invitation>>;
    /// `pending` invitations whose expiry is at or before `now`.
    async fn list_expired_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<Invitation>>;
    /// Compare-and-set. `at` is recorded as `accepted_at` when moving to
    /// `accepted`. Returns `false` when the invitation was not in `from`.
    async fn transition_invitation(
        &self,
        id: Uuid,
        from: InvitationStatus,
        to: InvitationStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Moves a `pending` invitation to `accepted` and enrolls the invitee
    /// with its initial streak, all or nothing.
    ///
    /// `Ok(false)` when the invitation was no longer `pending`; nothing is
    /// written. Fails with `Conflict` when the invitee's email is already a
    /// member, leaving the invitation `pending`.
    async fn redeem_invitation(
        &self,
        invitation_id: Uuid,
        member: Member,
        streak: Streak,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

/// One configured persistence backend per process.
pub trait Store: CycleRepo + MemberRepo + SubmissionRepo + StreakRepo + InvitationRepo {}

impl<T> Store for T where T: CycleRepo + MemberRepo + SubmissionRepo + StreakRepo + InvitationRepo {}

/// Outbound messaging contract. Fire-and-forget: the engine logs failures
/// and never rolls back the state change that triggered a message.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_window_open_notice(&self, members: &[Member], cycle: &Cycle) -> anyhow::Result<()>;

    async fn send_compilation_notice(
        &self,
        members: &[Member],
        submissions: &[Submission],
        cycle: &Cycle,
    ) -> anyhow::Result<()>;

    async fn send_submission_ack(&self, member: &Member, submission: &Submission) -> anyhow::Result<()>;

    async fn send_invitation(
        &self,
        inviter_display_name: &str,
        invitee_email: &str,
        token: &str,
    ) -> anyhow::Result<()>;

    async fn send_eligibility_granted(&self, member: &Member, streak_count: u32) -> anyhow::Result<()>;
}

/// Source of "now". Injected so expiry and window timing can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock tests move by hand.
#[cfg(any(test, feature = "testing"))]
pub struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

#[cfg(any(test, feature = "testing"))]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(std::sync::Mutex::new(start))
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.0.lock().unwrap() = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.0.lock().unwrap() += by;
    }
}

#[cfg(any(test, feature = "testing"))]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}
