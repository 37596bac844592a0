//! # Domain Models
//!
//! These structs represent the core entities of a cohort: the weekly cycle,
//! member submissions, streaks and invitations.
//! Row identifiers are UUID v7 so they sort by creation time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::CycleId;
use crate::error::AppError;

/// Lowercases and trims an address so lookups and uniqueness are
/// case-insensitive.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Forward-only progression of a cycle: `open -> closed -> compiled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Open,
    Closed,
    Compiled,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Open => "open",
            CycleStatus::Closed => "closed",
            CycleStatus::Compiled => "compiled",
        }
    }

    /// Whether `self -> next` is a legal single step.
    pub fn can_advance_to(self, next: CycleStatus) -> bool {
        matches!(
            (self, next),
            (CycleStatus::Open, CycleStatus::Closed) | (CycleStatus::Closed, CycleStatus::Compiled)
        )
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(CycleStatus::Open),
            "closed" => Ok(CycleStatus::Closed),
            "compiled" => Ok(CycleStatus::Compiled),
            other => Err(AppError::ValidationError(format!("unknown cycle status '{other}'"))),
        }
    }
}

/// One recurring submission window ("week").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: CycleId,
    pub opens_at: DateTime<Utc>,
    /// Submissions are accepted until the cycle is closed; the scheduler
    /// closes it once this instant passes.
    pub deadline: DateTime<Utc>,
    pub status: CycleStatus,
    pub created_at: DateTime<Utc>,
}

/// The three free-text answers extracted from a member's reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionFields {
    pub highlight: String,
    pub lowlight: String,
    pub recommendation: String,
}

/// A member's single entry for a cycle. Unique per (member, cycle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub member_id: Uuid,
    pub cycle_id: CycleId,
    pub fields: SubmissionFields,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    /// Always stored normalized, see [`normalize_email`].
    pub email: String,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    /// Lifetime count; never decremented, expired invitations included.
    pub invitations_sent: u32,
}

impl Member {
    pub fn new(email: &str, display_name: Option<String>, joined_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            email: normalize_email(email),
            display_name,
            is_active: true,
            joined_at,
            invitations_sent: 0,
        }
    }

    /// Name used when addressing others on this member's behalf.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}

/// Consecutive-participation record for one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streak {
    pub member_id: Uuid,
    pub current: u32,
    pub longest: u32,
    /// Last cycle the member submitted in.
    pub last_cycle: Option<CycleId>,
    /// Last cycle close this record was evaluated for. Guards against a
    /// second evaluation of the same close.
    pub last_evaluated_cycle: Option<CycleId>,
    pub invite_eligible: bool,
    pub eligible_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Streak {
    pub fn empty(member_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            member_id,
            current: 0,
            longest: 0,
            last_cycle: None,
            last_evaluated_cycle: None,
            invite_eligible: false,
            eligible_since: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Expired,
}

impl InvitationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvitationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvitationStatus::Pending),
            "accepted" => Ok(InvitationStatus::Accepted),
            "expired" => Ok(InvitationStatus::Expired),
            other => Err(AppError::ValidationError(format!(
                "unknown invitation status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Uuid,
    pub inviter_id: Uuid,
    pub invitee_email: String,
    /// Opaque, unguessable, unique.
    pub token: String,
    pub status: InvitationStatus,
    pub sent_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

impl Invitation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Fields an invitee supplies when accepting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_case_normalized() {
        assert_eq!(normalize_email("  Ada@Example.COM "), "ada@example.com");
        let member = Member::new("Ada@Example.com", None, Utc::now());
        assert_eq!(member.email, "ada@example.com");
        assert_eq!(member.display_name(), "ada@example.com");
        assert!(member.is_active);
    }

    #[test]
    fn cycle_status_only_moves_forward() {
        use CycleStatus::*;
        assert!(Open.can_advance_to(Closed));
        assert!(Closed.can_advance_to(Compiled));
        assert!(!Open.can_advance_to(Compiled));
        assert!(!Compiled.can_advance_to(Open));
        assert!(!Closed.can_advance_to(Open));
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [CycleStatus::Open, CycleStatus::Closed, CycleStatus::Compiled] {
            assert_eq!(status.as_str().parse::<CycleStatus>().unwrap(), status);
        }
        assert!("reopened".parse::<InvitationStatus>().is_err());
    }
}
