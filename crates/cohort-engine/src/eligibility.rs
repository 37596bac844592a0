//! # Eligibility & Invitation Lifecycle
//!
//! Invite permission is derived from streak and invitation usage, never
//! stored as a hand-set flag. Invitations move `pending -> accepted` once,
//! or `pending -> expired` when their time runs out; nothing reopens them.

use std::fmt;

use base64::Engine as _;
use cohort_core::error::{AppError, Result, StoreError};
use cohort_core::models::{
    normalize_email, Invitation, InvitationStatus, Member, ProfileFields, Streak,
};
use cohort_core::traits::{constraint, InvitationRepo, MemberRepo, StreakRepo};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::notify::deliver;
use crate::streak::{EligibilityChange, StreakTracker};
use crate::Ports;

/// Why a member may not invite. Checks fail closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum IneligibleReason {
    Inactive,
    NoStreak,
    StreakTooShort { current: u32, threshold: u32 },
    CapReached { sent: u32, cap: u32 },
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::Inactive => f.write_str("member is not active"),
            IneligibleReason::NoStreak => f.write_str("member has no streak yet"),
            IneligibleReason::StreakTooShort { current, threshold } => {
                write!(f, "streak {current} is below the required {threshold}")
            }
            IneligibleReason::CapReached { sent, cap } => {
                write!(f, "{sent} of {cap} invitations already used")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<IneligibleReason>,
    pub remaining_invites: u32,
}

/// Result of a successful acceptance; the caller sends the welcome.
#[derive(Debug, Clone, Serialize)]
pub struct Acceptance {
    pub member: Member,
    pub inviter: Option<Member>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub granted: usize,
    pub revoked: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    pub expired: usize,
    pub failed: usize,
}

/// 256 bits from the thread-local CSPRNG, URL-safe base64.
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn refused(inviter: &Member, reason: IneligibleReason) -> AppError {
    AppError::ValidationError(format!("{} may not invite: {reason}", inviter.email))
}

/// Shallow shape check; address validation proper belongs to the parser.
pub(crate) fn validate_email(raw: &str) -> Result<String> {
    let email = normalize_email(raw);
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace) =>
        {
            Ok(email)
        }
        _ => Err(AppError::ValidationError(format!("'{raw}' is not an email address"))),
    }
}

#[derive(Clone)]
pub struct InvitationService {
    ports: Ports,
    streaks: StreakTracker,
}

impl InvitationService {
    pub fn new(ports: Ports, streaks: StreakTracker) -> Self {
        Self { ports, streaks }
    }

    /// `checkEligibility(member)`.
    pub async fn check_eligibility(&self, member: &Member) -> Result<Eligibility> {
        let streak = self.ports.store.get_streak(member.id).await?;
        Ok(self.evaluate(member, streak.as_ref()))
    }

    fn evaluate(&self, member: &Member, streak: Option<&Streak>) -> Eligibility {
        let rules = self.streaks.rules();
        let reason = if !member.is_active {
            Some(IneligibleReason::Inactive)
        } else if let Some(streak) = streak {
            if streak.current < rules.streak_threshold {
                Some(IneligibleReason::StreakTooShort {
                    current: streak.current,
                    threshold: rules.streak_threshold,
                })
            } else if member.invitations_sent >= rules.invitation_cap {
                Some(IneligibleReason::CapReached {
                    sent: member.invitations_sent,
                    cap: rules.invitation_cap,
                })
            } else {
                None
            }
        } else {
            Some(IneligibleReason::NoStreak)
        };

        Eligibility {
            eligible: reason.is_none(),
            remaining_invites: if reason.is_none() {
                rules.remaining_invites(member.invitations_sent)
            } else {
                0
            },
            reason,
        }
    }

    /// `sendInvitation(inviter, inviteeEmail)`.
    #[instrument(skip_all, fields(inviter = %inviter.email))]
    pub async fn send_invitation(&self, inviter: &Member, invitee_email: &str) -> Result<Invitation> {
        let store = &self.ports.store;
        // Never trust the caller's copy; the counter may have moved.
        let inviter = store
            .get_member(inviter.id)
            .await?
            .ok_or_else(|| AppError::NotFound("member".into(), inviter.email.clone()))?;

        let eligibility = self.check_eligibility(&inviter).await?;
        if let Some(reason) = eligibility.reason {
            return Err(refused(&inviter, reason));
        }

        let email = validate_email(invitee_email)?;
        if store.find_member_by_email(&email).await?.is_some() {
            return Err(AppError::AlreadyMember(email));
        }

        let now = self.ports.clock.now();
        if let Some(existing) = store.find_pending_invitation(&email).await? {
            if !existing.is_expired_at(now) {
                return Err(AppError::DuplicatePendingInvite(email));
            }
            // Lapsed but not yet swept; retire it so the new one can be issued.
            store
                .transition_invitation(existing.id, InvitationStatus::Pending, InvitationStatus::Expired, now)
                .await?;
        }

        let rules = self.streaks.rules();
        let invitation = Invitation {
            id: Uuid::now_v7(),
            inviter_id: inviter.id,
            invitee_email: email.clone(),
            token: generate_token(),
            status: InvitationStatus::Pending,
            sent_at: now,
            expires_at: now + rules.invitation_ttl(),
            accepted_at: None,
        };
        // The store re-checks the cap while taking the slot; the check above
        // may have raced with another send from the same inviter.
        let sent = store
            .issue_invitation(invitation.clone(), rules.invitation_cap)
            .await
            .map_err(|err| match err {
                StoreError::Conflict(c) if c == constraint::PENDING_INVITEE => {
                    AppError::DuplicatePendingInvite(email.clone())
                }
                other => other.into(),
            })?
            .ok_or_else(|| {
                let cap = rules.invitation_cap;
                refused(&inviter, IneligibleReason::CapReached { sent: cap, cap })
            })?;

        let inviter = Member { invitations_sent: sent, ..inviter };
        if let Err(err) = self.streaks.refresh_eligibility(&inviter).await {
            warn!(error = %err, "eligibility refresh after invitation failed; sweep will reconcile");
        }

        info!(invitee = %email, expires_at = %invitation.expires_at, sent, "invitation issued");
        deliver(
            "invitation",
            self.ports
                .notifier
                .send_invitation(inviter.display_name(), &email, &invitation.token),
        )
        .await;
        Ok(invitation)
    }

    /// `acceptInvitation(token, profileFields)`.
    #[instrument(skip_all)]
    pub async fn accept_invitation(&self, token: &str, profile: ProfileFields) -> Result<Acceptance> {
        let store = &self.ports.store;
        let invitation = store
            .find_invitation_by_token(token)
            .await?
            .ok_or_else(|| AppError::NotFound("invitation".into(), "token".into()))?;

        if invitation.status != InvitationStatus::Pending {
            return Err(AppError::AlreadyProcessed(format!(
                "invitation for {} is {}",
                invitation.invitee_email, invitation.status
            )));
        }

        let now = self.ports.clock.now();
        if invitation.is_expired_at(now) {
            store
                .transition_invitation(invitation.id, InvitationStatus::Pending, InvitationStatus::Expired, now)
                .await?;
            return Err(AppError::Expired(format!(
                "invitation for {} expired at {}",
                invitation.invitee_email, invitation.expires_at
            )));
        }

        let already_member = || AppError::AlreadyMember(invitation.invitee_email.clone());
        if store.find_member_by_email(&invitation.invitee_email).await?.is_some() {
            store
                .transition_invitation(invitation.id, InvitationStatus::Pending, InvitationStatus::Accepted, now)
                .await?;
            return Err(already_member());
        }

        let member = Member::new(&invitation.invitee_email, profile.display_name, now);
        let redeemed = store
            .redeem_invitation(invitation.id, member.clone(), Streak::empty(member.id, now), now)
            .await;
        match redeemed {
            Ok(true) => {}
            Ok(false) => {
                debug!("invitation was settled concurrently");
                return Err(AppError::AlreadyProcessed(format!(
                    "invitation for {} was settled concurrently",
                    invitation.invitee_email
                )));
            }
            Err(StoreError::Conflict(c)) if c == constraint::MEMBER_EMAIL => {
                // Joined by another route between the lookup and the redeem.
                store
                    .transition_invitation(invitation.id, InvitationStatus::Pending, InvitationStatus::Accepted, now)
                    .await?;
                return Err(already_member());
            }
            Err(other) => return Err(other.into()),
        }

        let inviter = store.get_member(invitation.inviter_id).await?;
        info!(member = %member.email, "invitation accepted");
        Ok(Acceptance { member, inviter })
    }

    /// `sweepEligibility()`: reconciles every active member's flag with the
    /// pure rule. Per-member failures are counted, not propagated.
    #[instrument(skip_all)]
    pub async fn sweep_eligibility(&self) -> Result<SweepReport> {
        let members = self.ports.store.list_active_members().await?;
        let mut report = SweepReport::default();
        for member in &members {
            report.checked += 1;
            match self.streaks.refresh_eligibility(member).await {
                Ok(EligibilityChange::Granted) => report.granted += 1,
                Ok(EligibilityChange::Revoked) => report.revoked += 1,
                Ok(EligibilityChange::Unchanged) => {}
                Err(err) => {
                    warn!(member = %member.email, error = %err, "eligibility sweep failed for member");
                    report.failed += 1;
                }
            }
        }
        if report.granted + report.revoked > 0 {
            info!(granted = report.granted, revoked = report.revoked, "eligibility drift corrected");
        }
        Ok(report)
    }

    /// `sweepExpiredInvitations()`.
    #[instrument(skip_all)]
    pub async fn sweep_expired_invitations(&self) -> Result<ExpiryReport> {
        let now = self.ports.clock.now();
        let lapsed = self.ports.store.list_expired_pending(now).await?;
        let mut report = ExpiryReport::default();
        for invitation in &lapsed {
            match self
                .ports
                .store
                .transition_invitation(invitation.id, InvitationStatus::Pending, InvitationStatus::Expired, now)
                .await
            {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(invitation = %invitation.id, error = %err, "failed to expire invitation");
                    report.failed += 1;
                }
            }
        }
        if report.expired > 0 {
            info!(expired = report.expired, "expired pending invitations");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{quiet_notifier, Harness};
    use chrono::Duration;
    use cohort_core::traits::MockNotifier;

    #[tokio::test]
    async fn eligibility_fails_closed() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        let inv = &h.engine.invitations;

        let check = inv.check_eligibility(&ada).await.unwrap();
        assert_eq!(check.reason, Some(IneligibleReason::NoStreak));

        h.seed_streak(&ada, 3, false).await;
        let check = inv.check_eligibility(&ada).await.unwrap();
        assert!(matches!(check.reason, Some(IneligibleReason::StreakTooShort { current: 3, .. })));

        h.seed_streak(&ada, 4, true).await;
        let check = inv.check_eligibility(&ada).await.unwrap();
        assert!(check.eligible);
        assert_eq!(check.remaining_invites, 5);

        let inactive = Member { is_active: false, ..ada };
        let check = inv.check_eligibility(&inactive).await.unwrap();
        assert_eq!(check.reason, Some(IneligibleReason::Inactive));
    }

    #[tokio::test]
    async fn cap_blocks_regardless_of_streak() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        h.seed_streak(&ada, 40, true).await;
        let capped = Member { invitations_sent: 5, ..ada };

        let check = h.engine.invitations.check_eligibility(&capped).await.unwrap();
        assert!(!check.eligible);
        assert_eq!(check.reason, Some(IneligibleReason::CapReached { sent: 5, cap: 5 }));
        assert_eq!(check.remaining_invites, 0);
    }

    #[tokio::test]
    async fn send_creates_a_pending_invitation_for_seven_days() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_invitation()
            .withf(|inviter, invitee, token| {
                inviter == "Ada" && invitee == "new@example.com" && token.len() == 43
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let h = Harness::new(notifier);
        let ada = h.named_member("ada@example.com", "Ada").await;
        h.seed_streak(&ada, 4, true).await;

        let invitation = h
            .engine
            .invitations
            .send_invitation(&ada, " New@Example.com ")
            .await
            .unwrap();
        assert_eq!(invitation.status, InvitationStatus::Pending);
        assert_eq!(invitation.invitee_email, "new@example.com");
        assert_eq!(invitation.expires_at, invitation.sent_at + Duration::days(7));

        let ada = h.store.get_member(ada.id).await.unwrap().unwrap();
        assert_eq!(ada.invitations_sent, 1);
    }

    #[tokio::test]
    async fn send_rejects_members_duplicates_and_ineligible_inviters() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        let grace = h.member("grace@example.com").await;
        let inv = &h.engine.invitations;

        let err = inv.send_invitation(&ada, "new@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        h.seed_streak(&ada, 4, true).await;
        let err = inv.send_invitation(&ada, "GRACE@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyMember(_)));

        inv.send_invitation(&ada, "new@example.com").await.unwrap();
        h.seed_streak(&grace, 4, true).await;
        let err = inv.send_invitation(&grace, "new@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::DuplicatePendingInvite(_)));

        let err = inv.send_invitation(&ada, "not-an-address").await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn lapsed_pending_invitation_does_not_block_a_new_one() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        h.seed_streak(&ada, 4, true).await;
        let inv = &h.engine.invitations;

        let first = inv.send_invitation(&ada, "new@example.com").await.unwrap();
        h.clock.advance(Duration::days(8));
        let second = inv.send_invitation(&ada, "new@example.com").await.unwrap();
        assert_ne!(first.token, second.token);

        let first = h.store.find_invitation_by_token(&first.token).await.unwrap().unwrap();
        assert_eq!(first.status, InvitationStatus::Expired);
    }

    #[tokio::test]
    async fn accepting_after_expiry_fails_and_marks_expired() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        h.seed_streak(&ada, 4, true).await;
        let invitation = h.engine.invitations.send_invitation(&ada, "new@example.com").await.unwrap();

        h.clock.set(invitation.expires_at + Duration::seconds(1));
        let err = h
            .engine
            .invitations
            .accept_invitation(&invitation.token, ProfileFields::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));

        let stored = h.store.find_invitation_by_token(&invitation.token).await.unwrap().unwrap();
        assert_eq!(stored.status, InvitationStatus::Expired);
        assert!(h.store.find_member_by_email("new@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acceptance_creates_an_active_member_once() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        h.seed_streak(&ada, 4, true).await;
        let invitation = h.engine.invitations.send_invitation(&ada, "new@example.com").await.unwrap();

        let accepted = h
            .engine
            .invitations
            .accept_invitation(
                &invitation.token,
                ProfileFields { display_name: Some("Newcomer".into()) },
            )
            .await
            .unwrap();
        assert!(accepted.member.is_active);
        assert_eq!(accepted.member.display_name.as_deref(), Some("Newcomer"));
        assert_eq!(accepted.inviter.map(|m| m.id), Some(ada.id));

        let streak = h.store.get_streak(accepted.member.id).await.unwrap().unwrap();
        assert_eq!(streak.current, 0);

        let stored = h.store.find_invitation_by_token(&invitation.token).await.unwrap().unwrap();
        assert_eq!(stored.status, InvitationStatus::Accepted);
        assert!(stored.accepted_at.is_some());

        let err = h
            .engine
            .invitations
            .accept_invitation(&invitation.token, ProfileFields::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyProcessed(_)));
    }

    #[tokio::test]
    async fn invitee_who_joined_meanwhile_is_not_duplicated() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        h.seed_streak(&ada, 4, true).await;
        let invitation = h.engine.invitations.send_invitation(&ada, "new@example.com").await.unwrap();
        h.member("new@example.com").await;

        let err = h
            .engine
            .invitations
            .accept_invitation(&invitation.token, ProfileFields::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyMember(_)));
        let stored = h.store.find_invitation_by_token(&invitation.token).await.unwrap().unwrap();
        assert_eq!(stored.status, InvitationStatus::Accepted);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let h = Harness::new(quiet_notifier());
        let err = h
            .engine
            .invitations
            .accept_invitation("nope", ProfileFields::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(..)));
    }

    #[tokio::test]
    async fn using_the_last_invite_revokes_the_flag() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        h.seed_streak(&ada, 4, true).await;
        for n in 0..5 {
            h.engine
                .invitations
                .send_invitation(&ada, &format!("friend{n}@example.com"))
                .await
                .unwrap();
        }
        let streak = h.store.get_streak(ada.id).await.unwrap().unwrap();
        assert!(!streak.invite_eligible);
        let err = h
            .engine
            .invitations
            .send_invitation(&ada, "one-more@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn sweep_corrects_drift_and_notifies_grants() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_eligibility_granted()
            .times(1)
            .returning(|_, _| Ok(()));
        let h = Harness::new(notifier);
        let ada = h.member("ada@example.com").await;
        let grace = h.member("grace@example.com").await;
        h.member("linus@example.com").await;
        // Drifted in both directions.
        h.seed_streak(&ada, 5, false).await;
        h.seed_streak(&grace, 1, true).await;

        let report = h.engine.invitations.sweep_eligibility().await.unwrap();
        assert_eq!(
            report,
            SweepReport { checked: 3, granted: 1, revoked: 1, failed: 0 }
        );
        assert!(h.store.get_streak(ada.id).await.unwrap().unwrap().invite_eligible);
        assert!(!h.store.get_streak(grace.id).await.unwrap().unwrap().invite_eligible);

        let again = h.engine.invitations.sweep_eligibility().await.unwrap();
        assert_eq!(again.granted + again.revoked, 0);
    }

    #[tokio::test]
    async fn eligibility_sweep_counts_a_failing_member_and_carries_on() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        let grace = h.member("grace@example.com").await;
        let linus = h.member("linus@example.com").await;
        h.seed_streak(&ada, 5, false).await;
        h.seed_streak(&grace, 6, false).await;
        h.seed_streak(&linus, 1, true).await;
        h.faults.break_on(grace.id);

        let report = h.engine.invitations.sweep_eligibility().await.unwrap();
        assert_eq!(
            report,
            SweepReport { checked: 3, granted: 1, revoked: 1, failed: 1 }
        );
        assert!(h.store.get_streak(ada.id).await.unwrap().unwrap().invite_eligible);
        assert!(!h.store.get_streak(grace.id).await.unwrap().unwrap().invite_eligible);
        assert!(!h.store.get_streak(linus.id).await.unwrap().unwrap().invite_eligible);
    }

    #[tokio::test]
    async fn expiry_sweep_counts_a_failing_invitation_and_carries_on() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        h.seed_streak(&ada, 4, true).await;
        let inv = &h.engine.invitations;
        let mut sent = Vec::new();
        for email in ["bob@example.com", "cy@example.com", "dee@example.com"] {
            sent.push(inv.send_invitation(&ada, email).await.unwrap());
        }
        h.faults.break_on(sent[1].id);
        h.clock.advance(Duration::days(8));

        let report = inv.sweep_expired_invitations().await.unwrap();
        assert_eq!(report, ExpiryReport { expired: 2, failed: 1 });
        let expected = [InvitationStatus::Expired, InvitationStatus::Pending, InvitationStatus::Expired];
        for (invitation, status) in sent.iter().zip(expected) {
            let stored = h.store.find_invitation_by_token(&invitation.token).await.unwrap().unwrap();
            assert_eq!(stored.status, status, "{}", invitation.invitee_email);
        }
    }

    #[tokio::test]
    async fn expiry_sweep_only_touches_lapsed_pending_invitations() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        h.seed_streak(&ada, 4, true).await;
        let inv = &h.engine.invitations;
        let old = inv.send_invitation(&ada, "old@example.com").await.unwrap();
        h.clock.advance(Duration::days(5));
        let fresh = inv.send_invitation(&ada, "fresh@example.com").await.unwrap();
        h.clock.advance(Duration::days(3));

        let report = inv.sweep_expired_invitations().await.unwrap();
        assert_eq!(report, ExpiryReport { expired: 1, failed: 0 });
        let old = h.store.find_invitation_by_token(&old.token).await.unwrap().unwrap();
        let fresh = h.store.find_invitation_by_token(&fresh.token).await.unwrap().unwrap();
        assert_eq!(old.status, InvitationStatus::Expired);
        assert_eq!(fresh.status, InvitationStatus::Pending);
    }

    #[test]
    fn tokens_are_url_safe_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn email_shape_is_checked() {
        assert_eq!(validate_email(" A@B.io ").unwrap(), "a@b.io");
        assert!(validate_email("@b.io").is_err());
        assert!(validate_email("a@localhost").is_err());
        assert!(validate_email("a b@c.io").is_err());
    }
}
