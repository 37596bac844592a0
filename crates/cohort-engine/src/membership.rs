//! Membership administration: founding members, activation, and sender
//! lookup for inbound messages.

use cohort_core::error::{AppError, Result, StoreError};
use cohort_core::models::{normalize_email, Member, Streak};
use cohort_core::traits::MemberRepo;
use tracing::{info, instrument};

use crate::eligibility::validate_email;
use crate::Ports;

#[derive(Clone)]
pub struct MembershipService {
    ports: Ports,
}

impl MembershipService {
    pub fn new(ports: Ports) -> Self {
        Self { ports }
    }

    /// Seeds a member directly, outside the invitation flow. Starts active
    /// with a zero streak.
    #[instrument(skip(self))]
    pub async fn register_member(&self, email: &str, display_name: Option<String>) -> Result<Member> {
        let email = validate_email(email)?;
        let store = &self.ports.store;
        if store.find_member_by_email(&email).await?.is_some() {
            return Err(AppError::AlreadyMember(email));
        }

        let now = self.ports.clock.now();
        let member = Member::new(&email, display_name, now);
        store
            .enroll_member(member.clone(), Streak::empty(member.id, now))
            .await
            .map_err(|err| match err {
                StoreError::Conflict(_) => AppError::AlreadyMember(email.clone()),
                other => other.into(),
            })?;

        info!(member = %member.email, "member registered");
        Ok(member)
    }

    #[instrument(skip(self))]
    pub async fn set_member_active(&self, email: &str, active: bool) -> Result<Member> {
        let member = self.find(email).await?;
        if member.is_active == active {
            return Ok(member);
        }
        if !self.ports.store.set_member_active(member.id, active).await? {
            return Err(AppError::NotFound("member".into(), member.email));
        }
        info!(member = %member.email, active, "member activation changed");
        Ok(Member { is_active: active, ..member })
    }

    /// Maps an inbound sender address to an active member.
    pub async fn resolve_sender(&self, sender_email: &str) -> Result<Member> {
        let member = self.find(sender_email).await?;
        if !member.is_active {
            return Err(AppError::ValidationError(format!("{} is not active", member.email)));
        }
        Ok(member)
    }

    async fn find(&self, email: &str) -> Result<Member> {
        let email = normalize_email(email);
        self.ports
            .store
            .find_member_by_email(&email)
            .await?
            .ok_or_else(|| AppError::NotFound("member".into(), email.clone()))
    }
}
