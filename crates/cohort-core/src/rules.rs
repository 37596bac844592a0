//! Invitation eligibility rules.
//!
//! Eligibility is a pure function of streak length and invitation usage;
//! nothing else may set or clear the flag.

use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityRules {
    /// Consecutive cycles required before a member may invite.
    pub streak_threshold: u32,
    /// Lifetime invitations a member may send.
    pub invitation_cap: u32,
    pub invitation_expiry_days: i64,
}

impl Default for EligibilityRules {
    fn default() -> Self {
        Self {
            streak_threshold: 4,
            invitation_cap: 5,
            invitation_expiry_days: 7,
        }
    }
}

impl EligibilityRules {
    pub fn is_eligible(&self, current_streak: u32, invitations_sent: u32) -> bool {
        current_streak >= self.streak_threshold && invitations_sent < self.invitation_cap
    }

    pub fn remaining_invites(&self, invitations_sent: u32) -> u32 {
        self.invitation_cap.saturating_sub(invitations_sent)
    }

    pub fn invitation_ttl(&self) -> Duration {
        Duration::days(self.invitation_expiry_days)
    }
}
