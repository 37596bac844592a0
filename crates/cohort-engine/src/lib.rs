//! cohort/crates/cohort-engine/src/lib.rs
//!
//! Business logic of the weekly cohort: cycle state machine, streaks,
//! invite eligibility, and the triggers that drive them. Everything here
//! talks to the outside world through the ports in `cohort-core`.

use std::sync::Arc;

use cohort_core::traits::{Clock, Notifier, Store};
use cohort_core::{CycleSchedule, EligibilityRules};

pub mod cycle;
pub mod eligibility;
pub mod inbound;
pub mod membership;
pub mod outcome;
pub mod retention;
pub mod scheduler;
pub mod streak;

mod notify;
#[cfg(test)]
mod testkit;

pub use cycle::{CompiledCycle, CycleManager, OpenedCycle};
pub use eligibility::{Acceptance, Eligibility, IneligibleReason, InvitationService};
pub use inbound::{InboundCommand, InboundResult};
pub use membership::MembershipService;
pub use outcome::Outcome;
pub use retention::RetentionService;
pub use scheduler::{Scheduler, SchedulerConfig, Trigger};
pub use streak::{StreakResult, StreakTracker};

/// The adapters one engine instance runs against.
#[derive(Clone)]
pub struct Ports {
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineSettings {
    pub schedule: CycleSchedule,
    pub rules: EligibilityRules,
}

/// All services wired over one set of ports.
#[derive(Clone)]
pub struct Engine {
    ports: Ports,
    pub cycles: CycleManager,
    pub streaks: StreakTracker,
    pub invitations: InvitationService,
    pub members: MembershipService,
    pub retention: RetentionService,
}

impl Engine {
    pub fn new(ports: Ports, settings: EngineSettings) -> Self {
        let streaks = StreakTracker::new(ports.clone(), settings.rules);
        Self {
            cycles: CycleManager::new(ports.clone(), settings.schedule, streaks.clone()),
            invitations: InvitationService::new(ports.clone(), streaks.clone()),
            members: MembershipService::new(ports.clone()),
            retention: RetentionService::new(ports.clone()),
            streaks,
            ports,
        }
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }
}
