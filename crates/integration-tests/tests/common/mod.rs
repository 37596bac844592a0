//! Fixtures shared by the integration test targets.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cohort_core::models::{Cycle, Member, Submission, SubmissionFields};
use cohort_core::traits::{ManualClock, Notifier, Store};
use cohort_db_sqlite::SqliteStore;
use cohort_engine::{Engine, EngineSettings, Ports};

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

pub fn answers(highlight: &str) -> SubmissionFields {
    SubmissionFields {
        highlight: highlight.into(),
        lowlight: "nothing".into(),
        recommendation: "rest".into(),
    }
}

/// Records every outbound message as a short line instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.sent().iter().filter(|line| line.starts_with(prefix)).count()
    }

    fn push(&self, line: String) {
        self.sent.lock().unwrap().push(line);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_window_open_notice(&self, members: &[Member], cycle: &Cycle) -> anyhow::Result<()> {
        self.push(format!("open {} to {}", cycle.id, members.len()));
        Ok(())
    }

    async fn send_compilation_notice(
        &self,
        members: &[Member],
        submissions: &[Submission],
        cycle: &Cycle,
    ) -> anyhow::Result<()> {
        self.push(format!("digest {} with {} to {}", cycle.id, submissions.len(), members.len()));
        Ok(())
    }

    async fn send_submission_ack(&self, member: &Member, submission: &Submission) -> anyhow::Result<()> {
        self.push(format!("ack {} {}", member.email, submission.cycle_id));
        Ok(())
    }

    async fn send_invitation(
        &self,
        inviter_display_name: &str,
        invitee_email: &str,
        token: &str,
    ) -> anyhow::Result<()> {
        self.push(format!("invite {invitee_email} from {inviter_display_name} token {token}"));
        Ok(())
    }

    async fn send_eligibility_granted(&self, member: &Member, streak_count: u32) -> anyhow::Result<()> {
        self.push(format!("eligible {} at {streak_count}", member.email));
        Ok(())
    }
}

pub struct World {
    pub engine: Engine,
    pub store: Arc<dyn Store>,
    pub clock: Arc<ManualClock>,
    pub outbox: Arc<RecordingNotifier>,
}

impl World {
    /// A fresh in-memory SQLite database, clock at Monday 2024-01-01 10:00 UTC.
    pub async fn sqlite() -> Self {
        Self::with(Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap()), EngineSettings::default())
    }

    pub fn with(store: Arc<dyn Store>, settings: EngineSettings) -> Self {
        let clock = Arc::new(ManualClock::new(at(2024, 1, 1, 10)));
        let outbox = Arc::new(RecordingNotifier::default());
        let ports = Ports {
            store: store.clone(),
            notifier: outbox.clone(),
            clock: clock.clone(),
        };
        Self {
            engine: Engine::new(ports, settings),
            store,
            clock,
            outbox,
        }
    }

    /// Runs one full week: open, let `submitters` reply, close.
    pub async fn week(&self, submitters: &[&Member]) {
        self.engine.cycles.open_cycle().await.unwrap();
        for member in submitters {
            self.engine
                .cycles
                .accept_submission(member, answers("progress"))
                .await
                .unwrap();
        }
        self.engine.cycles.close_cycle().await.unwrap();
        self.clock.advance(chrono::Duration::days(7));
    }
}
