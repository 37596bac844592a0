//! # cohort-notify-log
//!
//! A `Notifier` that renders every outbound message and writes it to the
//! tracing pipeline instead of a mail transport. Used by the binary when no
//! real delivery channel is wired, and handy for dry runs.

use std::fmt::Write as _;

use async_trait::async_trait;
use cohort_core::models::{Cycle, Member, Submission};
use cohort_core::traits::Notifier;
use tracing::info;

/// Plain-text digest of one cycle, in submission order.
pub fn render_digest(members: &[Member], submissions: &[Submission], cycle: &Cycle) -> String {
    let mut out = format!("Cycle {} ({} entries)\n", cycle.id, submissions.len());
    for submission in submissions {
        let author = members
            .iter()
            .find(|m| m.id == submission.member_id)
            .map(Member::display_name)
            .unwrap_or("former member");
        let fields = &submission.fields;
        // Writing to a String cannot fail.
        let _ = write!(
            out,
            "\n## {author}\n+ {}\n- {}\n> {}\n",
            fields.highlight, fields.lowlight, fields.recommendation
        );
    }
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_window_open_notice(&self, members: &[Member], cycle: &Cycle) -> anyhow::Result<()> {
        info!(
            target: "cohort::outbox",
            cycle = %cycle.id,
            deadline = %cycle.deadline,
            recipients = members.len(),
            "window open notice"
        );
        Ok(())
    }

    async fn send_compilation_notice(
        &self,
        members: &[Member],
        submissions: &[Submission],
        cycle: &Cycle,
    ) -> anyhow::Result<()> {
        let digest = render_digest(members, submissions, cycle);
        info!(
            target: "cohort::outbox",
            cycle = %cycle.id,
            recipients = members.len(),
            %digest,
            "compilation notice"
        );
        Ok(())
    }

    async fn send_submission_ack(&self, member: &Member, submission: &Submission) -> anyhow::Result<()> {
        info!(
            target: "cohort::outbox",
            to = %member.email,
            cycle = %submission.cycle_id,
            "submission acknowledgement"
        );
        Ok(())
    }

    async fn send_invitation(
        &self,
        inviter_display_name: &str,
        invitee_email: &str,
        _token: &str,
    ) -> anyhow::Result<()> {
        // The token is a bearer credential; keep it out of the log.
        info!(
            target: "cohort::outbox",
            to = %invitee_email,
            from = %inviter_display_name,
            "invitation"
        );
        Ok(())
    }

    async fn send_eligibility_granted(&self, member: &Member, streak_count: u32) -> anyhow::Result<()> {
        info!(target: "cohort::outbox", to = %member.email, streak_count, "eligibility granted");
        Ok(())
    }
}
