//! Dispatch of already-parsed inbound messages.

use cohort_core::error::Result;
use cohort_core::models::{Invitation, Submission, SubmissionFields};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::Engine;

/// What the external parser extracted from one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum InboundCommand {
    Submission { sender_email: String, fields: SubmissionFields },
    Invite { sender_email: String, invitee_email: String },
}

impl InboundCommand {
    pub fn sender_email(&self) -> &str {
        match self {
            InboundCommand::Submission { sender_email, .. }
            | InboundCommand::Invite { sender_email, .. } => sender_email,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum InboundResult {
    Submitted(Submission),
    Invited(Invitation),
}

impl Engine {
    #[instrument(skip_all, fields(sender = %command.sender_email()))]
    pub async fn handle_inbound(&self, command: InboundCommand) -> Result<InboundResult> {
        let sender = self.members.resolve_sender(command.sender_email()).await?;
        match command {
            InboundCommand::Submission { fields, .. } => self
                .cycles
                .accept_submission(&sender, fields)
                .await
                .map(InboundResult::Submitted),
            InboundCommand::Invite { invitee_email, .. } => self
                .invitations
                .send_invitation(&sender, &invitee_email)
                .await
                .map(InboundResult::Invited),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{fields, quiet_notifier, Harness};
    use cohort_core::error::AppError;
    use cohort_core::traits::MockNotifier;

    #[tokio::test]
    async fn submission_is_routed_and_acknowledged() {
        let mut notifier = MockNotifier::new();
        notifier.expect_send_window_open_notice().returning(|_, _| Ok(()));
        notifier
            .expect_send_submission_ack()
            .withf(|member, submission| {
                member.email == "ada@example.com" && submission.fields.highlight == "shipped"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let h = Harness::new(notifier);
        h.member("ada@example.com").await;
        h.engine.cycles.open_cycle().await.unwrap();

        let result = h
            .engine
            .handle_inbound(InboundCommand::Submission {
                sender_email: "ADA@example.com".into(),
                fields: fields("shipped"),
            })
            .await
            .unwrap();
        assert!(matches!(result, InboundResult::Submitted(s) if s.cycle_id.raw() == 202401));
    }

    #[tokio::test]
    async fn invite_is_routed_to_the_invitation_flow() {
        let h = Harness::new(quiet_notifier());
        let ada = h.member("ada@example.com").await;
        h.seed_streak(&ada, 4, true).await;

        let result = h
            .engine
            .handle_inbound(InboundCommand::Invite {
                sender_email: "ada@example.com".into(),
                invitee_email: "friend@example.com".into(),
            })
            .await
            .unwrap();
        assert!(matches!(result, InboundResult::Invited(i) if i.inviter_id == ada.id));
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected() {
        let h = Harness::new(quiet_notifier());
        let err = h
            .engine
            .handle_inbound(InboundCommand::Invite {
                sender_email: "ghost@example.com".into(),
                invitee_email: "friend@example.com".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(..)));
    }

    #[test]
    fn commands_deserialize_from_the_parser_shape() {
        let raw = r#"{"command":"invite","sender_email":"a@b.io","invitee_email":"c@d.io"}"#;
        let command: InboundCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(command.sender_email(), "a@b.io");
    }
}
