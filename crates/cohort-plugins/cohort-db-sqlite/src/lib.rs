//! # cohort-db-sqlite Implementation
//!
//! Maps the SQLite relational model onto the `cohort-core` domain models.
//! Unique indexes in `migrations/0001_init.sql` back every duplicate guard
//! the engine relies on; violations surface as `StoreError::Conflict`
//! carrying the matching `constraint` name. Operations that touch more than
//! one row run in a single transaction.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cohort_core::error::{StoreError, StoreResult};
use cohort_core::models::{
    Cycle, CycleStatus, Invitation, InvitationStatus, Member, Streak, Submission, SubmissionFields,
};
use cohort_core::traits::{
    constraint, CycleRepo, InvitationRepo, MemberRepo, StreakRepo, SubmissionRepo,
};
use cohort_core::CycleId;
use sqlx::sqlite::{SqliteConnectOptions, SqliteExecutor, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url` and applies the schema.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to `:memory:` is its own database; pin a single one.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new().max_connections(5).connect_with(options).await?
        };

        let store = Self { pool };
        store.migrate().await?;
        info!("sqlite store ready");
        Ok(store)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Translates unique violations into the port's `Conflict`; everything
/// else is a backend failure.
fn db_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            let message = db.message();
            let name = [
                ("cycles.status", constraint::SINGLE_OPEN_CYCLE),
                ("cycles.id", constraint::CYCLE_ID),
                ("members.email", constraint::MEMBER_EMAIL),
                ("submissions.member_id", constraint::SUBMISSION_MEMBER_CYCLE),
                ("invitations.token", constraint::INVITATION_TOKEN),
                ("invitations.invitee_email", constraint::PENDING_INVITEE),
            ]
            .into_iter()
            .find(|(column, _)| message.contains(column))
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| message.to_string());
            debug!(constraint = %name, "unique constraint rejected write");
            return StoreError::Conflict(name);
        }
    }
    StoreError::Backend(err.into())
}

// Helpers for column conversion
fn uuid_to_blob(id: Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

fn get_uuid(row: &SqliteRow, column: &str) -> anyhow::Result<Uuid> {
    let blob: Vec<u8> = row.try_get(column)?;
    Ok(Uuid::from_slice(&blob)?)
}

fn to_cycle_id(raw: i64) -> anyhow::Result<CycleId> {
    Ok(CycleId::try_from(u32::try_from(raw)?)?)
}

fn get_cycle_id(row: &SqliteRow, column: &str) -> anyhow::Result<CycleId> {
    to_cycle_id(row.try_get(column)?)
}

fn get_opt_cycle_id(row: &SqliteRow, column: &str) -> anyhow::Result<Option<CycleId>> {
    row.try_get::<Option<i64>, _>(column)?.map(to_cycle_id).transpose()
}

fn get_u32(row: &SqliteRow, column: &str) -> anyhow::Result<u32> {
    Ok(u32::try_from(row.try_get::<i64, _>(column)?)?)
}

fn map_cycle(row: &SqliteRow) -> anyhow::Result<Cycle> {
    Ok(Cycle {
        id: get_cycle_id(row, "id")?,
        opens_at: row.try_get("opens_at")?,
        deadline: row.try_get("deadline")?,
        status: CycleStatus::from_str(row.try_get("status")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_member(row: &SqliteRow) -> anyhow::Result<Member> {
    Ok(Member {
        id: get_uuid(row, "id")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        is_active: row.try_get("is_active")?,
        joined_at: row.try_get("joined_at")?,
        invitations_sent: get_u32(row, "invitations_sent")?,
    })
}

fn map_submission(row: &SqliteRow) -> anyhow::Result<Submission> {
    Ok(Submission {
        id: get_uuid(row, "id")?,
        member_id: get_uuid(row, "member_id")?,
        cycle_id: get_cycle_id(row, "cycle_id")?,
        fields: SubmissionFields {
            highlight: row.try_get("highlight")?,
            lowlight: row.try_get("lowlight")?,
            recommendation: row.try_get("recommendation")?,
        },
        submitted_at: row.try_get("submitted_at")?,
    })
}

fn map_streak(row: &SqliteRow) -> anyhow::Result<Streak> {
    Ok(Streak {
        member_id: get_uuid(row, "member_id")?,
        current: get_u32(row, "current")?,
        longest: get_u32(row, "longest")?,
        last_cycle: get_opt_cycle_id(row, "last_cycle")?,
        last_evaluated_cycle: get_opt_cycle_id(row, "last_evaluated_cycle")?,
        invite_eligible: row.try_get("invite_eligible")?,
        eligible_since: row.try_get("eligible_since")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_invitation(row: &SqliteRow) -> anyhow::Result<Invitation> {
    Ok(Invitation {
        id: get_uuid(row, "id")?,
        inviter_id: get_uuid(row, "inviter_id")?,
        invitee_email: row.try_get("invitee_email")?,
        token: row.try_get("token")?,
        status: InvitationStatus::from_str(row.try_get("status")?)?,
        sent_at: row.try_get("sent_at")?,
        expires_at: row.try_get("expires_at")?,
        accepted_at: row.try_get("accepted_at")?,
    })
}

fn map_all<T>(rows: Vec<SqliteRow>, map: fn(&SqliteRow) -> anyhow::Result<T>) -> StoreResult<Vec<T>> {
    Ok(rows.iter().map(map).collect::<anyhow::Result<Vec<T>>>()?)
}

const CYCLE_COLUMNS: &str = "id, opens_at, deadline, status, created_at";
const MEMBER_COLUMNS: &str = "id, email, display_name, is_active, joined_at, invitations_sent";
const SUBMISSION_COLUMNS: &str =
    "id, member_id, cycle_id, highlight, lowlight, recommendation, submitted_at";
const INVITATION_COLUMNS: &str =
    "id, inviter_id, invitee_email, token, status, sent_at, expires_at, accepted_at";

// Row writers shared by the single-row methods and the transactional ones.
async fn insert_member_row<'c, E: SqliteExecutor<'c>>(executor: E, member: Member) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO members (id, email, display_name, is_active, joined_at, invitations_sent) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(uuid_to_blob(member.id))
    .bind(member.email)
    .bind(member.display_name)
    .bind(member.is_active)
    .bind(member.joined_at)
    .bind(i64::from(member.invitations_sent))
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_streak_row<'c, E: SqliteExecutor<'c>>(executor: E, streak: Streak) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO streaks (member_id, current, longest, last_cycle, last_evaluated_cycle, \
         invite_eligible, eligible_since, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (member_id) DO UPDATE SET \
         current = excluded.current, longest = excluded.longest, \
         last_cycle = excluded.last_cycle, last_evaluated_cycle = excluded.last_evaluated_cycle, \
         invite_eligible = excluded.invite_eligible, eligible_since = excluded.eligible_since, \
         updated_at = excluded.updated_at",
    )
    .bind(uuid_to_blob(streak.member_id))
    .bind(i64::from(streak.current))
    .bind(i64::from(streak.longest))
    .bind(streak.last_cycle.map(|c| i64::from(c.raw())))
    .bind(streak.last_evaluated_cycle.map(|c| i64::from(c.raw())))
    .bind(streak.invite_eligible)
    .bind(streak.eligible_since)
    .bind(streak.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_invitation_row<'c, E: SqliteExecutor<'c>>(
    executor: E,
    invitation: Invitation,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO invitations \
         (id, inviter_id, invitee_email, token, status, sent_at, expires_at, accepted_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(uuid_to_blob(invitation.id))
    .bind(uuid_to_blob(invitation.inviter_id))
    .bind(invitation.invitee_email)
    .bind(invitation.token)
    .bind(invitation.status.as_str())
    .bind(invitation.sent_at)
    .bind(invitation.expires_at)
    .bind(invitation.accepted_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl CycleRepo for SqliteStore {
    async fn insert_cycle(&self, cycle: Cycle) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO cycles (id, opens_at, deadline, status, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(i64::from(cycle.id.raw()))
        .bind(cycle.opens_at)
        .bind(cycle.deadline)
        .bind(cycle.status.as_str())
        .bind(cycle.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_cycle(&self, id: CycleId) -> StoreResult<Option<Cycle>> {
        let row = sqlx::query(&format!("SELECT {CYCLE_COLUMNS} FROM cycles WHERE id = ?"))
            .bind(i64::from(id.raw()))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.as_ref().map(map_cycle).transpose()?)
    }

    async fn find_open_cycle(&self) -> StoreResult<Option<Cycle>> {
        let row = sqlx::query(&format!("SELECT {CYCLE_COLUMNS} FROM cycles WHERE status = 'open'"))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.as_ref().map(map_cycle).transpose()?)
    }

    async fn list_cycles_with_status(&self, status: CycleStatus) -> StoreResult<Vec<Cycle>> {
        let rows = sqlx::query(&format!(
            "SELECT {CYCLE_COLUMNS} FROM cycles WHERE status = ? ORDER BY id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        map_all(rows, map_cycle)
    }

    async fn list_cycle_ids(&self) -> StoreResult<Vec<CycleId>> {
        let rows = sqlx::query("SELECT id FROM cycles ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(rows
            .iter()
            .map(|row| get_cycle_id(row, "id"))
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    async fn update_cycle_status(
        &self,
        id: CycleId,
        from: CycleStatus,
        to: CycleStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE cycles SET status = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(i64::from(id.raw()))
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl MemberRepo for SqliteStore {
    async fn insert_member(&self, member: Member) -> StoreResult<()> {
        insert_member_row(&self.pool, member).await.map_err(db_error)
    }

    async fn enroll_member(&self, member: Member, streak: Streak) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        insert_member_row(&mut *tx, member).await.map_err(db_error)?;
        upsert_streak_row(&mut *tx, streak).await.map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn get_member(&self, id: Uuid) -> StoreResult<Option<Member>> {
        let row = sqlx::query(&format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?"))
            .bind(uuid_to_blob(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.as_ref().map(map_member).transpose()?)
    }

    async fn find_member_by_email(&self, email: &str) -> StoreResult<Option<Member>> {
        let row = sqlx::query(&format!("SELECT {MEMBER_COLUMNS} FROM members WHERE email = ?"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.as_ref().map(map_member).transpose()?)
    }

    async fn list_active_members(&self) -> StoreResult<Vec<Member>> {
        let rows = sqlx::query(&format!("SELECT {MEMBER_COLUMNS} FROM members WHERE is_active = 1"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        let mut members = map_all(rows, map_member)?;
        members.sort_by_key(|m| (m.joined_at, m.id));
        Ok(members)
    }

    async fn set_member_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE members SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(uuid_to_blob(id))
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SubmissionRepo for SqliteStore {
    async fn insert_submission(&self, submission: Submission) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO submissions \
             (id, member_id, cycle_id, highlight, lowlight, recommendation, submitted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid_to_blob(submission.id))
        .bind(uuid_to_blob(submission.member_id))
        .bind(i64::from(submission.cycle_id.raw()))
        .bind(&submission.fields.highlight)
        .bind(&submission.fields.lowlight)
        .bind(&submission.fields.recommendation)
        .bind(submission.submitted_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_submission(
        &self,
        member_id: Uuid,
        cycle_id: CycleId,
    ) -> StoreResult<Option<Submission>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE member_id = ? AND cycle_id = ?"
        ))
        .bind(uuid_to_blob(member_id))
        .bind(i64::from(cycle_id.raw()))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(row.as_ref().map(map_submission).transpose()?)
    }

    async fn list_submissions(&self, cycle_id: CycleId) -> StoreResult<Vec<Submission>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE cycle_id = ?"
        ))
        .bind(i64::from(cycle_id.raw()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        let mut submissions = map_all(rows, map_submission)?;
        submissions.sort_by_key(|s| (s.submitted_at, s.id));
        Ok(submissions)
    }

    async fn delete_submissions_before(&self, cycle_id: CycleId) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM submissions WHERE cycle_id < ?")
            .bind(i64::from(cycle_id.raw()))
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StreakRepo for SqliteStore {
    async fn get_streak(&self, member_id: Uuid) -> StoreResult<Option<Streak>> {
        let row = sqlx::query(
            "SELECT member_id, current, longest, last_cycle, last_evaluated_cycle, \
             invite_eligible, eligible_since, updated_at FROM streaks WHERE member_id = ?",
        )
        .bind(uuid_to_blob(member_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(row.as_ref().map(map_streak).transpose()?)
    }

    async fn save_streak(&self, streak: Streak) -> StoreResult<()> {
        upsert_streak_row(&self.pool, streak).await.map_err(db_error)
    }
}

#[async_trait]
impl InvitationRepo for SqliteStore {
    async fn issue_invitation(&self, invitation: Invitation, cap: u32) -> StoreResult<Option<u32>> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Cap check and bump in one statement: two issuers cannot both take
        // the last slot.
        let reserved = sqlx::query(
            "UPDATE members SET invitations_sent = invitations_sent + 1 \
             WHERE id = ? AND invitations_sent < ? RETURNING invitations_sent",
        )
        .bind(uuid_to_blob(invitation.inviter_id))
        .bind(i64::from(cap))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        let Some(row) = reserved else {
            return Ok(None);
        };
        let sent = get_u32(&row, "invitations_sent")?;

        // A conflict here drops `tx`, which rolls the reservation back.
        insert_invitation_row(&mut *tx, invitation).await.map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(Some(sent))
    }

    async fn find_invitation_by_token(&self, token: &str) -> StoreResult<Option<Invitation>> {
        let row = sqlx::query(&format!("SELECT {INVITATION_COLUMNS} FROM invitations WHERE token = ?"))
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.as_ref().map(map_invitation).transpose()?)
    }

    async fn find_pending_invitation(&self, email: &str) -> StoreResult<Option<Invitation>> {
        let row = sqlx::query(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations WHERE invitee_email = ? AND status = 'pending'"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(row.as_ref().map(map_invitation).transpose()?)
    }

    async fn list_expired_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<Invitation>> {
        // Timestamps are compared as instants, not as stored text.
        let rows = sqlx::query(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations WHERE status = 'pending'"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        let mut lapsed: Vec<Invitation> = map_all(rows, map_invitation)?
            .into_iter()
            .filter(|i| i.is_expired_at(now))
            .collect();
        lapsed.sort_by_key(|i| (i.expires_at, i.id));
        Ok(lapsed)
    }

    async fn transition_invitation(
        &self,
        id: Uuid,
        from: InvitationStatus,
        to: InvitationStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let accepted_at = (to == InvitationStatus::Accepted).then_some(at);
        let result = sqlx::query(
            "UPDATE invitations SET status = ?, accepted_at = COALESCE(?, accepted_at) \
             WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(accepted_at)
        .bind(uuid_to_blob(id))
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn redeem_invitation(
        &self,
        invitation_id: Uuid,
        member: Member,
        streak: Streak,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let moved = sqlx::query(
            "UPDATE invitations SET status = 'accepted', accepted_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(at)
        .bind(uuid_to_blob(invitation_id))
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        if moved.rows_affected() != 1 {
            return Ok(false);
        }

        insert_member_row(&mut *tx, member).await.map_err(db_error)?;
        upsert_streak_row(&mut *tx, streak).await.map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }
}
