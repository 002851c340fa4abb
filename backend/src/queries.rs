use sqlx::{postgres::PgRow, types::Json, PgPool, Row};
use uuid::Uuid;
use shared::{models::*, VoterIdentity};
use crate::store::{PollStore, StoreError};

const POLL_COLUMNS: &str =
    "id, question, option_texts, option_counts, creator, is_public, total_votes, voters, created_at";

/// PostgreSQL-backed store. Each poll is one row; voter records live in a JSONB
/// array on that row, so a vote touches exactly one row.
pub struct PgPollStore {
    pool: PgPool,
}

impl PgPollStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_count(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Database(format!("negative counter {value}")))
}

fn poll_from_row(row: &PgRow) -> Result<Poll, StoreError> {
    let texts: Vec<String> = row.try_get("option_texts").map_err(db_error)?;
    let counts: Vec<i64> = row.try_get("option_counts").map_err(db_error)?;
    if texts.len() != counts.len() {
        return Err(StoreError::Database("option texts and counts differ in length".into()));
    }

    let options = texts.into_iter()
        .zip(counts)
        .map(|(text, count)| Ok(PollOption { text, count: to_count(count)? }))
        .collect::<Result<Vec<_>, StoreError>>()?;

    let creator: String = row.try_get("creator").map_err(db_error)?;
    let Json(voters): Json<Vec<VoterRecord>> = row.try_get("voters").map_err(db_error)?;

    Ok(Poll {
        id: row.try_get("id").map_err(db_error)?,
        question: row.try_get("question").map_err(db_error)?,
        options,
        creator: VoterIdentity::parse_key(&creator).map_err(|e| StoreError::Database(e.to_string()))?,
        is_public: row.try_get("is_public").map_err(db_error)?,
        total_votes: to_count(row.try_get("total_votes").map_err(db_error)?)?,
        voters,
        created_at: row.try_get("created_at").map_err(db_error)?,
    })
}

#[rocket::async_trait]
impl PollStore for PgPollStore {
    async fn insert(&self, poll: Poll) -> Result<(), StoreError> {
        let texts: Vec<String> = poll.options.iter().map(|o| o.text.clone()).collect();
        let counts: Vec<i64> = poll.options.iter().map(|o| o.count as i64).collect();

        sqlx::query(
            "INSERT INTO quick_polls.polls
             (id, question, option_texts, option_counts, creator, is_public, total_votes, voters, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(poll.id)
        .bind(&poll.question)
        .bind(&texts)
        .bind(&counts)
        .bind(poll.creator.key())
        .bind(poll.is_public)
        .bind(poll.total_votes as i64)
        .bind(Json(&poll.voters))
        .bind(poll.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
        let row = sqlx::query(&format!("SELECT {POLL_COLUMNS} FROM quick_polls.polls WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(poll_from_row).transpose()
    }

    async fn list_by_creator(&self, creator: &VoterIdentity) -> Result<Vec<Poll>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {POLL_COLUMNS} FROM quick_polls.polls WHERE creator = $1 ORDER BY created_at DESC"
        ))
        .bind(creator.key())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(poll_from_row).collect()
    }

    async fn commit_vote(&self, id: Uuid, vote: VoterRecord) -> Result<Poll, StoreError> {
        // One statement: the row lock serializes writers on this poll, and a writer
        // that waited re-evaluates the WHERE clause against the row it finally sees.
        let position = i32::try_from(vote.option_index + 1).map_err(|_| StoreError::OptionOutOfRange)?;

        let row = sqlx::query(&format!(
            "UPDATE quick_polls.polls
             SET option_counts[$3] = option_counts[$3] + 1,
                 total_votes = total_votes + 1,
                 voters = voters || jsonb_build_array($4::jsonb)
             WHERE id = $1
               AND creator <> $2
               AND $3 BETWEEN 1 AND cardinality(option_counts)
               AND NOT voters @> jsonb_build_array(jsonb_build_object('identity', $2::text))
             RETURNING {POLL_COLUMNS}"
        ))
        .bind(id)
        .bind(vote.identity.key())
        .bind(position)
        .bind(Json(&vote))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        if let Some(row) = row {
            return poll_from_row(&row);
        }

        // Nothing matched; work out which condition failed.
        let current = self.fetch(id).await?.ok_or(StoreError::NotFound)?;
        if current.is_creator(&vote.identity) {
            Err(StoreError::CreatorVote)
        } else if current.has_voted(&vote.identity) {
            Err(StoreError::AlreadyVoted)
        } else if vote.option_index >= current.options.len() {
            Err(StoreError::OptionOutOfRange)
        } else {
            Err(StoreError::Database("conditional vote update matched no row".into()))
        }
    }
}
