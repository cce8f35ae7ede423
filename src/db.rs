use std::collections::HashMap;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    Ballot, BallotItem, BoardMember, Candidate, CohortSettings, ItemKind, ItemRef, Phase,
    PhaseWeights, RatedBallot, RaterIdentity, Rating, RatingKey, RatingScore, ScorableItem,
};
use crate::store::{RatingRepository, RatingStore};

const FOREIGN_KEY_VIOLATION: &str = "23503";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .as_deref()
        == Some(FOREIGN_KEY_VIOLATION)
}

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn require_cohort(&self, cohort_id: Uuid) -> Result<(), EngineError> {
        let found = sqlx::query("SELECT id FROM board_eval.cohorts WHERE id = $1")
            .bind(cohort_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up cohort")?;
        match found {
            Some(_) => Ok(()),
            None => Err(EngineError::CohortNotFound(cohort_id)),
        }
    }

    pub async fn cohort_label(&self, cohort_id: Uuid) -> Result<String, EngineError> {
        let row = sqlx::query("SELECT term, year FROM board_eval.cohorts WHERE id = $1")
            .bind(cohort_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up cohort")?
            .ok_or(EngineError::CohortNotFound(cohort_id))?;
        let term: String = row.get("term");
        let year: i32 = row.get("year");
        Ok(format!("{} {}", term, year))
    }
}

fn candidate_from_row(row: &sqlx::postgres::PgRow) -> Candidate {
    Candidate {
        id: row.get("id"),
        cohort_id: row.get("cohort_id"),
        candidate_number: row.get("candidate_number"),
        custom_order: row.get("custom_order"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        email: row.get("email"),
        is_active: row.get("is_active"),
    }
}

const CANDIDATE_COLUMNS: &str =
    "id, cohort_id, candidate_number, custom_order, first_name, last_name, email, is_active";

#[async_trait]
impl RatingRepository for PgRepository {
    async fn candidates(&self, cohort_id: Uuid) -> Result<Vec<Candidate>, EngineError> {
        self.require_cohort(cohort_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM board_eval.candidates WHERE cohort_id = $1 \
             ORDER BY custom_order NULLS LAST, candidate_number NULLS LAST"
        ))
        .bind(cohort_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch candidates")?;

        Ok(rows.iter().map(candidate_from_row).collect())
    }

    async fn candidate(
        &self,
        cohort_id: Uuid,
        candidate_id: Uuid,
    ) -> Result<Candidate, EngineError> {
        let row = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM board_eval.candidates WHERE id = $1 AND cohort_id = $2"
        ))
        .bind(candidate_id)
        .bind(cohort_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch candidate")?;

        row.as_ref()
            .map(candidate_from_row)
            .ok_or(EngineError::CandidateNotFound(candidate_id))
    }

    async fn scorable_items(&self, cohort_id: Uuid) -> Result<Vec<ScorableItem>, EngineError> {
        self.require_cohort(cohort_id).await?;
        let mut items = Vec::new();

        let questions = sqlx::query(
            r#"
            SELECT id, question_text, category, sort_order, is_scorable
            FROM board_eval.application_questions
            WHERE cohort_id = $1
            ORDER BY sort_order
            "#,
        )
        .bind(cohort_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch questions")?;

        for row in questions {
            items.push(ScorableItem {
                item: ItemRef::Question(row.get("id")),
                cohort_id,
                label: row.get("question_text"),
                category: row.get("category"),
                sort_order: row.get("sort_order"),
                is_scorable: row.get("is_scorable"),
            });
        }

        let traits = sqlx::query(
            r#"
            SELECT id, name, sort_order
            FROM board_eval.character_traits
            WHERE cohort_id = $1
            ORDER BY sort_order
            "#,
        )
        .bind(cohort_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch character traits")?;

        for row in traits {
            items.push(ScorableItem {
                item: ItemRef::Trait(row.get("id")),
                cohort_id,
                label: row.get("name"),
                category: None,
                sort_order: row.get("sort_order"),
                is_scorable: true,
            });
        }

        Ok(items)
    }

    async fn rated_ballots(&self, cohort_id: Uuid) -> Result<Vec<RatedBallot>, EngineError> {
        self.require_cohort(cohort_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.candidate_id, r.voter_id, r.legacy_voter_alias, r.rating_type,
                   r.updated_at,
                   rs.question_id, rs.trait_id, rs.score, rs.comment
            FROM board_eval.ratings r
            LEFT JOIN board_eval.rating_scores rs ON rs.rating_id = r.id
            WHERE r.cohort_id = $1
            ORDER BY r.created_at, r.id
            "#,
        )
        .bind(cohort_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch ratings")?;

        let mut ballots: Vec<RatedBallot> = Vec::new();
        let mut index: HashMap<Uuid, Option<usize>> = HashMap::new();

        for row in rows {
            let rating_id: Uuid = row.get("id");
            let position = match index.get(&rating_id) {
                Some(position) => *position,
                None => {
                    let position = rating_from_row(&row).map(|rating| {
                        ballots.push(RatedBallot {
                            rating,
                            scores: Vec::new(),
                        });
                        ballots.len() - 1
                    });
                    index.insert(rating_id, position);
                    position
                }
            };
            let Some(position) = position else {
                continue;
            };

            let question_id: Option<Uuid> = row.get("question_id");
            let trait_id: Option<Uuid> = row.get("trait_id");
            let item = match (question_id, trait_id) {
                (Some(id), _) => ItemRef::Question(id),
                (None, Some(id)) => ItemRef::Trait(id),
                (None, None) => continue,
            };
            ballots[position].scores.push(RatingScore {
                item,
                score: row.get("score"),
                comment: row.get("comment"),
            });
        }

        Ok(ballots)
    }

    async fn board_members(&self, cohort_id: Uuid) -> Result<Vec<BoardMember>, EngineError> {
        self.require_cohort(cohort_id).await?;
        let rows = sqlx::query(
            "SELECT user_id, full_name FROM board_eval.board_members WHERE cohort_id = $1 ORDER BY full_name",
        )
        .bind(cohort_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch board members")?;

        Ok(rows
            .iter()
            .map(|row| BoardMember {
                rater: RaterIdentity::LiveUser(row.get("user_id")),
                name: row.get("full_name"),
            })
            .collect())
    }

    async fn settings(&self, cohort_id: Uuid) -> Result<Option<CohortSettings>, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT application_weight, interview_weight, character_weight,
                   outlier_std_devs, top_n_display
            FROM board_eval.cohort_settings
            WHERE cohort_id = $1
            "#,
        )
        .bind(cohort_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch cohort settings")?;

        Ok(row.map(|row| {
            let top_n: i32 = row.get("top_n_display");
            CohortSettings {
                weights: PhaseWeights {
                    application: row.get("application_weight"),
                    interview: row.get("interview_weight"),
                    character: row.get("character_weight"),
                },
                outlier_std_devs: row.get("outlier_std_devs"),
                top_n_display: top_n.max(0) as u32,
            }
        }))
    }

    async fn save_settings(
        &self,
        cohort_id: Uuid,
        settings: &CohortSettings,
    ) -> Result<(), EngineError> {
        self.require_cohort(cohort_id).await?;
        let top_n = i32::try_from(settings.top_n_display).map_err(|_| {
            EngineError::InvalidSettings(format!(
                "top_n_display {} is too large",
                settings.top_n_display
            ))
        })?;

        sqlx::query(
            r#"
            INSERT INTO board_eval.cohort_settings
            (cohort_id, application_weight, interview_weight, character_weight,
             outlier_std_devs, top_n_display, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (cohort_id) DO UPDATE
            SET application_weight = EXCLUDED.application_weight,
                interview_weight = EXCLUDED.interview_weight,
                character_weight = EXCLUDED.character_weight,
                outlier_std_devs = EXCLUDED.outlier_std_devs,
                top_n_display = EXCLUDED.top_n_display,
                updated_at = NOW()
            "#,
        )
        .bind(cohort_id)
        .bind(settings.weights.application)
        .bind(settings.weights.interview)
        .bind(settings.weights.character)
        .bind(settings.outlier_std_devs)
        .bind(top_n)
        .execute(&self.pool)
        .await
        .context("failed to save cohort settings")?;

        Ok(())
    }

    async fn write_ballot(
        &self,
        key: &RatingKey,
        kind: ItemKind,
        scores: &[RatingScore],
    ) -> Result<Uuid, EngineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open transaction")?;

        let rating_id = match touch_rating(&mut *tx, key)
            .await
            .context("failed to update rating")?
        {
            Some(rating_id) => rating_id,
            None => match insert_rating(&mut *tx, key).await {
                Ok(Some(rating_id)) => rating_id,
                Ok(None) => touch_rating(&mut *tx, key)
                    .await
                    .context("failed to update rating")?
                    .ok_or_else(|| anyhow!("rating for {} conflicted but was not found", key.rater))?,
                Err(err) if is_foreign_key_violation(&err) => {
                    return Err(EngineError::CandidateNotFound(key.candidate_id))
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context("failed to create rating")
                        .into())
                }
            },
        };

        let delete = match kind {
            ItemKind::Question => {
                "DELETE FROM board_eval.rating_scores WHERE rating_id = $1 AND question_id IS NOT NULL"
            }
            ItemKind::Trait => {
                "DELETE FROM board_eval.rating_scores WHERE rating_id = $1 AND trait_id IS NOT NULL"
            }
        };
        sqlx::query(delete)
            .bind(rating_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear previous scores")?;

        for score in scores {
            let (question_id, trait_id) = match score.item {
                ItemRef::Question(id) => (Some(id), None),
                ItemRef::Trait(id) => (None, Some(id)),
            };
            let result = sqlx::query(
                r#"
                INSERT INTO board_eval.rating_scores
                (id, rating_id, question_id, trait_id, score, comment)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(rating_id)
            .bind(question_id)
            .bind(trait_id)
            .bind(score.score)
            .bind(score.comment.as_deref())
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(err) if is_foreign_key_violation(&err) => {
                    return Err(EngineError::ItemNotFound(score.item))
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context("failed to save scores")
                        .into())
                }
            }
        }

        tx.commit().await.context("failed to commit ballot")?;
        Ok(rating_id)
    }
}

fn rating_from_row(row: &sqlx::postgres::PgRow) -> Option<Rating> {
    rating_from_columns(
        row.get("id"),
        row.get("candidate_id"),
        RaterIdentity::from_columns(row.get("voter_id"), row.get("legacy_voter_alias")),
        row.get("rating_type"),
        row.get("updated_at"),
    )
}

fn rating_from_columns(
    rating_id: Uuid,
    candidate_id: Uuid,
    rater: Option<RaterIdentity>,
    rating_type: &str,
    updated_at: DateTime<Utc>,
) -> Option<Rating> {
    let Some(rater) = rater else {
        warn!(%rating_id, "rating has no rater identity, skipping");
        return None;
    };
    let phase = match Phase::parse(rating_type) {
        Ok(phase) => phase,
        Err(err) => {
            warn!(%rating_id, error = %err, "rating has unknown phase, skipping");
            return None;
        }
    };
    Some(Rating {
        id: rating_id,
        candidate_id,
        rater,
        phase,
        updated_at,
    })
}

async fn touch_rating(conn: &mut PgConnection, key: &RatingKey) -> sqlx::Result<Option<Uuid>> {
    let row = sqlx::query(
        r#"
        UPDATE board_eval.ratings
        SET updated_at = NOW()
        WHERE candidate_id = $1
          AND cohort_id = $2
          AND rating_type = $3
          AND voter_id IS NOT DISTINCT FROM $4
          AND legacy_voter_alias IS NOT DISTINCT FROM $5
        RETURNING id
        "#,
    )
    .bind(key.candidate_id)
    .bind(key.cohort_id)
    .bind(key.phase.as_str())
    .bind(key.rater.voter_id())
    .bind(key.rater.alias())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| row.get("id")))
}

async fn insert_rating(conn: &mut PgConnection, key: &RatingKey) -> sqlx::Result<Option<Uuid>> {
    let row = sqlx::query(
        r#"
        INSERT INTO board_eval.ratings
        (id, candidate_id, cohort_id, voter_id, legacy_voter_alias, rating_type)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(key.candidate_id)
    .bind(key.cohort_id)
    .bind(key.rater.voter_id())
    .bind(key.rater.alias())
    .bind(key.phase.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| row.get("id")))
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<Uuid> {
    let cohort_id = Uuid::parse_str("8f0c6f52-5a0e-4d2b-9b8e-2f1f0d6b7c11")?;

    sqlx::query(
        r#"
        INSERT INTO board_eval.cohorts (id, term, year, is_active, application_open)
        VALUES ($1, $2, $3, TRUE, TRUE)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(cohort_id)
    .bind("Fall")
    .bind(2026)
    .execute(pool)
    .await?;

    let candidates = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            1,
            "Avery",
            "Lee",
            "avery.lee@example.org",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            2,
            "Jules",
            "Moreno",
            "jules.moreno@example.org",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            3,
            "Kiara",
            "Patel",
            "kiara.patel@example.org",
        ),
    ];

    for (id, number, first_name, last_name, email) in candidates {
        sqlx::query(
            r#"
            INSERT INTO board_eval.candidates
            (id, cohort_id, candidate_number, first_name, last_name, email)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET first_name = EXCLUDED.first_name, last_name = EXCLUDED.last_name
            "#,
        )
        .bind(id)
        .bind(cohort_id)
        .bind(number)
        .bind(first_name)
        .bind(last_name)
        .bind(email)
        .execute(pool)
        .await?;
    }

    let questions = vec![
        ("6a1e4a4e-8a5f-4c55-9d3e-1b7a0e0f2a01", "Why do you want to serve on the board?", "Motivation"),
        ("6a1e4a4e-8a5f-4c55-9d3e-1b7a0e0f2a02", "Describe a time you led a team through conflict.", "Leadership"),
    ];
    for (order, (id, text, category)) in questions.into_iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO board_eval.application_questions
            (id, cohort_id, question_text, category, sort_order)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(Uuid::parse_str(id)?)
        .bind(cohort_id)
        .bind(text)
        .bind(category)
        .bind(order as i32)
        .execute(pool)
        .await?;
    }

    let traits = vec![
        ("7b2f5b5f-9b60-4d66-8e4f-2c8b1f103b01", "Integrity"),
        ("7b2f5b5f-9b60-4d66-8e4f-2c8b1f103b02", "Reliability"),
    ];
    for (order, (id, name)) in traits.into_iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO board_eval.character_traits (id, cohort_id, name, sort_order)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(Uuid::parse_str(id)?)
        .bind(cohort_id)
        .bind(name)
        .bind(order as i32)
        .execute(pool)
        .await?;
    }

    let members = vec![
        ("a4c1d0e2-1f2b-4a3c-8d4e-5f6a7b8c9d01", "Sam Rivera"),
        ("a4c1d0e2-1f2b-4a3c-8d4e-5f6a7b8c9d02", "Dana Fox"),
    ];
    for (id, name) in members {
        sqlx::query(
            r#"
            INSERT INTO board_eval.board_members (cohort_id, user_id, full_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (cohort_id, user_id) DO UPDATE SET full_name = EXCLUDED.full_name
            "#,
        )
        .bind(cohort_id)
        .bind(Uuid::parse_str(id)?)
        .bind(name)
        .execute(pool)
        .await?;
    }

    Ok(cohort_id)
}

pub async fn seed_ballots<R>(store: &RatingStore<R>, cohort_id: Uuid) -> anyhow::Result<usize>
where
    R: RatingRepository + ?Sized,
{
    let q1 = Uuid::parse_str("6a1e4a4e-8a5f-4c55-9d3e-1b7a0e0f2a01")?;
    let q2 = Uuid::parse_str("6a1e4a4e-8a5f-4c55-9d3e-1b7a0e0f2a02")?;
    let avery = Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?;
    let jules = Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?;

    let raters = vec![
        RaterIdentity::LiveUser(Uuid::parse_str("a4c1d0e2-1f2b-4a3c-8d4e-5f6a7b8c9d01")?),
        RaterIdentity::LiveUser(Uuid::parse_str("a4c1d0e2-1f2b-4a3c-8d4e-5f6a7b8c9d02")?),
        RaterIdentity::HistoricalAlias("Former Chair".to_string()),
    ];
    let sheets = [
        (avery, [(8.0, 7.0), (9.0, 7.5), (8.5, 3.0)]),
        (jules, [(6.0, 6.5), (6.5, 7.0), (6.0, 6.0)]),
    ];

    let mut submitted = 0usize;
    for (candidate_id, scores) in sheets {
        for (rater, (first, second)) in raters.iter().zip(scores) {
            let ballot = Ballot {
                candidate_id,
                cohort_id,
                phase: Phase::Application,
                items: vec![
                    BallotItem {
                        item_id: q1,
                        score: first,
                        comment: None,
                    },
                    BallotItem {
                        item_id: q2,
                        score: second,
                        comment: None,
                    },
                ],
            };
            store
                .submit_ballot(Some(rater), &ballot)
                .await
                .with_context(|| format!("failed to seed ballot for {}", candidate_id))?;
            submitted += 1;
        }
    }

    Ok(submitted)
}
