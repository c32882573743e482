//! PostgreSQL Access Store backed by sqlx.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use super::{AccessStore, AccessTransaction};
use crate::error::{RestraintError, Result};
use crate::rbac::models::{
    AccessGrant, GrantHolder, GrantedLevel, Perm, PermLevel, PermSet, Record, RecordId, SubjectKey,
};

type GrantRow = (i64, Option<i64>, Option<String>, Option<i64>, Vec<i64>);

const GRANT_SELECT: &str = r#"
    SELECT a.id, a.perm_set_id, a.subject_type, a.subject_id,
           COALESCE(array_agg(al.level_id) FILTER (WHERE al.level_id IS NOT NULL), '{}') AS level_ids
    FROM restraint_perm_access a
    LEFT JOIN restraint_perm_access_levels al ON al.access_id = a.id
"#;

fn grant_from_row(row: GrantRow) -> Result<Record<AccessGrant>> {
    let (id, perm_set_id, subject_type, subject_id, level_ids) = row;
    let holder = match (perm_set_id, subject_type, subject_id) {
        (Some(perm_set_id), None, None) => GrantHolder::perm_set(perm_set_id),
        (None, Some(subject_type), Some(subject_id)) => {
            GrantHolder::subject(SubjectKey::new(subject_type, subject_id))
        }
        _ => {
            return Err(RestraintError::internal(format!(
                "Grant {} has no single holder",
                id
            )))
        }
    };
    Ok(Record::new(
        id,
        AccessGrant {
            holder,
            level_ids: level_ids.into_iter().collect(),
        },
    ))
}

fn ensure_affected(rows: u64, entity_type: &str, id: RecordId) -> Result<()> {
    if rows == 0 {
        return Err(RestraintError::not_found(entity_type, id.to_string()));
    }
    Ok(())
}

/// Access Store over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgAccessStore {
    pool: PgPool,
}

impl PgAccessStore {
    pub async fn connect(database_url: &str, max_connections: u32, min_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AccessStore for PgAccessStore {
    async fn begin(&self) -> Result<Box<dyn AccessTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn granted_levels(
        &self,
        perm_sets: &[String],
        subject: &SubjectKey,
        perms: Option<&BTreeSet<String>>,
    ) -> Result<BTreeSet<GrantedLevel>> {
        let perms: Option<Vec<String>> = perms.map(|p| p.iter().cloned().collect());

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT p.name, l.name
            FROM restraint_perm_access_levels al
            JOIN restraint_perm_access a ON a.id = al.access_id
            JOIN restraint_perm_levels l ON l.id = al.level_id
            JOIN restraint_perms p ON p.id = l.perm_id
            LEFT JOIN restraint_perm_sets s ON s.id = a.perm_set_id
            WHERE (s.name = ANY($1) OR (a.subject_type = $2 AND a.subject_id = $3))
              AND ($4::text[] IS NULL OR p.name = ANY($4))
            "#,
        )
        .bind(perm_sets)
        .bind(&subject.subject_type)
        .bind(subject.subject_id)
        .bind(perms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(perm, level)| GrantedLevel::new(perm, level))
            .collect())
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AccessTransaction for PgTransaction {
    async fn perm_sets(&mut self) -> Result<Vec<Record<PermSet>>> {
        let rows: Vec<(i64, String, String, bool, bool, bool)> = sqlx::query_as(
            "SELECT id, name, display_name, is_private, is_locked, is_hidden FROM restraint_perm_sets ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, display_name, is_private, is_locked, is_hidden)| {
                Record::new(
                    id,
                    PermSet {
                        name,
                        display_name,
                        is_private,
                        is_locked,
                        is_hidden,
                    },
                )
            })
            .collect())
    }

    async fn insert_perm_set(&mut self, perm_set: &PermSet) -> Result<Record<PermSet>> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO restraint_perm_sets (name, display_name, is_private, is_locked, is_hidden)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&perm_set.name)
        .bind(&perm_set.display_name)
        .bind(perm_set.is_private)
        .bind(perm_set.is_locked)
        .bind(perm_set.is_hidden)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Record::new(id, perm_set.clone()))
    }

    async fn update_perm_set(&mut self, id: RecordId, perm_set: &PermSet) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE restraint_perm_sets
            SET name = $2, display_name = $3, is_private = $4, is_locked = $5, is_hidden = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&perm_set.name)
        .bind(&perm_set.display_name)
        .bind(perm_set.is_private)
        .bind(perm_set.is_locked)
        .bind(perm_set.is_hidden)
        .execute(&mut *self.tx)
        .await?;

        ensure_affected(result.rows_affected(), "perm_set", id)
    }

    async fn delete_perm_set(&mut self, id: RecordId) -> Result<()> {
        let result = sqlx::query("DELETE FROM restraint_perm_sets WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        ensure_affected(result.rows_affected(), "perm_set", id)
    }

    async fn perms(&mut self) -> Result<Vec<Record<Perm>>> {
        let rows: Vec<(i64, String, String, bool, bool)> = sqlx::query_as(
            "SELECT id, name, display_name, is_locked, is_hidden FROM restraint_perms ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, display_name, is_locked, is_hidden)| {
                Record::new(
                    id,
                    Perm {
                        name,
                        display_name,
                        is_locked,
                        is_hidden,
                    },
                )
            })
            .collect())
    }

    async fn insert_perm(&mut self, perm: &Perm) -> Result<Record<Perm>> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO restraint_perms (name, display_name, is_locked, is_hidden)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&perm.name)
        .bind(&perm.display_name)
        .bind(perm.is_locked)
        .bind(perm.is_hidden)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Record::new(id, perm.clone()))
    }

    async fn update_perm(&mut self, id: RecordId, perm: &Perm) -> Result<()> {
        let result = sqlx::query(
            "UPDATE restraint_perms SET name = $2, display_name = $3, is_locked = $4, is_hidden = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(&perm.name)
        .bind(&perm.display_name)
        .bind(perm.is_locked)
        .bind(perm.is_hidden)
        .execute(&mut *self.tx)
        .await?;

        ensure_affected(result.rows_affected(), "perm", id)
    }

    async fn delete_perm(&mut self, id: RecordId) -> Result<()> {
        let result = sqlx::query("DELETE FROM restraint_perms WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        ensure_affected(result.rows_affected(), "perm", id)
    }

    async fn perm_levels(&mut self) -> Result<Vec<Record<PermLevel>>> {
        let rows: Vec<(i64, i64, String, String)> = sqlx::query_as(
            "SELECT id, perm_id, name, display_name FROM restraint_perm_levels ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, perm_id, name, display_name)| {
                Record::new(
                    id,
                    PermLevel {
                        perm_id,
                        name,
                        display_name,
                    },
                )
            })
            .collect())
    }

    async fn insert_perm_level(&mut self, level: &PermLevel) -> Result<Record<PermLevel>> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO restraint_perm_levels (perm_id, name, display_name) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(level.perm_id)
        .bind(&level.name)
        .bind(&level.display_name)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Record::new(id, level.clone()))
    }

    async fn update_perm_level(&mut self, id: RecordId, level: &PermLevel) -> Result<()> {
        let result = sqlx::query(
            "UPDATE restraint_perm_levels SET perm_id = $2, name = $3, display_name = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(level.perm_id)
        .bind(&level.name)
        .bind(&level.display_name)
        .execute(&mut *self.tx)
        .await?;

        ensure_affected(result.rows_affected(), "perm_level", id)
    }

    async fn delete_perm_level(&mut self, id: RecordId) -> Result<()> {
        let result = sqlx::query("DELETE FROM restraint_perm_levels WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        ensure_affected(result.rows_affected(), "perm_level", id)
    }

    async fn grant(&mut self, holder: &GrantHolder) -> Result<Option<Record<AccessGrant>>> {
        let row: Option<GrantRow> = match holder {
            GrantHolder::PermSet { perm_set_id } => {
                sqlx::query_as(&format!("{} WHERE a.perm_set_id = $1 GROUP BY a.id", GRANT_SELECT))
                    .bind(*perm_set_id)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
            GrantHolder::Subject { subject } => {
                sqlx::query_as(&format!(
                    "{} WHERE a.subject_type = $1 AND a.subject_id = $2 GROUP BY a.id",
                    GRANT_SELECT
                ))
                .bind(&subject.subject_type)
                .bind(subject.subject_id)
                .fetch_optional(&mut *self.tx)
                .await?
            }
        };

        row.map(grant_from_row).transpose()
    }

    async fn create_grant(&mut self, holder: &GrantHolder) -> Result<Record<AccessGrant>> {
        let (perm_set_id, subject_type, subject_id) = match holder {
            GrantHolder::PermSet { perm_set_id } => (Some(*perm_set_id), None, None),
            GrantHolder::Subject { subject } => {
                (None, Some(subject.subject_type.clone()), Some(subject.subject_id))
            }
        };

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO restraint_perm_access (perm_set_id, subject_type, subject_id) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(perm_set_id)
        .bind(subject_type)
        .bind(subject_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Record::new(id, AccessGrant::empty(holder.clone())))
    }

    async fn grants(&mut self) -> Result<Vec<Record<AccessGrant>>> {
        let rows: Vec<GrantRow> = sqlx::query_as(&format!("{} GROUP BY a.id ORDER BY a.id", GRANT_SELECT))
            .fetch_all(&mut *self.tx)
            .await?;

        rows.into_iter().map(grant_from_row).collect()
    }

    async fn add_grant_levels(&mut self, grant_id: RecordId, level_ids: &[RecordId]) -> Result<()> {
        if level_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO restraint_perm_access_levels (access_id, level_id)
            SELECT $1, UNNEST($2::bigint[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(grant_id)
        .bind(level_ids)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn remove_grant_levels(&mut self, grant_id: RecordId, level_ids: &[RecordId]) -> Result<()> {
        sqlx::query("DELETE FROM restraint_perm_access_levels WHERE access_id = $1 AND level_id = ANY($2)")
            .bind(grant_id)
            .bind(level_ids)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn clear_grant_levels(&mut self, grant_id: RecordId) -> Result<()> {
        sqlx::query("DELETE FROM restraint_perm_access_levels WHERE access_id = $1")
            .bind(grant_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
