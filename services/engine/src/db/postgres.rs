//! Postgres-backed stores.
//!
//! Both tables hold one JSONB document per id; the engine never queries
//! inside the documents.

use async_trait::async_trait;
use hyde_id::{DeploymentId, SecretId};
use sqlx::postgres::PgPool;
use sqlx::types::Json;

use super::{DbError, DeploymentRepository};
use crate::model::Deployment;
use crate::secrets::{Secret, Vault};

/// Postgres error code for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

pub struct PgDeploymentRepository {
    pool: PgPool,
}

impl PgDeploymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeploymentRepository for PgDeploymentRepository {
    async fn save(&self, deployment: &Deployment) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO deployments (id, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(deployment.id.to_string())
        .bind(Json(deployment))
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let duplicate = matches!(
                &e,
                sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
            );
            if duplicate {
                DbError::AlreadyExists {
                    kind: "deployment",
                    id: deployment.id.to_string(),
                }
            } else {
                DbError::Query(e)
            }
        })?;

        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> Result<Deployment, DbError> {
        let row: Option<(Json<Deployment>,)> =
            sqlx::query_as("SELECT record FROM deployments WHERE id = $1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::Query)?;

        row.map(|(Json(deployment),)| deployment)
            .ok_or_else(|| DbError::deployment_not_found(id))
    }

    async fn list(&self) -> Result<Vec<Deployment>, DbError> {
        let rows: Vec<(Json<Deployment>,)> =
            sqlx::query_as("SELECT record FROM deployments ORDER BY created_at")
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::Query)?;

        Ok(rows.into_iter().map(|(Json(d),)| d).collect())
    }

    async fn update(&self, deployment: &Deployment) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET record = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(deployment.id.to_string())
        .bind(Json(deployment))
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DbError::deployment_not_found(deployment.id));
        }
        Ok(())
    }

    async fn delete(&self, id: &DeploymentId) -> Result<(), DbError> {
        let result = sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DbError::deployment_not_found(id));
        }
        Ok(())
    }
}

pub struct PgVault {
    pool: PgPool,
}

impl PgVault {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Vault for PgVault {
    async fn add_secret(&self, secret: &Secret) -> Result<SecretId, DbError> {
        let id = SecretId::new();
        sqlx::query("INSERT INTO secrets (id, secret) VALUES ($1, $2)")
            .bind(id.to_string())
            .bind(Json(secret))
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(id)
    }

    async fn get_secret(&self, id: &SecretId) -> Result<Secret, DbError> {
        let row: Option<(Json<Secret>,)> = sqlx::query_as("SELECT secret FROM secrets WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;

        row.map(|(Json(secret),)| secret)
            .ok_or_else(|| DbError::secret_not_found(id))
    }

    async fn update_secret(&self, id: &SecretId, secret: &Secret) -> Result<(), DbError> {
        let result =
            sqlx::query("UPDATE secrets SET secret = $2, updated_at = now() WHERE id = $1")
                .bind(id.to_string())
                .bind(Json(secret))
                .execute(&self.pool)
                .await
                .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DbError::secret_not_found(id));
        }
        Ok(())
    }

    async fn delete_secret(&self, id: &SecretId) -> Result<(), DbError> {
        let result = sqlx::query("DELETE FROM secrets WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DbError::secret_not_found(id));
        }
        Ok(())
    }
}
