use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{MediaRepo, RepoError};
use crate::domain::entities::MediaRecord;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct MediaRow {
    id: Uuid,
    public_id: String,
    original_name: String,
    mime_type: String,
    user_id: String,
    url: String,
    created_at: OffsetDateTime,
}

impl From<MediaRow> for MediaRecord {
    fn from(row: MediaRow) -> Self {
        Self {
            id: row.id,
            public_id: row.public_id,
            original_name: row.original_name,
            mime_type: row.mime_type,
            user_id: row.user_id,
            url: row.url,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl MediaRepo for PostgresRepositories {
    async fn insert_media(&self, record: &MediaRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO media (id, public_id, original_name, mime_type, user_id, url, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(&record.public_id)
        .bind(&record.original_name)
        .bind(&record.mime_type)
        .bind(&record.user_id)
        .bind(&record.url)
        .bind(record.created_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn find_media(&self, id: Uuid) -> Result<Option<MediaRecord>, RepoError> {
        let row = sqlx::query_as::<_, MediaRow>(
            r#"
            SELECT id, public_id, original_name, mime_type, user_id, url, created_at
            FROM media
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(MediaRecord::from))
    }

    async fn delete_media(&self, id: Uuid) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM media WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}
