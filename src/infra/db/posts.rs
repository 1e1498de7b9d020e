use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{PostPage, PostsRepo, RepoError};
use crate::domain::entities::PostRecord;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct PostRow {
    id: Uuid,
    user_id: String,
    content: String,
    media_ids: Vec<Uuid>,
    created_at: OffsetDateTime,
}

impl From<PostRow> for PostRecord {
    fn from(row: PostRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            content: row.content,
            media_ids: row.media_ids,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl PostsRepo for PostgresRepositories {
    async fn insert_post(&self, record: &PostRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, user_id, content, media_ids, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(&record.content)
        .bind(&record.media_ids)
        .bind(record.created_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn find_post(&self, id: Uuid) -> Result<Option<PostRecord>, RepoError> {
        let row = sqlx::query_as::<_, PostRow>(
            r#"
            SELECT id, user_id, content, media_ids, created_at
            FROM posts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(PostRecord::from))
    }

    async fn list_posts(&self, page: u32, limit: u32) -> Result<PostPage, RepoError> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        let rows = sqlx::query_as::<_, PostRow>(
            r#"
            SELECT id, user_id, content, media_ids, created_at
            FROM posts
            ORDER BY created_at DESC, seq DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(PostPage {
            items: rows.into_iter().map(PostRecord::from).collect(),
            page,
            limit,
            total: Self::convert_count(total)?,
        })
    }

    async fn delete_post(&self, id: Uuid, user_id: &str) -> Result<Option<PostRecord>, RepoError> {
        let row = sqlx::query_as::<_, PostRow>(
            r#"
            DELETE FROM posts
            WHERE id = $1 AND user_id = $2
            RETURNING id, user_id, content, media_ids, created_at
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(PostRecord::from))
    }
}
