use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{RepoError, SearchRepo};
use crate::domain::entities::SearchDocument;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct SearchDocumentRow {
    post_id: Uuid,
    user_id: String,
    content: String,
    created_at: OffsetDateTime,
}

impl From<SearchDocumentRow> for SearchDocument {
    fn from(row: SearchDocumentRow) -> Self {
        Self {
            post_id: row.post_id,
            user_id: row.user_id,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl SearchRepo for PostgresRepositories {
    async fn insert_document(&self, document: &SearchDocument) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            INSERT INTO search_documents (post_id, user_id, content, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (post_id) DO NOTHING
            "#,
        )
        .bind(document.post_id)
        .bind(&document.user_id)
        .bind(&document.content)
        .bind(document.created_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_document(&self, post_id: Uuid, user_id: &str) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM search_documents WHERE post_id = $1 AND user_id = $2")
            .bind(post_id)
            .bind(user_id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn search_documents(
        &self,
        user_id: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<SearchDocument>, RepoError> {
        let rows = sqlx::query_as::<_, SearchDocumentRow>(
            r#"
            SELECT post_id, user_id, content, created_at
            FROM search_documents
            WHERE user_id = $1
              AND to_tsvector('english', content) @@ plainto_tsquery('english', $2)
            ORDER BY ts_rank(to_tsvector('english', content), plainto_tsquery('english', $2)) DESC,
                     created_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(query)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(SearchDocument::from).collect())
    }
}
