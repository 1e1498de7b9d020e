//! Shared wire types for events published on the post exchange.
//!
//! Field names follow the JSON already produced by the post service
//! (`postID`, `userID`, `mediaIds`, `createdAt`), so payloads stay compatible
//! with consumers written against the same exchange.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Name of the topic exchange shared by every service.
pub const POST_EXCHANGE: &str = "post_exchange";

/// Routing key for [`PostCreated`].
pub const POST_CREATED: &str = "post.created";

/// Routing key for [`PostDeleted`].
pub const POST_DELETED: &str = "post.deleted";

/// Payload published after a post has been committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCreated {
    #[serde(rename = "postID")]
    pub post_id: Uuid,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub content: String,
    #[serde(rename = "createdAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Payload published after a post has been removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDeleted {
    #[serde(rename = "postID")]
    pub post_id: Uuid,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "mediaIds", default)]
    pub media_ids: Vec<Uuid>,
}

/// Any event understood by the pipeline, tagged with its routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    PostCreated(PostCreated),
    PostDeleted(PostDeleted),
}

impl DomainEvent {
    /// Routing key the event is published under.
    pub fn routing_key(&self) -> &'static str {
        match self {
            DomainEvent::PostCreated(_) => POST_CREATED,
            DomainEvent::PostDeleted(_) => POST_DELETED,
        }
    }

    /// Serialize the payload (without the routing key) to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            DomainEvent::PostCreated(event) => serde_json::to_vec(event),
            DomainEvent::PostDeleted(event) => serde_json::to_vec(event),
        }
    }

    /// Decode a payload that arrived under `routing_key`.
    ///
    /// Returns `Ok(None)` for routing keys this crate does not know about.
    pub fn from_json(routing_key: &str, body: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        match routing_key {
            POST_CREATED => serde_json::from_slice(body).map(|e| Some(DomainEvent::PostCreated(e))),
            POST_DELETED => serde_json::from_slice(body).map(|e| Some(DomainEvent::PostDeleted(e))),
            _ => Ok(None),
        }
    }

    /// Identifier of the post the event refers to.
    pub fn post_id(&self) -> Uuid {
        match self {
            DomainEvent::PostCreated(event) => event.post_id,
            DomainEvent::PostDeleted(event) => event.post_id,
        }
    }
}

impl From<PostCreated> for DomainEvent {
    fn from(event: PostCreated) -> Self {
        DomainEvent::PostCreated(event)
    }
}

impl From<PostDeleted> for DomainEvent {
    fn from(event: PostDeleted) -> Self {
        DomainEvent::PostDeleted(event)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn post_created_uses_wire_field_names() {
        let event = PostCreated {
            post_id: Uuid::nil(),
            user_id: "u-1".to_string(),
            content: "hello".to_string(),
            created_at: datetime!(2024-05-01 12:00 UTC),
        };

        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["postID"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(value["userID"], "u-1");
        assert_eq!(value["createdAt"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn post_deleted_defaults_missing_media_ids() {
        let body = br#"{"postID":"00000000-0000-0000-0000-000000000000","userID":"u-1"}"#;
        let event = DomainEvent::from_json(POST_DELETED, body)
            .expect("valid json")
            .expect("known key");

        match event {
            DomainEvent::PostDeleted(deleted) => assert!(deleted.media_ids.is_empty()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_routing_key_is_not_an_error() {
        let decoded = DomainEvent::from_json("comment.created", b"{}").expect("no error");
        assert!(decoded.is_none());
    }

    #[test]
    fn routing_key_follows_variant() {
        let deleted = DomainEvent::from(PostDeleted {
            post_id: Uuid::nil(),
            user_id: "u".to_string(),
            media_ids: vec![],
        });
        assert_eq!(deleted.routing_key(), POST_DELETED);
    }
}
