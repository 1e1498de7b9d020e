//! Cache key definitions.
//!
//! Every cached value lives under a key rendered from [`CacheKey`]; every
//! namespace a write can invalidate is rendered from [`KeyPattern`]. Keeping
//! both in one place guarantees that a pattern covers the keys it is meant to.

use std::fmt;

use uuid::Uuid;

use super::pattern::escape_glob;

/// A single cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// One post by identifier: `post:<id>`.
    Post(Uuid),
    /// One page of the newest-first listing: `posts:<page>:<limit>`.
    PostList { page: u32, limit: u32 },
    /// A user's search results: `search:user:<user_id>:query:<query>`.
    Search { user_id: String, query: String },
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Post(id) => write!(f, "post:{id}"),
            CacheKey::PostList { page, limit } => write!(f, "posts:{page}:{limit}"),
            CacheKey::Search { user_id, query } => {
                write!(f, "search:user:{user_id}:query:{query}")
            }
        }
    }
}

/// A family of keys removed together by a pattern scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Every page of the post listing.
    AllPostLists,
    /// Every cached search of one user.
    UserSearches(String),
}

impl KeyPattern {
    /// Render the glob passed to `SCAN ... MATCH`.
    pub fn glob(&self) -> String {
        match self {
            KeyPattern::AllPostLists => "posts:*".to_string(),
            KeyPattern::UserSearches(user_id) => {
                format!("search:user:{}:query:*", escape_glob(user_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::glob_matches;

    #[test]
    fn keys_render_expected_namespaces() {
        assert_eq!(
            CacheKey::Post(Uuid::nil()).to_string(),
            "post:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            CacheKey::PostList { page: 2, limit: 10 }.to_string(),
            "posts:2:10"
        );
        assert_eq!(
            CacheKey::Search {
                user_id: "u1".to_string(),
                query: "rust".to_string()
            }
            .to_string(),
            "search:user:u1:query:rust"
        );
    }

    #[test]
    fn list_pattern_covers_lists_but_not_single_posts() {
        let glob = KeyPattern::AllPostLists.glob();
        let list = CacheKey::PostList { page: 1, limit: 10 }.to_string();
        let single = CacheKey::Post(Uuid::nil()).to_string();

        assert!(glob_matches(&glob, &list));
        assert!(!glob_matches(&glob, &single));
    }

    #[test]
    fn user_search_pattern_is_scoped_to_one_user() {
        let glob = KeyPattern::UserSearches("u1".to_string()).glob();
        let own = CacheKey::Search {
            user_id: "u1".to_string(),
            query: "q".to_string(),
        };
        let other = CacheKey::Search {
            user_id: "u2".to_string(),
            query: "q".to_string(),
        };

        assert!(glob_matches(&glob, &own.to_string()));
        assert!(!glob_matches(&glob, &other.to_string()));
    }
}
