//! Post invariants enforced before anything is persisted.

use std::ops::RangeInclusive;

use crate::domain::error::DomainError;

/// Accepted post length, counted in characters.
pub const CONTENT_LENGTH: RangeInclusive<usize> = 3..=5000;

/// Validate and normalize post content.
pub fn validate_content(content: &str) -> Result<String, DomainError> {
    let trimmed = content.trim();
    let length = trimmed.chars().count();
    if !CONTENT_LENGTH.contains(&length) {
        return Err(DomainError::validation(format!(
            "content must be between {} and {} characters, got {length}",
            CONTENT_LENGTH.start(),
            CONTENT_LENGTH.end()
        )));
    }
    Ok(trimmed.to_string())
}

/// Clamp pagination input the way the public listing expects it.
///
/// Pages are 1-based; a zero page or limit falls back to the defaults.
pub fn normalize_page(page: Option<u32>, limit: Option<u32>) -> (u32, u32) {
    let page = page.filter(|value| *value > 0).unwrap_or(1);
    let limit = limit.filter(|value| *value > 0).unwrap_or(10).min(100);
    (page, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_content() {
        let err = validate_content("  hi ").expect_err("too short");
        assert!(matches!(err, DomainError::Validation { .. }));
    }

    #[test]
    fn counts_characters_not_bytes() {
        assert!(validate_content("日本語").is_ok());
    }

    #[test]
    fn rejects_oversized_content() {
        let content = "a".repeat(5001);
        assert!(validate_content(&content).is_err());
    }

    #[test]
    fn page_defaults_apply_to_zero_and_missing_values() {
        assert_eq!(normalize_page(None, None), (1, 10));
        assert_eq!(normalize_page(Some(0), Some(0)), (1, 10));
        assert_eq!(normalize_page(Some(3), Some(500)), (3, 100));
    }
}
