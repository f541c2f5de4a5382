//! Moltbook API payloads and their normalization into raw records
//!
//! Pages are decoded leniently: each post stays a JSON value until it is
//! normalized on its own, so one malformed post never fails its page.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use moltdex_core::{RawAgent, RawPost};

/// One page of a post listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiPage {
    #[serde(default)]
    pub posts: Vec<serde_json::Value>,
    #[serde(default)]
    pub has_more: bool,
}

/// A post as the API returns it
#[derive(Debug, Clone, Deserialize)]
pub struct ApiPost {
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub upvotes: Option<i64>,
    #[serde(default)]
    pub downvotes: Option<i64>,
    #[serde(default)]
    pub comment_count: Option<i64>,
    pub created_at: Option<String>,
    #[serde(default)]
    pub author: Option<ApiAuthor>,
    #[serde(default)]
    pub submolt: Option<ApiSubmolt>,
}

/// Author object embedded in a post
#[derive(Debug, Clone, Deserialize)]
pub struct ApiAuthor {
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub karma: Option<i64>,
    #[serde(default)]
    pub follower_count: Option<i64>,
}

/// Submolt reference; either `{"name": ...}` or a bare string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiSubmolt {
    Named { name: Option<String> },
    Plain(String),
}

impl ApiSubmolt {
    pub fn name(self) -> Option<String> {
        match self {
            ApiSubmolt::Named { name } => name,
            ApiSubmolt::Plain(name) => Some(name),
        }
    }
}

/// Why a post was skipped
#[derive(Debug, Error)]
pub enum MalformedRecord {
    #[error("post does not decode: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("post is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("post {id} has unparseable created_at '{value}'")]
    InvalidTimestamp { id: String, value: String },
}

/// A post plus, when the API embedded one, its author profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub post: RawPost,
    pub author: Option<RawAgent>,
}

/// Parse RFC 3339, falling back to a zone-less ISO timestamp taken as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn count(value: Option<i64>) -> u64 {
    value.map(|n| n.max(0) as u64).unwrap_or(0)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Normalize one post value from a page
pub fn normalize_post(value: serde_json::Value) -> Result<Normalized, MalformedRecord> {
    let api: ApiPost = serde_json::from_value(value)?;

    let id = non_empty(api.id).ok_or(MalformedRecord::MissingField("id"))?;
    let raw_ts = api.created_at.ok_or(MalformedRecord::MissingField("created_at"))?;
    let created_at = parse_timestamp(&raw_ts).ok_or_else(|| MalformedRecord::InvalidTimestamp {
        id: id.clone(),
        value: raw_ts.clone(),
    })?;

    let (author_id, author) = match api.author {
        Some(author) => {
            let author_id = non_empty(author.id);
            let profile = match (&author_id, non_empty(author.name)) {
                (Some(agent_id), Some(name)) => Some(RawAgent {
                    id: agent_id.clone(),
                    name,
                    bio: non_empty(author.description),
                    karma: author.karma.unwrap_or(0),
                    follower_count: count(author.follower_count),
                }),
                _ => None,
            };
            (author_id, profile)
        }
        None => (None, None),
    };

    let post = RawPost {
        id,
        author_id,
        title: non_empty(api.title),
        body: api.content.unwrap_or_default(),
        submolt: api.submolt.and_then(ApiSubmolt::name),
        upvotes: count(api.upvotes),
        downvotes: count(api.downvotes),
        comment_count: count(api.comment_count),
        created_at,
    };

    Ok(Normalized { post, author })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_full_post() {
        let value = json!({
            "id": "p1",
            "title": "Hello",
            "content": "First post!",
            "upvotes": 12,
            "downvotes": 1,
            "comment_count": 3,
            "created_at": "2026-01-30T12:34:56.789+00:00",
            "author": {"id": "a1", "name": "Clawd", "karma": 42, "follower_count": 7,
                       "description": "A helpful lobster"},
            "submolt": {"name": "general", "display_name": "General"},
            "url": null
        });

        let n = normalize_post(value).unwrap();
        assert_eq!(n.post.id, "p1");
        assert_eq!(n.post.title.as_deref(), Some("Hello"));
        assert_eq!(n.post.submolt.as_deref(), Some("general"));
        assert_eq!(n.post.upvotes, 12);
        assert_eq!(n.post.author_id.as_deref(), Some("a1"));
        let author = n.author.unwrap();
        assert_eq!(author.name, "Clawd");
        assert_eq!(author.karma, 42);
        assert_eq!(author.bio.as_deref(), Some("A helpful lobster"));
    }

    #[test]
    fn test_missing_id_is_malformed() {
        let value = json!({"content": "x", "created_at": "2026-01-30T12:00:00Z"});
        assert!(matches!(normalize_post(value), Err(MalformedRecord::MissingField("id"))));
    }

    #[test]
    fn test_missing_created_at_is_malformed() {
        let value = json!({"id": "p1", "content": "x"});
        assert!(matches!(
            normalize_post(value),
            Err(MalformedRecord::MissingField("created_at"))
        ));
    }

    #[test]
    fn test_bad_timestamp_is_malformed() {
        let value = json!({"id": "p1", "created_at": "yesterday"});
        assert!(matches!(
            normalize_post(value),
            Err(MalformedRecord::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_wrong_type_is_malformed() {
        let value = json!({"id": "p1", "created_at": "2026-01-30T12:00:00Z", "upvotes": "many"});
        assert!(matches!(normalize_post(value), Err(MalformedRecord::Shape(_))));
    }

    #[test]
    fn test_author_without_name_gives_no_profile() {
        let value = json!({
            "id": "p1", "created_at": "2026-01-30T12:00:00Z",
            "author": {"id": "a9", "name": null}
        });
        let n = normalize_post(value).unwrap();
        assert_eq!(n.post.author_id.as_deref(), Some("a9"));
        assert!(n.author.is_none());
    }

    #[test]
    fn test_negative_counts_clamp_to_zero() {
        let value = json!({"id": "p1", "created_at": "2026-01-30T12:00:00Z", "upvotes": -4});
        assert_eq!(normalize_post(value).unwrap().post.upvotes, 0);
    }

    #[test]
    fn test_plain_string_submolt() {
        let value = json!({"id": "p1", "created_at": "2026-01-30T12:00:00Z", "submolt": "todayilearned"});
        assert_eq!(normalize_post(value).unwrap().post.submolt.as_deref(), Some("todayilearned"));
    }

    #[test]
    fn test_parse_naive_timestamp() {
        let ts = parse_timestamp("2026-01-30T12:00:00.123456").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-01-30T12:00:00.123456+00:00");
    }
}
