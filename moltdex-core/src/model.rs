//! Index domain model
//!
//! Posts and agents as they live inside a published snapshot, the raw
//! records the fetcher hands over, and the per-feed watermark used to
//! resume pagination incrementally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::{BuildError, SNAPSHOT_FORMAT_VERSION};

/// A post stored in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Platform identifier, stable across runs
    pub id: String,
    /// Author agent identifier, if the platform reported one
    pub author_id: Option<String>,
    /// Set when `author_id` does not resolve to an agent in the snapshot
    #[serde(default)]
    pub author_unresolved: bool,
    /// Sanitized title
    #[serde(default)]
    pub title: Option<String>,
    /// Sanitized body text
    pub body: String,
    /// Submolt (category) label
    #[serde(default)]
    pub submolt: Option<String>,
    pub upvotes: u64,
    #[serde(default)]
    pub downvotes: u64,
    #[serde(default)]
    pub comment_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Post {
    /// Ranking order: upvotes descending, then newest first, then id.
    ///
    /// Total over posts with distinct ids.
    pub fn rank_cmp(&self, other: &Post) -> Ordering {
        other
            .upvotes
            .cmp(&self.upvotes)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// An agent (author) profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Platform identifier
    pub id: String,
    /// Display name / handle
    pub name: String,
    /// Sanitized profile text
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub karma: i64,
    #[serde(default)]
    pub follower_count: u64,
    /// Number of posts in the snapshot authored by this agent
    #[serde(default)]
    pub post_count: u64,
    /// Generation time of the first snapshot containing this agent
    pub first_seen: DateTime<Utc>,
}

/// Source feeds paginated by the fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    /// Global post feed, newest first
    Posts,
    /// The introductions submolt, source of agent bios
    Introductions,
}

impl std::fmt::Display for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feed::Posts => write!(f, "posts"),
            Feed::Introductions => write!(f, "introductions"),
        }
    }
}

/// Position of a post in a newest-first listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostKey {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl PostKey {
    pub fn new(created_at: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            created_at,
            id: id.into(),
        }
    }

    /// True for this post and anything created strictly before it.
    pub fn at_or_behind(&self, id: &str, created_at: DateTime<Utc>) -> bool {
        created_at < self.created_at || id == self.id
    }

    /// True for this post and anything created strictly after it.
    pub fn at_or_ahead(&self, id: &str, created_at: DateTime<Utc>) -> bool {
        created_at > self.created_at || id == self.id
    }

    pub fn is_newer_than(&self, other: &PostKey) -> bool {
        (&self.created_at, &self.id) > (&other.created_at, &other.id)
    }
}

/// Stretch of a feed that a walk cut short by `max_pages` left behind.
///
/// Everything behind `oldest` and ahead of `floor` is still unfetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlog {
    /// Listing offset of the first page not yet walked
    pub offset: usize,
    /// Oldest post fetched so far, if any
    #[serde(default)]
    pub oldest: Option<PostKey>,
    /// Newest post fetched before the gap opened; `None` runs to the end
    /// of the feed
    #[serde(default)]
    pub floor: Option<PostKey>,
}

/// Newest post seen on a feed, plus any gap still to fill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMark {
    pub newest_created_at: DateTime<Utc>,
    pub newest_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog: Option<Backlog>,
}

impl FeedMark {
    pub fn new(newest_created_at: DateTime<Utc>, newest_id: impl Into<String>) -> Self {
        Self {
            newest_created_at,
            newest_id: newest_id.into(),
            backlog: None,
        }
    }

    pub fn from_key(key: PostKey, backlog: Option<Backlog>) -> Self {
        Self {
            newest_created_at: key.created_at,
            newest_id: key.id,
            backlog,
        }
    }

    pub fn key(&self) -> PostKey {
        PostKey::new(self.newest_created_at, self.newest_id.clone())
    }

    /// True if a post is at or behind the newest mark.
    ///
    /// Posts behind the mark may still sit in the backlog.
    pub fn covers(&self, id: &str, created_at: DateTime<Utc>) -> bool {
        created_at < self.newest_created_at || id == self.newest_id
    }

    /// Combine the mark of a walk that ignored `previous` with it.
    ///
    /// The newer head wins. A gap the new walk left open ends where
    /// `previous` had already fetched down to.
    pub fn absorb(self, previous: &FeedMark) -> FeedMark {
        let (fresh, old) = (self.key(), previous.key());
        let newest = if old.is_newer_than(&fresh) { old } else { fresh };
        let backlog = self.backlog.map(|gap| Backlog {
            floor: match &previous.backlog {
                Some(open) => open.floor.clone(),
                None => Some(previous.key()),
            },
            ..gap
        });
        FeedMark::from_key(newest, backlog)
    }
}

/// Opaque fetch progress, one mark per feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    #[serde(default)]
    pub posts: Option<FeedMark>,
    #[serde(default)]
    pub introductions: Option<FeedMark>,
}

impl Watermark {
    pub fn mark(&self, feed: Feed) -> Option<&FeedMark> {
        match feed {
            Feed::Posts => self.posts.as_ref(),
            Feed::Introductions => self.introductions.as_ref(),
        }
    }

    pub fn with_mark(mut self, feed: Feed, mark: Option<FeedMark>) -> Self {
        match feed {
            Feed::Posts => self.posts = mark,
            Feed::Introductions => self.introductions = mark,
        }
        self
    }

    /// Per-feed [`FeedMark::absorb`]; feeds with no new mark keep the old one
    pub fn absorb(self, previous: &Watermark) -> Watermark {
        fn merge(fresh: Option<FeedMark>, old: Option<&FeedMark>) -> Option<FeedMark> {
            match (fresh, old) {
                (Some(fresh), Some(old)) => Some(fresh.absorb(old)),
                (None, old) => old.cloned(),
                (fresh, None) => fresh,
            }
        }

        Watermark {
            posts: merge(self.posts, previous.posts.as_ref()),
            introductions: merge(self.introductions, previous.introductions.as_ref()),
        }
    }
}

/// Raw post as produced by the fetcher (unsanitized)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPost {
    pub id: String,
    pub author_id: Option<String>,
    pub title: Option<String>,
    pub body: String,
    pub submolt: Option<String>,
    pub upvotes: u64,
    pub downvotes: u64,
    pub comment_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Raw agent profile as produced by the fetcher (unsanitized)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAgent {
    pub id: String,
    pub name: String,
    pub bio: Option<String>,
    pub karma: i64,
    pub follower_count: u64,
}

/// A fetched record of either kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    Post(RawPost),
    Agent(RawAgent),
}

impl RawRecord {
    pub fn id(&self) -> &str {
        match self {
            RawRecord::Post(p) => &p.id,
            RawRecord::Agent(a) => &a.id,
        }
    }
}

/// Everything one fetch run produced
#[derive(Debug, Clone)]
pub struct FetchBatch<R = RawRecord> {
    pub records: Vec<R>,
    /// Watermark to store in the next snapshot
    pub next_cursor: Watermark,
    /// When the fetch ran; becomes the snapshot's generation time
    pub fetched_at: DateTime<Utc>,
}

/// One immutable, published version of the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub cursor: Watermark,
    /// Posts in ranking order
    #[serde(default)]
    pub posts: Vec<Post>,
    /// Agents ordered by id
    #[serde(default)]
    pub agents: Vec<Agent>,
}

fn default_format_version() -> u32 {
    SNAPSHOT_FORMAT_VERSION
}

impl Snapshot {
    /// An empty snapshot, the implicit predecessor of the first run
    pub fn empty(generated_at: DateTime<Utc>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            generated_at,
            cursor: Watermark::default(),
            posts: Vec::new(),
            agents: Vec::new(),
        }
    }

    pub fn post(&self, id: &str) -> Option<&Post> {
        self.posts.iter().find(|p| p.id == id)
    }

    /// Agents are kept sorted by id
    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents
            .binary_search_by(|a| a.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.agents[idx])
    }

    pub fn unresolved_count(&self) -> usize {
        self.posts.iter().filter(|p| p.author_unresolved).count()
    }

    /// Canonical JSON encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// SHA-256 of the canonical encoding, hex encoded
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let bytes = self.to_bytes()?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Check the structural invariants every published snapshot must hold.
    pub fn verify(&self) -> Result<(), BuildError> {
        let mut agent_ids: HashSet<&str> = HashSet::with_capacity(self.agents.len());
        for agent in &self.agents {
            if !agent_ids.insert(&agent.id) {
                return Err(BuildError::Invariant(format!("duplicate agent id {}", agent.id)));
            }
        }

        let mut post_ids: HashSet<&str> = HashSet::with_capacity(self.posts.len());
        for post in &self.posts {
            if !post_ids.insert(&post.id) {
                return Err(BuildError::Invariant(format!("duplicate post id {}", post.id)));
            }
            if post.author_unresolved {
                continue;
            }
            match &post.author_id {
                Some(author) if agent_ids.contains(author.as_str()) => {}
                Some(author) => {
                    return Err(BuildError::Invariant(format!(
                        "post {} references missing agent {} without being flagged",
                        post.id, author
                    )))
                }
                None => {
                    return Err(BuildError::Invariant(format!(
                        "post {} has no author but is not flagged unresolved",
                        post.id
                    )))
                }
            }
        }

        if self.agents.windows(2).any(|w| w[0].id >= w[1].id) {
            return Err(BuildError::Invariant("agents are not ordered by id".to_string()));
        }
        if self.posts.windows(2).any(|w| w[0].rank_cmp(&w[1]) != Ordering::Less) {
            return Err(BuildError::Invariant("posts are not in ranking order".to_string()));
        }

        Ok(())
    }
}
