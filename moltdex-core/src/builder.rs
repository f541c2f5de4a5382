//! Index builder
//!
//! Merges a sanitized fetch batch into a copy of the previous snapshot.
//! Agents are merged first, then posts, then author references are
//! resolved against the merged agent set. The result is verified before
//! it is handed back; the previous snapshot is never touched.
//!
//! The builder reads no clock and iterates only ordered maps, so the same
//! inputs always produce a byte-identical snapshot.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    Agent, FetchBatch, Post, RawAgent, RawPost, RawRecord, SanitizedRecord, Snapshot,
    SNAPSHOT_FORMAT_VERSION,
};

/// Errors from building a snapshot
#[derive(Debug, Error)]
pub enum BuildError {
    /// A structural invariant does not hold; indicates a logic defect
    #[error("Snapshot invariant violated: {0}")]
    Invariant(String),
}

/// What a build changed, for logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub agents_inserted: usize,
    pub agents_updated: usize,
    pub agents_unchanged: usize,
    pub posts_inserted: usize,
    /// Existing posts whose content changed
    pub posts_replaced: usize,
    /// Existing posts where only counters moved
    pub posts_refreshed: usize,
    pub posts_unchanged: usize,
    /// Posts flagged with an unresolved author in the output
    pub unresolved: usize,
}

/// How a merge affected one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Merge {
    Inserted,
    Replaced,
    Refreshed,
    Unchanged,
}

/// Build the next snapshot from `previous` and a sanitized batch
pub fn build(
    previous: Option<&Snapshot>,
    batch: FetchBatch<SanitizedRecord>,
) -> Result<Snapshot, BuildError> {
    build_with_stats(previous, batch).map(|(snapshot, _)| snapshot)
}

/// [`build`], also reporting what changed
pub fn build_with_stats(
    previous: Option<&Snapshot>,
    batch: FetchBatch<SanitizedRecord>,
) -> Result<(Snapshot, BuildStats), BuildError> {
    let mut stats = BuildStats::default();

    let mut agents: BTreeMap<String, Agent> = BTreeMap::new();
    let mut posts: BTreeMap<String, Post> = BTreeMap::new();
    // Carried records keep the text they were sanitized to on ingestion.
    // Rules added later only reach an old post when it is fetched again,
    // e.g. by `index --full`.
    if let Some(prev) = previous {
        for agent in &prev.agents {
            if agents.insert(agent.id.clone(), agent.clone()).is_some() {
                return Err(BuildError::Invariant(format!(
                    "previous snapshot holds agent {} twice",
                    agent.id
                )));
            }
        }
        for post in &prev.posts {
            if posts.insert(post.id.clone(), post.clone()).is_some() {
                return Err(BuildError::Invariant(format!(
                    "previous snapshot holds post {} twice",
                    post.id
                )));
            }
        }
    }

    let (raw_agents, raw_posts): (Vec<RawRecord>, Vec<RawRecord>) = batch
        .records
        .into_iter()
        .map(SanitizedRecord::into_inner)
        .partition(|r| matches!(r, RawRecord::Agent(_)));

    // Agents first so posts in this batch can resolve against them
    for record in raw_agents {
        if let RawRecord::Agent(raw) = record {
            match merge_agent(&mut agents, raw, batch.fetched_at) {
                Merge::Inserted => stats.agents_inserted += 1,
                Merge::Replaced | Merge::Refreshed => stats.agents_updated += 1,
                Merge::Unchanged => stats.agents_unchanged += 1,
            }
        }
    }

    for record in raw_posts {
        if let RawRecord::Post(raw) = record {
            match merge_post(&mut posts, raw) {
                Merge::Inserted => stats.posts_inserted += 1,
                Merge::Replaced => stats.posts_replaced += 1,
                Merge::Refreshed => stats.posts_refreshed += 1,
                Merge::Unchanged => stats.posts_unchanged += 1,
            }
        }
    }

    // Resolve authors and recount posts per agent
    for agent in agents.values_mut() {
        agent.post_count = 0;
    }
    for post in posts.values_mut() {
        let resolved = match post.author_id.as_deref() {
            Some(author) => match agents.get_mut(author) {
                Some(agent) => {
                    agent.post_count += 1;
                    true
                }
                None => false,
            },
            None => false,
        };
        post.author_unresolved = !resolved;
        if !resolved {
            stats.unresolved += 1;
            debug!(post = %post.id, author = ?post.author_id, "Author unresolved");
        }
    }

    let mut ranked: Vec<Post> = posts.into_values().collect();
    ranked.sort_by(Post::rank_cmp);

    let snapshot = Snapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        generated_at: batch.fetched_at,
        cursor: batch.next_cursor,
        posts: ranked,
        agents: agents.into_values().collect(),
    };
    snapshot.verify()?;

    info!(
        posts = snapshot.posts.len(),
        agents = snapshot.agents.len(),
        new_posts = stats.posts_inserted,
        replaced = stats.posts_replaced,
        refreshed = stats.posts_refreshed,
        unresolved = stats.unresolved,
        "Built snapshot"
    );

    Ok((snapshot, stats))
}

fn merge_agent(agents: &mut BTreeMap<String, Agent>, raw: RawAgent, fetched_at: DateTime<Utc>) -> Merge {
    match agents.get_mut(&raw.id) {
        Some(existing) => {
            let updated = Agent {
                id: raw.id,
                name: raw.name,
                bio: raw.bio.or_else(|| existing.bio.clone()),
                karma: raw.karma,
                follower_count: raw.follower_count,
                post_count: existing.post_count,
                first_seen: existing.first_seen,
            };
            if updated == *existing {
                Merge::Unchanged
            } else {
                *existing = updated;
                Merge::Replaced
            }
        }
        None => {
            let agent = Agent {
                id: raw.id.clone(),
                name: raw.name,
                bio: raw.bio,
                karma: raw.karma,
                follower_count: raw.follower_count,
                post_count: 0,
                first_seen: fetched_at,
            };
            agents.insert(raw.id, agent);
            Merge::Inserted
        }
    }
}

fn same_content(existing: &Post, raw: &RawPost) -> bool {
    existing.title == raw.title
        && existing.body == raw.body
        && existing.submolt == raw.submolt
        && existing.author_id == raw.author_id
        && existing.created_at == raw.created_at
}

fn merge_post(posts: &mut BTreeMap<String, Post>, raw: RawPost) -> Merge {
    match posts.get_mut(&raw.id) {
        Some(existing) if same_content(existing, &raw) => {
            // Counters drift over time even when the text does not
            if existing.upvotes == raw.upvotes
                && existing.downvotes == raw.downvotes
                && existing.comment_count == raw.comment_count
            {
                return Merge::Unchanged;
            }
            existing.upvotes = raw.upvotes;
            existing.downvotes = raw.downvotes;
            existing.comment_count = raw.comment_count;
            Merge::Refreshed
        }
        Some(existing) => {
            *existing = new_post(raw);
            Merge::Replaced
        }
        None => {
            posts.insert(raw.id.clone(), new_post(raw));
            Merge::Inserted
        }
    }
}

fn new_post(raw: RawPost) -> Post {
    Post {
        id: raw.id,
        author_id: raw.author_id,
        // recomputed once all agents are merged
        author_unresolved: true,
        title: raw.title,
        body: raw.body,
        submolt: raw.submolt,
        upvotes: raw.upvotes,
        downvotes: raw.downvotes,
        comment_count: raw.comment_count,
        created_at: raw.created_at,
    }
}
