//! Incremental feed fetcher
//!
//! Walks the newest-first post listings page by page until it reaches the
//! previous run's watermark, runs out of pages, or hits `max_pages`. The
//! global feed and the introductions submolt are independent sequential
//! walks, run concurrently and joined at the end.
//!
//! A walk cut short by `max_pages` leaves a [`Backlog`] on the feed's
//! mark. The next run resumes it before looking at the head again, so a
//! burst bigger than one run's budget is indexed over several runs
//! instead of being skipped.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, Stream, TryStreamExt};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use moltdex_core::{Backlog, Feed, FeedMark, FetchBatch, PostKey, RawRecord, Watermark};

use crate::{normalize_post, ApiClient, FetchConfig, FetchError, Normalized};

/// Anything that can produce the records added since a watermark
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_since(&self, cursor: &Watermark) -> Result<FetchBatch, FetchError>;
}

/// Where a page walk starts, what it keeps, and when it stops
#[derive(Debug, Clone)]
pub struct Walk {
    pub start_offset: usize,
    /// Stop at the first post at or behind this one
    pub stop_at: Option<PostKey>,
    /// Drop posts at or ahead of this one; they were fetched already
    pub skip_ahead_of: Option<PostKey>,
    pub max_pages: usize,
}

impl Walk {
    /// From the newest post down to `mark`
    pub fn head(mark: Option<&FeedMark>, max_pages: usize) -> Self {
        Self {
            start_offset: 0,
            stop_at: mark.map(FeedMark::key),
            skip_ahead_of: None,
            max_pages,
        }
    }

    /// Resume an unfinished gap
    pub fn backlog(gap: &Backlog, max_pages: usize) -> Self {
        Self {
            start_offset: gap.offset,
            stop_at: gap.floor.clone(),
            skip_ahead_of: gap.oldest.clone(),
            max_pages,
        }
    }
}

/// One decoded page of a feed
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub feed: Feed,
    /// Zero-based page number within the walk
    pub number: usize,
    /// Listing offset the page was requested at
    pub offset: usize,
    /// Posts the walk keeps, in API order
    pub entries: Vec<Normalized>,
    /// Malformed posts dropped from this page
    pub skipped: usize,
    /// The page contained a post at or behind the walk's stop point
    pub reached_mark: bool,
    pub has_more: bool,
    /// Nothing follows this page, whatever the page budget
    pub ends_walk: bool,
}

/// Everything fetched from one feed in a run
#[derive(Debug, Clone)]
pub struct FeedHarvest {
    pub feed: Feed,
    pub records: Vec<RawRecord>,
    /// Watermark to record for this feed
    pub next_mark: Option<FeedMark>,
    pub pages: usize,
    pub skipped: usize,
}

impl FeedHarvest {
    fn take_pages(&mut self, pages: Vec<FeedPage>, seen_agents: &mut HashSet<String>) {
        self.pages += pages.len();
        for page in pages {
            self.skipped += page.skipped;
            for Normalized { post, author } in page.entries {
                if let Some(mut agent) = author {
                    // First (newest) sighting of an agent in this feed wins
                    if seen_agents.insert(agent.id.clone()) {
                        if self.feed == Feed::Introductions && agent.bio.is_none() && !post.body.trim().is_empty() {
                            agent.bio = Some(post.body.clone());
                        }
                        self.records.push(RawRecord::Agent(agent));
                    }
                }
                self.records.push(RawRecord::Post(post));
            }
        }
    }
}

struct PageState {
    offset: usize,
    number: usize,
    done: bool,
}

fn entry_keys(pages: &[FeedPage]) -> impl Iterator<Item = PostKey> + '_ {
    pages
        .iter()
        .flat_map(|page| &page.entries)
        .map(|entry| PostKey::new(entry.post.created_at, entry.post.id.clone()))
}

fn newest_key(pages: &[FeedPage]) -> Option<PostKey> {
    entry_keys(pages).reduce(|a, b| if b.is_newer_than(&a) { b } else { a })
}

fn oldest_key(pages: &[FeedPage]) -> Option<PostKey> {
    entry_keys(pages).reduce(|a, b| if a.is_newer_than(&b) { b } else { a })
}

/// Moltbook fetcher
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: ApiClient,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        Ok(Self {
            client: ApiClient::new(config)?,
        })
    }

    pub fn config(&self) -> &FetchConfig {
        self.client.config()
    }

    /// Listing URL for a feed at `offset`
    pub fn feed_url(&self, feed: Feed, offset: usize) -> String {
        let config = self.config();
        let base = config.base_url.trim_end_matches('/');
        match feed {
            Feed::Posts => format!(
                "{}/posts?sort=new&limit={}&offset={}",
                base, config.page_size, offset
            ),
            Feed::Introductions => format!(
                "{}/submolts/{}/posts?sort=new&limit={}&offset={}",
                base,
                urlencoding::encode(&config.introductions_submolt),
                config.page_size,
                offset
            ),
        }
    }

    /// Lazy page stream for `feed` following `walk`.
    ///
    /// Each call starts a fresh walk. Dropping the stream between pages
    /// abandons the walk without side effects.
    pub fn pages(&self, feed: Feed, walk: Walk) -> impl Stream<Item = Result<FeedPage, FetchError>> + '_ {
        let initial = PageState {
            offset: walk.start_offset,
            number: 0,
            done: false,
        };

        stream::try_unfold(initial, move |state| {
            let walk = walk.clone();
            async move {
                if state.done || state.number >= walk.max_pages {
                    return Ok::<_, FetchError>(None);
                }

                let url = self.feed_url(feed, state.offset);
                let api_page = self.client.get_page(&url).await?;
                let raw_count = api_page.posts.len();

                let mut page = FeedPage {
                    feed,
                    number: state.number,
                    offset: state.offset,
                    entries: Vec::with_capacity(raw_count),
                    skipped: 0,
                    reached_mark: false,
                    has_more: api_page.has_more,
                    ends_walk: false,
                };

                for value in api_page.posts {
                    match normalize_post(value) {
                        Ok(entry) => {
                            let (id, created_at) = (&entry.post.id, entry.post.created_at);
                            if walk.stop_at.as_ref().is_some_and(|k| k.at_or_behind(id, created_at)) {
                                page.reached_mark = true;
                                continue;
                            }
                            if walk.skip_ahead_of.as_ref().is_some_and(|k| k.at_or_ahead(id, created_at)) {
                                continue;
                            }
                            page.entries.push(entry);
                        }
                        Err(e) => {
                            warn!(feed = %feed, page = state.number, error = %e, "Skipping malformed post");
                            page.skipped += 1;
                        }
                    }
                }
                page.ends_walk = raw_count == 0 || !page.has_more || page.reached_mark;

                debug!(
                    feed = %feed,
                    page = page.number,
                    offset = page.offset,
                    entries = page.entries.len(),
                    skipped = page.skipped,
                    reached_mark = page.reached_mark,
                    "Fetched page"
                );

                let next = PageState {
                    offset: state.offset + self.config().page_size,
                    number: state.number + 1,
                    done: page.ends_walk,
                };
                Ok::<_, FetchError>(Some((page, next)))
            }
        })
    }

    /// Offset to resume from if the walk ran out of budget before the feed
    /// ended it
    fn resume_offset(&self, pages: &[FeedPage]) -> Option<usize> {
        pages
            .last()
            .filter(|page| !page.ends_walk)
            .map(|page| page.offset + self.config().page_size)
    }

    /// Drain one feed since `mark`.
    ///
    /// An open backlog is resumed first. The head is only walked once the
    /// backlog is closed, with whatever page budget is left.
    pub async fn fetch_feed(
        &self,
        feed: Feed,
        mark: Option<&FeedMark>,
    ) -> Result<FeedHarvest, FetchError> {
        let mut remaining = self.config().max_pages;
        let mut gap_pages = Vec::new();
        let mut head_pages = Vec::new();
        let mut next_backlog = None;

        if let Some(gap) = mark.and_then(|m| m.backlog.as_ref()) {
            let pages: Vec<FeedPage> = self.pages(feed, Walk::backlog(gap, remaining)).try_collect().await?;
            remaining = remaining.saturating_sub(pages.len());
            if let Some(offset) = self.resume_offset(&pages) {
                next_backlog = Some(Backlog {
                    offset,
                    oldest: oldest_key(&pages).or_else(|| gap.oldest.clone()),
                    floor: gap.floor.clone(),
                });
            }
            gap_pages = pages;
        }

        if next_backlog.is_none() && remaining > 0 {
            let pages: Vec<FeedPage> = self.pages(feed, Walk::head(mark, remaining)).try_collect().await?;
            if let Some(offset) = self.resume_offset(&pages) {
                next_backlog = Some(Backlog {
                    offset,
                    oldest: oldest_key(&pages),
                    floor: mark.map(FeedMark::key),
                });
            }
            head_pages = pages;
        }

        let seen = [newest_key(&head_pages), newest_key(&gap_pages)]
            .into_iter()
            .flatten()
            .reduce(|a, b| if b.is_newer_than(&a) { b } else { a });
        let newest = match (mark.map(FeedMark::key), seen) {
            (Some(old), Some(seen)) => Some(if seen.is_newer_than(&old) { seen } else { old }),
            (old, seen) => old.or(seen),
        };

        if let Some(gap) = &next_backlog {
            info!(feed = %feed, offset = gap.offset, "Page budget spent; backlog left for the next run");
        }

        let mut harvest = FeedHarvest {
            feed,
            records: Vec::new(),
            next_mark: newest.map(|key| FeedMark::from_key(key, next_backlog)),
            pages: 0,
            skipped: 0,
        };
        let mut seen_agents: HashSet<String> = HashSet::new();
        harvest.take_pages(head_pages, &mut seen_agents);
        harvest.take_pages(gap_pages, &mut seen_agents);

        info!(
            feed = %feed,
            pages = harvest.pages,
            records = harvest.records.len(),
            skipped = harvest.skipped,
            "Feed fetched"
        );
        Ok(harvest)
    }
}

#[async_trait]
impl RecordSource for Fetcher {
    async fn fetch_since(&self, cursor: &Watermark) -> Result<FetchBatch, FetchError> {
        let (posts, introductions) = futures::try_join!(
            self.fetch_feed(Feed::Posts, cursor.mark(Feed::Posts)),
            self.fetch_feed(Feed::Introductions, cursor.mark(Feed::Introductions)),
        )?;

        let next_cursor = cursor
            .clone()
            .with_mark(Feed::Posts, posts.next_mark)
            .with_mark(Feed::Introductions, introductions.next_mark);

        // Introductions last so their profile text wins within the batch
        let mut records = posts.records;
        records.extend(introductions.records);

        Ok(FetchBatch {
            records,
            next_cursor,
            fetched_at: Utc::now(),
        })
    }
}
