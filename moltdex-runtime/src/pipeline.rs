//! Indexing Pipeline
//!
//! One run is `previous snapshot -> fetch -> sanitize -> build -> publish`.
//! The run holds no state between invocations; whatever schedules it
//! just calls [`Indexer::run_once`] again. Any failure before the final
//! commit leaves the published snapshot exactly as it was.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use moltdex_core::{build_with_stats, BuildError, BuildStats, Sanitizer, Snapshot, Watermark};
use moltdex_fetch::{FetchError, Fetcher, RecordSource};

use crate::config::{ConfigError, IndexerConfig};
use crate::store::{SnapshotStore, StoreError};

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Build failed: {0}")]
    Build(#[from] BuildError),

    #[error("Snapshot store: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Whether a later run can be expected to succeed unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Fetch(e) => e.is_retryable(),
            PipelineError::Store(StoreError::Io { .. }) => true,
            _ => false,
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub snapshot: Snapshot,
    pub stats: BuildStats,
    /// Records returned by the source
    pub fetched: usize,
}

/// Fetch everything newer than `previous`, sanitize it and build the
/// next snapshot. Writes nothing.
///
/// With `full_refresh` the watermark is ignored and both feeds are walked
/// from the top; `previous` still supplies the existing records, and its
/// cursor is merged into the new one so a short walk never moves a mark
/// backwards.
pub async fn run<S>(
    source: &S,
    sanitizer: &Sanitizer,
    previous: Option<&Snapshot>,
    full_refresh: bool,
) -> Result<RunOutcome, PipelineError>
where
    S: RecordSource + ?Sized,
{
    let cursor = match previous {
        Some(snapshot) if !full_refresh => snapshot.cursor.clone(),
        _ => Watermark::default(),
    };

    let mut batch = source.fetch_since(&cursor).await?;
    if let Some(snapshot) = previous.filter(|_| full_refresh) {
        batch.next_cursor = batch.next_cursor.absorb(&snapshot.cursor);
    }
    let fetched = batch.records.len();
    info!(fetched, full_refresh, "Fetched records");

    let clean = sanitizer.sanitize_batch(batch);
    let (snapshot, stats) = build_with_stats(previous, clean)?;

    Ok(RunOutcome {
        snapshot,
        stats,
        fetched,
    })
}

/// Runs the pipeline against a snapshot store
pub struct Indexer<S> {
    source: S,
    sanitizer: Sanitizer,
    store: SnapshotStore,
}

impl Indexer<Fetcher> {
    /// Live indexer over the Moltbook API
    pub fn from_config(config: &IndexerConfig) -> Result<Self, PipelineError> {
        let fetcher = Fetcher::new(config.api.clone())?;
        let store = SnapshotStore::new(&config.store.data_dir).with_history(config.store.keep_history);
        Ok(Self::new(fetcher, config.sanitizer()?, store))
    }
}

impl<S: RecordSource> Indexer<S> {
    pub fn new(source: S, sanitizer: Sanitizer, store: SnapshotStore) -> Self {
        Self {
            source,
            sanitizer,
            store,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Run once and publish the result.
    ///
    /// On error nothing is written and the previous snapshot stays current.
    pub async fn run_once(&self, full_refresh: bool) -> Result<(RunOutcome, PathBuf), PipelineError> {
        let previous = self.store.load_current()?;

        let outcome = match run(&self.source, &self.sanitizer, previous.as_ref(), full_refresh).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Indexing run failed, keeping previous snapshot");
                return Err(e);
            }
        };

        let path = self.store.publish(&outcome.snapshot)?;
        info!(
            posts = outcome.snapshot.posts.len(),
            agents = outcome.snapshot.agents.len(),
            unresolved = outcome.stats.unresolved,
            "Indexing run complete"
        );
        Ok((outcome, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use moltdex_core::{Feed, FeedMark, FetchBatch, RawAgent, RawPost, RawRecord};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned batches and remembers the cursors it was asked for
    #[derive(Default)]
    struct ScriptedSource {
        batches: Mutex<VecDeque<Result<FetchBatch, FetchError>>>,
        cursors: Mutex<Vec<Watermark>>,
    }

    impl ScriptedSource {
        fn push(&self, batch: Result<FetchBatch, FetchError>) {
            self.batches.lock().unwrap().push_back(batch);
        }

        fn cursors(&self) -> Vec<Watermark> {
            self.cursors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordSource for ScriptedSource {
        async fn fetch_since(&self, cursor: &Watermark) -> Result<FetchBatch, FetchError> {
            self.cursors.lock().unwrap().push(cursor.clone());
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected fetch"))
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn raw_post(id: &str, author: &str, body: &str, upvotes: u64, created: i64) -> RawRecord {
        RawRecord::Post(RawPost {
            id: id.to_string(),
            author_id: Some(author.to_string()),
            title: None,
            body: body.to_string(),
            submolt: Some("general".to_string()),
            upvotes,
            downvotes: 0,
            comment_count: 0,
            created_at: ts(created),
        })
    }

    fn raw_agent(id: &str, name: &str) -> RawRecord {
        RawRecord::Agent(RawAgent {
            id: id.to_string(),
            name: name.to_string(),
            bio: None,
            karma: 3,
            follower_count: 0,
        })
    }

    fn batch(records: Vec<RawRecord>, newest: (&str, i64), fetched: i64) -> FetchBatch {
        let mark = FeedMark::new(ts(newest.1), newest.0);
        FetchBatch {
            records,
            next_cursor: Watermark::default().with_mark(Feed::Posts, Some(mark)),
            fetched_at: ts(fetched),
        }
    }

    fn indexer(dir: &std::path::Path) -> Indexer<ScriptedSource> {
        Indexer::new(ScriptedSource::default(), Sanitizer::default(), SnapshotStore::new(dir))
    }

    #[tokio::test]
    async fn test_first_run_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = indexer(dir.path());
        indexer.source.push(Ok(batch(
            vec![raw_agent("a1", "Clawd"), raw_post("p1", "a1", "hello molts", 5, 100)],
            ("p1", 100),
            1_000,
        )));

        let (outcome, path) = indexer.run_once(false).await.unwrap();
        assert_eq!(outcome.fetched, 2);
        assert_eq!(outcome.stats.posts_inserted, 1);
        assert_eq!(path, indexer.store().current_path());

        let published = indexer.store().load_current().unwrap().unwrap();
        assert_eq!(published, outcome.snapshot);
        assert_eq!(indexer.source.cursors(), vec![Watermark::default()]);
    }

    #[tokio::test]
    async fn test_second_run_resumes_from_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = indexer(dir.path());
        indexer.source.push(Ok(batch(
            vec![raw_agent("a1", "Clawd"), raw_post("p1", "a1", "hello", 5, 100)],
            ("p1", 100),
            1_000,
        )));
        indexer.source.push(Ok(batch(
            vec![raw_post("p1", "a1", "hello", 9, 100), raw_post("p2", "a1", "again", 1, 200)],
            ("p2", 200),
            2_000,
        )));

        let (first, _) = indexer.run_once(false).await.unwrap();
        let (second, _) = indexer.run_once(false).await.unwrap();

        let cursors = indexer.source.cursors();
        assert_eq!(cursors[1], first.snapshot.cursor);
        assert_eq!(second.snapshot.posts.len(), 2);
        assert_eq!(second.snapshot.post("p1").unwrap().upvotes, 9);
        assert_eq!(indexer.store().history().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_full_refresh_ignores_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = indexer(dir.path());
        indexer.source.push(Ok(batch(vec![raw_post("p1", "a1", "x", 1, 100)], ("p1", 100), 1_000)));
        indexer.source.push(Ok(batch(vec![], ("p1", 100), 2_000)));

        indexer.run_once(false).await.unwrap();
        let (outcome, _) = indexer.run_once(true).await.unwrap();

        assert_eq!(indexer.source.cursors()[1], Watermark::default());
        assert_eq!(outcome.snapshot.posts.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_full_refresh_keeps_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = indexer(dir.path());
        indexer.source.push(Ok(batch(vec![raw_post("p1", "a1", "x", 1, 100)], ("p1", 100), 1_000)));
        // the full walk came back empty-handed
        indexer.source.push(Ok(FetchBatch {
            records: vec![],
            next_cursor: Watermark::default(),
            fetched_at: ts(2_000),
        }));

        let (first, _) = indexer.run_once(false).await.unwrap();
        let (refreshed, _) = indexer.run_once(true).await.unwrap();

        assert_eq!(refreshed.snapshot.cursor, first.snapshot.cursor);
        assert_eq!(refreshed.snapshot.cursor.posts.unwrap().newest_id, "p1");
    }

    #[tokio::test]
    async fn test_failed_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = indexer(dir.path());
        indexer.source.push(Ok(batch(
            vec![raw_agent("a1", "Clawd"), raw_post("p1", "a1", "hello", 5, 100)],
            ("p1", 100),
            1_000,
        )));
        indexer.source.push(Err(FetchError::RateLimited {
            url: "https://example.test/posts".to_string(),
            attempts: 5,
        }));

        let (first, _) = indexer.run_once(false).await.unwrap();
        let before = std::fs::read(indexer.store().current_path()).unwrap();

        let err = indexer.run_once(false).await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(_)));
        assert!(err.is_retryable());

        let after = std::fs::read(indexer.store().current_path()).unwrap();
        assert_eq!(before, after);
        assert_eq!(indexer.store().load_current().unwrap(), Some(first.snapshot));
        assert_eq!(indexer.store().history().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_first_run_leaves_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = indexer(dir.path());
        indexer.source.push(Err(FetchError::Status {
            url: "https://example.test/posts".to_string(),
            status: 404,
        }));

        let err = indexer.run_once(false).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(indexer.store().load_current().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_published_snapshot_has_no_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = indexer(dir.path());
        let key = "sk-ant-REDACTED";
        indexer.source.push(Ok(batch(
            vec![raw_post("p1", "a1", &format!("oops my key is {}", key), 1, 100)],
            ("p1", 100),
            1_000,
        )));

        indexer.run_once(false).await.unwrap();
        let bytes = std::fs::read(indexer.store().current_path()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains(key));
        assert!(text.contains("oops my key is"));
    }

    #[tokio::test]
    async fn test_corrupt_previous_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = indexer(dir.path());
        std::fs::write(indexer.store().current_path(), b"not json").unwrap();

        let err = indexer.run_once(false).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Decode { .. })));
        assert!(indexer.source.cursors().is_empty());
        assert_eq!(std::fs::read(indexer.store().current_path()).unwrap(), b"not json");
    }

    #[tokio::test]
    async fn test_run_is_pure() {
        let source = ScriptedSource::default();
        let records = vec![raw_agent("a1", "Clawd"), raw_post("p1", "a1", "hello", 5, 100)];
        source.push(Ok(batch(records.clone(), ("p1", 100), 1_000)));
        source.push(Ok(batch(records, ("p1", 100), 1_000)));

        let sanitizer = Sanitizer::default();
        let a = run(&source, &sanitizer, None, false).await.unwrap();
        let b = run(&source, &sanitizer, None, false).await.unwrap();
        assert_eq!(a.snapshot, b.snapshot);
    }
}
