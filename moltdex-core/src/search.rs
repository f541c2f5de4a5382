//! Keyword search over a loaded snapshot
//!
//! Conjunctive substring matching: every query token must appear in the
//! post's searchable text. Results come back in the snapshot's ranking
//! order (upvotes, then recency, then id), so the same query against the
//! same snapshot always yields the same sequence.

use std::collections::HashMap;

use crate::{Agent, Post, Snapshot};

/// Split a query into lowercase keyword tokens.
///
/// Any character that is not a letter or digit separates tokens, so
/// `rust's` yields `rust` and `s`. Each token is lowercased as a whole
/// string, the same way post text is. Duplicates are dropped, first
/// occurrence wins.
pub fn tokenize(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for word in query.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let token = word.to_lowercase();
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

fn matches_all(haystack: &str, tokens: &[String]) -> bool {
    tokens.iter().all(|t| haystack.contains(t.as_str()))
}

/// One-shot search; builds a [`SearchEngine`] for a single query
pub fn search<'a>(snapshot: &'a Snapshot, query: &str) -> Vec<&'a Post> {
    let haystacks = post_haystacks(snapshot);
    let tokens = tokenize(query);
    ranked_posts(snapshot)
        .into_iter()
        .filter(|(idx, _)| matches_all(&haystacks[*idx], &tokens))
        .map(|(_, post)| post)
        .collect()
}

/// Lowercased body, title and resolved author name, one per post
fn post_haystacks(snapshot: &Snapshot) -> Vec<String> {
    let names: HashMap<&str, &str> = snapshot
        .agents
        .iter()
        .map(|a| (a.id.as_str(), a.name.as_str()))
        .collect();

    snapshot
        .posts
        .iter()
        .map(|post| {
            let mut text = post.body.to_lowercase();
            if let Some(title) = &post.title {
                text.push('\n');
                text.push_str(&title.to_lowercase());
            }
            if !post.author_unresolved {
                if let Some(name) = post.author_id.as_deref().and_then(|id| names.get(id)) {
                    text.push('\n');
                    text.push_str(&name.to_lowercase());
                }
            }
            text
        })
        .collect()
}

/// Posts with their snapshot index, in ranking order
fn ranked_posts(snapshot: &Snapshot) -> Vec<(usize, &Post)> {
    let mut ranked: Vec<(usize, &Post)> = snapshot.posts.iter().enumerate().collect();
    ranked.sort_by(|a, b| a.1.rank_cmp(b.1));
    ranked
}

/// A snapshot prepared for repeated queries.
///
/// Immutable after construction; share it across threads freely.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    snapshot: Snapshot,
    /// Post indices in ranking order
    order: Vec<usize>,
    /// Haystack per post, aligned with `snapshot.posts`
    haystacks: Vec<String>,
    /// Agent indices ordered by karma desc, then id
    agent_order: Vec<usize>,
    agent_haystacks: Vec<String>,
}

impl SearchEngine {
    pub fn new(snapshot: Snapshot) -> Self {
        let haystacks = post_haystacks(&snapshot);
        let order = ranked_posts(&snapshot).into_iter().map(|(idx, _)| idx).collect();

        let agent_haystacks = snapshot
            .agents
            .iter()
            .map(|agent| {
                let mut text = format!("{}\n{}", agent.name, agent.id).to_lowercase();
                if let Some(bio) = &agent.bio {
                    text.push('\n');
                    text.push_str(&bio.to_lowercase());
                }
                text
            })
            .collect();

        let mut agent_order: Vec<usize> = (0..snapshot.agents.len()).collect();
        agent_order.sort_by(|&a, &b| {
            let (a, b) = (&snapshot.agents[a], &snapshot.agents[b]);
            b.karma.cmp(&a.karma).then_with(|| a.id.cmp(&b.id))
        });

        Self {
            snapshot,
            order,
            haystacks,
            agent_order,
            agent_haystacks,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Posts matching every token of `query`, best first.
    ///
    /// An empty query returns every post.
    pub fn search(&self, query: &str) -> Vec<&Post> {
        let tokens = tokenize(query);
        self.order
            .iter()
            .filter(|&&idx| matches_all(&self.haystacks[idx], &tokens))
            .map(|&idx| &self.snapshot.posts[idx])
            .collect()
    }

    /// Agents whose name, handle or bio contains every token of `query`
    pub fn search_agents(&self, query: &str) -> Vec<&Agent> {
        let tokens = tokenize(query);
        self.agent_order
            .iter()
            .filter(|&&idx| matches_all(&self.agent_haystacks[idx], &tokens))
            .map(|&idx| &self.snapshot.agents[idx])
            .collect()
    }

    /// Display name of a post's resolved author
    pub fn author_name(&self, post: &Post) -> Option<&str> {
        if post.author_unresolved {
            return None;
        }
        post.author_id
            .as_deref()
            .and_then(|id| self.snapshot.agent(id))
            .map(|a| a.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn post(id: &str, author: Option<&str>, body: &str, upvotes: u64, created: i64) -> Post {
        Post {
            id: id.to_string(),
            author_id: author.map(str::to_string),
            author_unresolved: author.is_none(),
            title: None,
            body: body.to_string(),
            submolt: None,
            upvotes,
            downvotes: 0,
            comment_count: 0,
            created_at: Utc.timestamp_opt(created, 0).unwrap(),
        }
    }

    fn agent(id: &str, name: &str, karma: i64, bio: Option<&str>) -> Agent {
        Agent {
            id: id.to_string(),
            name: name.to_string(),
            bio: bio.map(str::to_string),
            karma,
            follower_count: 0,
            post_count: 0,
            first_seen: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    fn snapshot(posts: Vec<Post>, agents: Vec<Agent>) -> Snapshot {
        let mut snapshot = Snapshot::empty(Utc.timestamp_opt(0, 0).unwrap());
        snapshot.posts = posts;
        snapshot.agents = agents;
        snapshot
    }

    fn ids(posts: &[&Post]) -> Vec<String> {
        posts.iter().map(|p| p.id.clone()).collect()
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("  Mesh, NETWORKS!  mesh "), vec!["mesh", "networks"]);
        assert_eq!(tokenize("..."), Vec::<String>::new());
        assert_eq!(tokenize("rust's async/await"), vec!["rust", "s", "async", "await"]);
        assert_eq!(tokenize("e-mail"), vec!["e", "mail"]);
        assert_eq!(tokenize("ΟΔΟΣ"), vec!["οδος"]);
    }

    #[test]
    fn test_punctuated_queries_match_the_text_they_came_from() {
        let snap = snapshot(
            vec![
                post("p1", None, "Notes on Rust's borrow checker", 3, 100),
                post("p2", None, "async/await in practice", 2, 100),
                post("p3", None, "send me an e-mail", 1, 100),
                post("p4", None, "lobster molting season", 0, 100),
            ],
            vec![],
        );
        assert_eq!(ids(&search(&snap, "rust's")), vec!["p1"]);
        assert_eq!(ids(&search(&snap, "async/await")), vec!["p2"]);
        assert_eq!(ids(&search(&snap, "e-mail")), vec!["p3"]);
    }

    #[test]
    fn test_final_sigma_matches() {
        let snap = snapshot(
            vec![
                post("p1", None, "Η ΟΔΟΣ ΤΟΥ ΚΑΒΟΥΡΑ", 1, 100),
                post("p2", None, "unrelated", 1, 100),
            ],
            vec![],
        );
        assert_eq!(ids(&search(&snap, "ΟΔΟΣ")), vec!["p1"]);
        assert_eq!(ids(&search(&snap, "οδος")), vec!["p1"]);
    }

    #[test]
    fn test_ranking_upvotes_then_recency() {
        let snap = snapshot(
            vec![
                post("A", None, "lobster talk", 10, 300),
                post("C", None, "lobster talk", 20, 100),
                post("B", None, "lobster talk", 20, 200),
            ],
            vec![],
        );

        assert_eq!(ids(&search(&snap, "lobster")), vec!["B", "C", "A"]);
        let engine = SearchEngine::new(snap);
        assert_eq!(ids(&engine.search("lobster")), vec!["B", "C", "A"]);
    }

    #[test]
    fn test_conjunctive_match() {
        let snap = snapshot(
            vec![
                post("only-mesh", None, "a mesh of agents", 1, 1),
                post("both", None, "Networks are a MESH.", 1, 2),
                post("reversed", None, "networks ... and then mesh", 1, 3),
            ],
            vec![],
        );
        let engine = SearchEngine::new(snap);

        let found = ids(&engine.search("mesh networks"));
        assert!(!found.contains(&"only-mesh".to_string()));
        assert!(found.contains(&"both".to_string()));
        assert!(found.contains(&"reversed".to_string()));
    }

    #[test]
    fn test_empty_query_browses_everything() {
        let snap = snapshot(
            vec![
                post("x", None, "one", 1, 1),
                post("y", None, "two", 5, 1),
                post("z", None, "three", 3, 1),
            ],
            vec![],
        );
        let engine = SearchEngine::new(snap);

        let all = engine.search("");
        assert_eq!(all.len(), 3);
        assert_eq!(ids(&all), vec!["y", "z", "x"]);
        assert_eq!(engine.search("   !! ").len(), 3);
    }

    #[test]
    fn test_no_match_is_empty() {
        let snap = snapshot(vec![post("x", None, "one", 1, 1)], vec![]);
        assert!(search(&snap, "absent").is_empty());
    }

    #[test]
    fn test_matches_resolved_author_name() {
        let snap = snapshot(
            vec![
                post("by-clawd", Some("a1"), "hello world", 1, 1),
                post("orphan", None, "hello world", 1, 2),
            ],
            vec![agent("a1", "Clawdius", 0, None)],
        );
        let engine = SearchEngine::new(snap);

        assert_eq!(ids(&engine.search("clawdius hello")), vec!["by-clawd"]);
        assert_eq!(engine.author_name(&engine.snapshot().posts[0]), Some("Clawdius"));
    }

    #[test]
    fn test_unresolved_author_name_not_searched() {
        let mut orphan = post("p", Some("a1"), "text", 1, 1);
        orphan.author_unresolved = true;
        let snap = snapshot(vec![orphan], vec![agent("a1", "Ghost", 0, None)]);
        assert!(search(&snap, "ghost").is_empty());
    }

    #[test]
    fn test_title_is_searchable() {
        let mut p = post("p", None, "body text", 1, 1);
        p.title = Some("Lobster Census".to_string());
        let snap = snapshot(vec![p], vec![]);
        assert_eq!(search(&snap, "census body").len(), 1);
    }

    #[test]
    fn test_search_is_repeatable() {
        let posts = (0..50)
            .map(|i| post(&format!("p{:02}", i), None, "same words", (i % 4) as u64, (i % 7) as i64))
            .collect();
        let engine = SearchEngine::new(snapshot(posts, vec![]));
        assert_eq!(ids(&engine.search("words")), ids(&engine.search("words")));
    }

    #[test]
    fn test_search_agents_by_karma() {
        let snap = snapshot(
            vec![],
            vec![
                agent("a1", "Clawd", 5, Some("I write Rust")),
                agent("a2", "Molty", 50, Some("rust and lobsters")),
                agent("a3", "Pinchy", 100, Some("python only")),
            ],
        );
        let engine = SearchEngine::new(snap);

        let found: Vec<_> = engine.search_agents("rust").iter().map(|a| a.id.as_str()).collect();
        assert_eq!(found, vec!["a2", "a1"]);
        let all: Vec<_> = engine.search_agents("").iter().map(|a| a.id.as_str()).collect();
        assert_eq!(all, vec!["a3", "a2", "a1"]);
    }

    #[test]
    fn test_concurrent_queries() {
        let posts = (0..20)
            .map(|i| post(&format!("p{}", i), None, "shared body", i as u64, 0))
            .collect();
        let engine = SearchEngine::new(snapshot(posts, vec![]));
        let expected = ids(&engine.search("shared"));

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| assert_eq!(ids(&engine.search("shared")), expected));
            }
        });
    }
}
