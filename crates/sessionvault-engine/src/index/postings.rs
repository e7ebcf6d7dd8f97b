//! In-memory posting lists

use super::query::{Combinator, SearchQuery};
use super::tokenize::Tokenizer;
use serde::{Deserialize, Serialize};
use sessionvault_common::{SessionId, SessionMetadata};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The seven posting-list types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Topic,
    Date,
    Tag,
    Word,
    Category,
    SubCategory,
    Status,
}

impl IndexKind {
    pub const ALL: [Self; 7] = [
        Self::Topic,
        Self::Date,
        Self::Tag,
        Self::Word,
        Self::Category,
        Self::SubCategory,
        Self::Status,
    ];

    /// Name used in the document key
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Date => "date",
            Self::Tag => "tag",
            Self::Word => "word",
            Self::Category => "category",
            Self::SubCategory => "subcategory",
            Self::Status => "status",
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One posting list: key -> sessions
pub type PostingList = BTreeMap<String, BTreeSet<SessionId>>;

/// Keys a session's metadata places it under, per list
pub fn posting_keys(
    meta: &SessionMetadata,
    tokenizer: &Tokenizer,
) -> [(IndexKind, BTreeSet<String>); 7] {
    let single = |v: &Option<String>| -> BTreeSet<String> {
        v.iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };
    [
        (IndexKind::Topic, meta.topic_ids.clone()),
        (IndexKind::Date, BTreeSet::from([meta.date_bucket()])),
        (IndexKind::Tag, meta.tags.clone()),
        (IndexKind::Word, tokenizer.tokenize(&meta.indexed_text())),
        (IndexKind::Category, single(&meta.category)),
        (IndexKind::SubCategory, single(&meta.sub_category)),
        (
            IndexKind::Status,
            BTreeSet::from([meta.status.as_str().to_string()]),
        ),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostingLists {
    lists: [PostingList; 7],
}

impl PostingLists {
    pub fn build<'a, I>(sessions: I, tokenizer: &Tokenizer) -> Self
    where
        I: IntoIterator<Item = &'a SessionMetadata>,
    {
        let mut lists = Self::default();
        for meta in sessions {
            lists.add(meta, tokenizer);
        }
        lists
    }

    pub fn list(&self, kind: IndexKind) -> &PostingList {
        &self.lists[kind.slot()]
    }

    pub fn list_mut(&mut self, kind: IndexKind) -> &mut PostingList {
        &mut self.lists[kind.slot()]
    }

    pub fn set_list(&mut self, kind: IndexKind, list: PostingList) {
        self.lists[kind.slot()] = list;
    }

    /// Add one posting; true if it was not already present
    pub fn add_posting(&mut self, kind: IndexKind, key: &str, id: &SessionId) -> bool {
        self.list_mut(kind)
            .entry(key.to_string())
            .or_default()
            .insert(id.clone())
    }

    /// Remove one posting, dropping the key once it has no sessions
    pub fn remove_posting(&mut self, kind: IndexKind, key: &str, id: &SessionId) -> bool {
        let list = self.list_mut(kind);
        let Some(ids) = list.get_mut(key) else {
            return false;
        };
        let removed = ids.remove(id);
        if ids.is_empty() {
            list.remove(key);
        }
        removed
    }

    /// Add a session under every key its metadata implies
    pub fn add(&mut self, meta: &SessionMetadata, tokenizer: &Tokenizer) -> BTreeSet<IndexKind> {
        let mut touched = BTreeSet::new();
        for (kind, keys) in posting_keys(meta, tokenizer) {
            for key in &keys {
                if self.add_posting(kind, key, &meta.id) {
                    touched.insert(kind);
                }
            }
        }
        touched
    }

    /// Remove a session from every key its metadata implies
    pub fn remove(
        &mut self,
        meta: &SessionMetadata,
        tokenizer: &Tokenizer,
    ) -> BTreeSet<IndexKind> {
        let mut touched = BTreeSet::new();
        for (kind, keys) in posting_keys(meta, tokenizer) {
            for key in &keys {
                if self.remove_posting(kind, key, &meta.id) {
                    touched.insert(kind);
                }
            }
        }
        touched
    }

    /// Every indexed session; each session has exactly one status
    pub fn all_sessions(&self) -> BTreeSet<SessionId> {
        self.list(IndexKind::Status)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Total (key, session) postings
    pub fn posting_count(&self) -> usize {
        self.lists
            .iter()
            .flat_map(BTreeMap::values)
            .map(BTreeSet::len)
            .sum()
    }

    /// Drop keys with no sessions; returns how many were dropped
    pub fn prune_empty(&mut self, kind: IndexKind) -> usize {
        let list = self.list_mut(kind);
        let before = list.len();
        list.retain(|_, ids| !ids.is_empty());
        before - list.len()
    }

    fn lookup(&self, kind: IndexKind, key: &str) -> BTreeSet<SessionId> {
        self.list(kind).get(key).cloned().unwrap_or_default()
    }

    /// Combine a clause's term sets with the query combinator
    fn combine_terms<I>(sets: I, combinator: Combinator) -> Option<BTreeSet<SessionId>>
    where
        I: IntoIterator<Item = BTreeSet<SessionId>>,
    {
        let mut result: Option<BTreeSet<SessionId>> = None;
        for set in sets {
            result = Some(match (result, combinator) {
                (None, _) => set,
                (Some(acc), Combinator::And) => acc.intersection(&set).cloned().collect(),
                (Some(mut acc), Combinator::Or) => {
                    acc.extend(set);
                    acc
                }
            });
        }
        result
    }

    /// Resolve a query to session ids by posting-list lookups
    pub fn search(&self, query: &SearchQuery, tokenizer: &Tokenizer) -> BTreeSet<SessionId> {
        if query.is_empty() {
            return self.all_sessions();
        }
        let combinator = query.combinator;
        let mut clauses: Vec<BTreeSet<SessionId>> = Vec::new();

        if let Some(text) = &query.text {
            let tokens = tokenizer.tokenize(text);
            if let Some(set) = Self::combine_terms(
                tokens.iter().map(|t| self.lookup(IndexKind::Word, t)),
                combinator,
            ) {
                clauses.push(set);
            }
        }
        if let Some(set) = Self::combine_terms(
            query.tags.iter().map(|t| self.lookup(IndexKind::Tag, t)),
            combinator,
        ) {
            clauses.push(set);
        }
        if let Some(set) = Self::combine_terms(
            query.topic_ids.iter().map(|t| self.lookup(IndexKind::Topic, t)),
            combinator,
        ) {
            clauses.push(set);
        }
        if let Some(range) = &query.date_range {
            let (from, to) = range.buckets();
            let lower = from.unwrap_or_default();
            // Month buckets are fixed-width, so string order is date order
            let months = self
                .list(IndexKind::Date)
                .range(lower..)
                .take_while(|(bucket, _)| to.as_ref().is_none_or(|t| *bucket <= t))
                .flat_map(|(_, ids)| ids.iter().cloned());
            clauses.push(months.collect());
        }
        if let Some(category) = &query.category {
            clauses.push(self.lookup(IndexKind::Category, category.trim()));
        }
        if let Some(sub) = &query.sub_category {
            clauses.push(self.lookup(IndexKind::SubCategory, sub.trim()));
        }
        if let Some(status) = query.status {
            clauses.push(self.lookup(IndexKind::Status, status.as_str()));
        }

        // Text made only of stop words adds no clause; with nothing else
        // to filter on the query matches everything, like an empty one
        Self::combine_terms(clauses, combinator).unwrap_or_else(|| self.all_sessions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::query::DateRange;
    use chrono::{TimeZone, Utc};
    use sessionvault_common::{NewSession, SessionStatus};

    fn session(id: &str, name: &str, tags: &[&str], month: u32) -> SessionMetadata {
        let mut new = NewSession::named(name).with_tags(tags.iter().copied());
        new.started_at = Some(Utc.with_ymd_and_hms(2024, month, 10, 12, 0, 0).unwrap());
        new.category = Some("work".to_string());
        SessionMetadata::from_new(SessionId::parse(id).unwrap(), new, Utc::now())
    }

    fn ids(set: &BTreeSet<SessionId>) -> Vec<&str> {
        set.iter().map(SessionId::as_str).collect()
    }

    fn fixture() -> (PostingLists, Tokenizer) {
        let tokenizer = Tokenizer::default();
        let sessions = [
            session("a", "Rust parser refactor", &["rust", "parser"], 1),
            session("b", "Kernel debugging", &["kernel"], 2),
            session("c", "Parser benchmarks", &["parser"], 3),
        ];
        (PostingLists::build(&sessions, &tokenizer), tokenizer)
    }

    #[test]
    fn test_tag_and_text_lookup() {
        let (lists, t) = fixture();
        assert_eq!(ids(&lists.search(&SearchQuery::tag("parser"), &t)), vec!["a", "c"]);
        assert_eq!(ids(&lists.search(&SearchQuery::text("KERNEL!"), &t)), vec!["b"]);
    }

    #[test]
    fn test_combinator_applies_within_and_across_clauses() {
        let (lists, t) = fixture();
        let and = SearchQuery::text("rust parser");
        assert_eq!(ids(&lists.search(&and, &t)), vec!["a"]);

        let or = SearchQuery::text("rust kernel").with_combinator(Combinator::Or);
        assert_eq!(ids(&lists.search(&or, &t)), vec!["a", "b"]);

        let mut across = SearchQuery::tag("kernel");
        across.text = Some("benchmarks".into());
        assert!(lists.search(&across, &t).is_empty());
        let across = across.with_combinator(Combinator::Or);
        assert_eq!(ids(&lists.search(&across, &t)), vec!["b", "c"]);
    }

    #[test]
    fn test_date_range_unions_months() {
        let (lists, t) = fixture();
        let query = SearchQuery {
            date_range: Some(DateRange::between(
                Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            )),
            ..Default::default()
        };
        assert_eq!(ids(&lists.search(&query, &t)), vec!["b", "c"]);
    }

    #[test]
    fn test_status_category_and_empty_query() {
        let (lists, t) = fixture();
        assert_eq!(lists.search(&SearchQuery::status(SessionStatus::Active), &t).len(), 3);
        assert!(lists.search(&SearchQuery::status(SessionStatus::Completed), &t).is_empty());
        let query = SearchQuery {
            category: Some("work".into()),
            ..Default::default()
        };
        assert_eq!(lists.search(&query, &t).len(), 3);
        assert_eq!(lists.search(&SearchQuery::default(), &t).len(), 3);
    }

    #[test]
    fn test_remove_then_add_moves_session() {
        let (mut lists, t) = fixture();
        let old = session("b", "Kernel debugging", &["kernel"], 2);
        let mut new = old.clone();
        new.tags = BTreeSet::from(["linux".to_string()]);
        new.status = SessionStatus::Completed;

        lists.remove(&old, &t);
        let touched = lists.add(&new, &t);
        assert!(touched.contains(&IndexKind::Tag));
        assert!(!lists.list(IndexKind::Tag).contains_key("kernel"));
        assert_eq!(ids(&lists.search(&SearchQuery::tag("linux"), &t)), vec!["b"]);
        assert_eq!(
            ids(&lists.search(&SearchQuery::status(SessionStatus::Completed), &t)),
            vec!["b"]
        );
    }

    #[test]
    fn test_stop_word_only_text_adds_no_clause() {
        let (lists, t) = fixture();
        let mut query = SearchQuery::tag("kernel");
        query.text = Some("the of".into());
        assert_eq!(ids(&lists.search(&query, &t)), vec!["b"]);
    }

    #[test]
    fn test_stop_word_only_query_matches_everything() {
        let (lists, t) = fixture();
        let everything = lists.search(&SearchQuery::default(), &t);
        assert!(everything.len() > 1);
        assert_eq!(lists.search(&SearchQuery::text("the and"), &t), everything);
        assert_eq!(lists.search(&SearchQuery::text("   "), &t), everything);
    }
}
