//! Search query model

use chrono::{DateTime, Utc};
use sessionvault_common::{SessionStatus, month_bucket};
use std::collections::BTreeSet;

/// How clauses (and the terms inside a clause) are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combinator {
    #[default]
    And,
    Or,
}

/// Inclusive range of start times, resolved at month granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    #[must_use]
    pub const fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// First and last `YYYY-MM` buckets covered
    #[must_use]
    pub fn buckets(&self) -> (Option<String>, Option<String>) {
        (
            self.from.as_ref().map(month_bucket),
            self.to.as_ref().map(month_bucket),
        )
    }

    /// Whether a bucket falls inside the range
    #[must_use]
    pub fn contains_bucket(&self, bucket: &str) -> bool {
        let (from, to) = self.buckets();
        from.is_none_or(|f| bucket >= f.as_str()) && to.is_none_or(|t| bucket <= t.as_str())
    }
}

/// Multi-field search; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub tags: BTreeSet<String>,
    pub topic_ids: BTreeSet<String>,
    pub date_range: Option<DateRange>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub status: Option<SessionStatus>,
    pub combinator: Combinator,
    /// Cap on returned sessions (applied after sorting by start time)
    pub limit: Option<usize>,
}

impl SearchQuery {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tags: BTreeSet::from([tag.into()]),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_combinator(mut self, combinator: Combinator) -> Self {
        self.combinator = combinator;
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// No clause set: matches every indexed session
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty())
            && self.tags.is_empty()
            && self.topic_ids.is_empty()
            && self.date_range.is_none()
            && self.category.is_none()
            && self.sub_category.is_none()
            && self.status.is_none()
    }
}
