//! Core type definitions for SessionVault
//!
//! This module defines the session record shape: a small metadata document
//! that is always loaded whole, plus ordered chunks of attachment
//! descriptors whose bytes live in the content-addressable store.

use crate::hash::ContentHash;
use chrono::{DateTime, Datelike, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a session
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier
    ///
    /// Identifiers become part of storage keys, so the separator `/` is
    /// rejected.
    pub fn parse(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() || id.contains('/') {
            return Err(crate::Error::invalid_argument(format!(
                "invalid session id: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Lifecycle status of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Interrupted,
}

impl SessionStatus {
    pub const ALL: [Self; 4] = [
        Self::Active,
        Self::Paused,
        Self::Completed,
        Self::Interrupted,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        }
    }

    /// Whether the session has stopped recording for good
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::invalid_argument(format!("unknown status: {s}")))
    }
}

/// Kind of attachment a chunk holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// Screenshots
    Image,
    /// Audio segments
    Audio,
}

impl AttachmentKind {
    pub const ALL: [Self; 2] = [Self::Image, Self::Audio];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" | "screenshot" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            _ => Err(crate::Error::invalid_argument(format!(
                "unknown attachment kind: {s}"
            ))),
        }
    }
}

/// Descriptor of one attachment; the bytes live in the CAS under `hash`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub kind: AttachmentKind,
    pub hash: ContentHash,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub captured_at: DateTime<Utc>,
    /// Playback length for audio segments
    pub duration_ms: Option<u64>,
}

/// Attachment bytes plus descriptor fields supplied by the caller
#[derive(Clone, Debug, Default)]
pub struct NewAttachment {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl NewAttachment {
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            ..Default::default()
        }
    }
}

/// Ordered, bounded batch of attachment descriptors
///
/// Identified by (session, kind, index). A chunk is sealed once it reaches
/// capacity and is never appended to again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub session_id: SessionId,
    pub kind: AttachmentKind,
    pub index: u32,
    pub capacity: u32,
    pub items: Vec<Attachment>,
    pub sealed: bool,
}

impl Chunk {
    #[must_use]
    pub fn new(session_id: SessionId, kind: AttachmentKind, index: u32, capacity: u32) -> Self {
        Self {
            session_id,
            kind,
            index,
            capacity,
            items: Vec::with_capacity(capacity as usize),
            sealed: false,
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.sealed || self.items.len() >= self.capacity as usize
    }

    /// Append an item, sealing the chunk when it reaches capacity
    pub fn push(&mut self, item: Attachment) -> crate::Result<()> {
        if self.is_full() {
            return Err(crate::Error::internal(format!(
                "append to sealed chunk {}/{}/{}",
                self.session_id, self.kind, self.index
            )));
        }
        self.items.push(item);
        if self.items.len() >= self.capacity as usize {
            self.sealed = true;
        }
        Ok(())
    }
}

/// Pointer from session metadata to one of its chunks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPointer {
    pub kind: AttachmentKind,
    pub index: u32,
    pub key: String,
}

/// Fields supplied when starting a session
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    pub name: String,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub tags: BTreeSet<String>,
    pub topic_ids: BTreeSet<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl NewSession {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Small, fixed-shape session record; always loaded in full
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: SessionId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub status: SessionStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub topic_ids: BTreeSet<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sub_category: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub image_count: u64,
    #[serde(default)]
    pub audio_count: u64,
    #[serde(default)]
    pub image_chunk_count: u32,
    #[serde(default)]
    pub audio_chunk_count: u32,
    /// Chunk keys in append order
    #[serde(default)]
    pub chunks: Vec<ChunkPointer>,
}

impl SessionMetadata {
    /// Build fresh metadata for a session starting now
    #[must_use]
    pub fn from_new(id: SessionId, new: NewSession, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: new.name,
            description: new.description,
            notes: new.notes,
            status: SessionStatus::Active,
            tags: new.tags,
            topic_ids: new.topic_ids,
            category: new.category,
            sub_category: new.sub_category,
            started_at: new.started_at.unwrap_or(now),
            ended_at: None,
            created_at: now,
            updated_at: now,
            image_count: 0,
            audio_count: 0,
            image_chunk_count: 0,
            audio_chunk_count: 0,
            chunks: Vec::new(),
        }
    }

    #[must_use]
    pub const fn chunk_count(&self, kind: AttachmentKind) -> u32 {
        match kind {
            AttachmentKind::Image => self.image_chunk_count,
            AttachmentKind::Audio => self.audio_chunk_count,
        }
    }

    #[must_use]
    pub const fn item_count(&self, kind: AttachmentKind) -> u64 {
        match kind {
            AttachmentKind::Image => self.image_count,
            AttachmentKind::Audio => self.audio_count,
        }
    }

    /// Record that a new chunk was opened for `kind`
    pub fn push_chunk(&mut self, pointer: ChunkPointer) {
        match pointer.kind {
            AttachmentKind::Image => self.image_chunk_count += 1,
            AttachmentKind::Audio => self.audio_chunk_count += 1,
        }
        self.chunks.push(pointer);
    }

    /// Record one more attachment of `kind`
    pub const fn bump_item_count(&mut self, kind: AttachmentKind) {
        match kind {
            AttachmentKind::Image => self.image_count += 1,
            AttachmentKind::Audio => self.audio_count += 1,
        }
    }

    /// Chunk pointers of one kind, in chunk order
    pub fn chunk_pointers(&self, kind: AttachmentKind) -> impl Iterator<Item = &ChunkPointer> {
        self.chunks.iter().filter(move |p| p.kind == kind)
    }

    /// Month bucket of the session start (`YYYY-MM`)
    #[must_use]
    pub fn date_bucket(&self) -> String {
        month_bucket(&self.started_at)
    }

    /// Free text that feeds the word index
    #[must_use]
    pub fn indexed_text(&self) -> String {
        let mut text = self.name.clone();
        for part in [&self.description, &self.notes].into_iter().flatten() {
            text.push(' ');
            text.push_str(part);
        }
        text
    }
}

/// Month bucket for a timestamp (`YYYY-MM`)
#[must_use]
pub fn month_bucket(ts: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

/// A fully hydrated session: metadata plus every attachment in chunk order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub metadata: SessionMetadata,
    pub images: Vec<Attachment>,
    pub audio: Vec<Attachment>,
}

impl Session {
    #[must_use]
    pub fn attachments(&self, kind: AttachmentKind) -> &[Attachment] {
        match kind {
            AttachmentKind::Image => &self.images,
            AttachmentKind::Audio => &self.audio,
        }
    }
}

/// Lightweight listing row derived from metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    pub category: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub image_count: u64,
    pub audio_count: u64,
    pub tag_count: usize,
    pub has_notes: bool,
}

impl From<&SessionMetadata> for SessionSummary {
    fn from(meta: &SessionMetadata) -> Self {
        Self {
            id: meta.id.clone(),
            name: meta.name.clone(),
            status: meta.status,
            category: meta.category.clone(),
            started_at: meta.started_at,
            ended_at: meta.ended_at,
            image_count: meta.image_count,
            audio_count: meta.audio_count,
            tag_count: meta.tags.len(),
            has_notes: meta.notes.as_ref().is_some_and(|n| !n.trim().is_empty()),
        }
    }
}
