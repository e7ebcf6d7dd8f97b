//! Persisted key layout
//!
//! ```text
//! session/index                            JSON list of session ids
//! session/meta/{id}                        JSON SessionMetadata
//! session/chunk/{id}/{kind}/{index:06}     bincode Chunk
//! cas/blob/{hash}                          raw bytes
//! cas/ref/{hash}                           bincode CasRecord
//! cas/orphans                              JSON list of zero-ref hashes
//! index/meta                               JSON IndexMetadata
//! index/{list}                             JSON posting-list document
//! ```
//!
//! Listing sessions only ever touches `session/index` and `session/meta/*`.

use sessionvault_common::{AttachmentKind, ContentHash, SessionId};

pub const SESSION_INDEX: &str = "session/index";
pub const SESSION_META_PREFIX: &str = "session/meta/";
pub const SESSION_CHUNK_PREFIX: &str = "session/chunk/";
pub const CAS_BLOB_PREFIX: &str = "cas/blob/";
pub const CAS_REF_PREFIX: &str = "cas/ref/";
pub const CAS_ORPHANS: &str = "cas/orphans";
pub const INDEX_META: &str = "index/meta";
pub const INDEX_PREFIX: &str = "index/";

#[must_use]
pub fn session_meta(id: &SessionId) -> String {
    format!("{SESSION_META_PREFIX}{id}")
}

#[must_use]
pub fn chunk(id: &SessionId, kind: AttachmentKind, index: u32) -> String {
    format!("{SESSION_CHUNK_PREFIX}{id}/{kind}/{index:06}")
}

/// Prefix covering every chunk of one session
#[must_use]
pub fn session_chunks(id: &SessionId) -> String {
    format!("{SESSION_CHUNK_PREFIX}{id}/")
}

#[must_use]
pub fn cas_blob(hash: &ContentHash) -> String {
    format!("{CAS_BLOB_PREFIX}{hash}")
}

#[must_use]
pub fn cas_ref(hash: &ContentHash) -> String {
    format!("{CAS_REF_PREFIX}{hash}")
}

#[must_use]
pub fn posting_list(name: &str) -> String {
    format!("{INDEX_PREFIX}{name}")
}
