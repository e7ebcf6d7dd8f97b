//! Redb table definitions for persistent engine storage.

use redb::TableDefinition;

// Every engine key lives in one flat namespace; the key prefix encodes the
// record type (see the engine's key layout).
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
