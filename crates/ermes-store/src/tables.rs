//! Redb table definitions for persistent session storage.

use redb::TableDefinition;

/// The whole keyspace: `s:`, `n:`, `m:` and `c:` keys share this table.
/// Values are bincode-encoded records, except node descriptors (JSON).
pub const KEYSPACE: TableDefinition<&str, &[u8]> = TableDefinition::new("keyspace");
