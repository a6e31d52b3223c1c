//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key: node path (e.g. "/managed-ledgers/orders"), Value: bincode-encoded StoredNode
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
