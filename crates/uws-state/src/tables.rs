//! redb table definitions for the status store.

use redb::TableDefinition;

/// Latest `ServiceStatus` keyed by service id.
pub const STATUS: TableDefinition<&str, &[u8]> = TableDefinition::new("status");
