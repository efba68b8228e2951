//! redb table definitions for the registry snapshot.
//!
//! One table, `&str` keys (machine ids) and `&[u8]` values
//! (JSON-serialized `Machine` records).

use redb::TableDefinition;

/// Machine records keyed by machine id.
pub const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");
