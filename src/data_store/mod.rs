/// Half-open key ranges used by scans and predicate locks.
pub mod key_range;
/// The versioned, ordered key/value store.
pub mod ledger_store;
pub mod value;
pub mod version;
