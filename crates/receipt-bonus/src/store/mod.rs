//! In-process implementations of the persistence boundaries.
//!
//! Each store keeps its state behind a single mutex so that compare-and-set style operations
//! (`apply_decision`, `create_if_absent`, `save`, `acquire_lease`) are atomic, which is the
//! property a relational backend would provide through row locks and unique constraints.

mod ledger;
mod receipts;
mod recipients;

pub use ledger::InMemoryLedger;
pub use receipts::InMemoryReceiptStore;
pub use recipients::InMemoryRecipientDirectory;
