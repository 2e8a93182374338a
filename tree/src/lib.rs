//! In-memory metadata snapshots of a directory tree that may change while
//! being served.
//!
//! [`TreeManager`] scans a directory hierarchy into an immutable tree of
//! [`Entry`] values, keeps identities stable across rescans for unchanged
//! entries, derives gzip aliases from [`RuleSet`] patterns, and atomically
//! republishes a new snapshot whenever the filesystem reports a change.

mod errors;
mod scan;

pub mod entry;
pub mod manager;
pub mod rules;

pub use entry::{Content, Entry, Source};
pub use errors::Error;
pub use manager::{Resolved, TreeManager};
pub use rules::{Rule, RuleSet};
