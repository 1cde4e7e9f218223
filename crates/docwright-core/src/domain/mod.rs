//! Domain types: commits, batches, credentials and the error taxonomy.

pub mod commit;
pub mod credential;
pub mod error;

pub use commit::{is_hex, Commit, CommitBatch, CommitId, COMMIT_ID_LEN, MIN_ABBREV_LEN};
pub use credential::Credential;
pub use error::{DocwrightError, Result};
