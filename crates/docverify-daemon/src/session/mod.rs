//! Session records and their lifecycle.
//!
//! [`SessionStore`] owns persistence, the read-through cache, status
//! monotonicity, and the per-session locks every writer goes through.

mod store;
mod types;

pub use store::SessionStore;
pub use types::{Session, SessionStatus, StoreError, session_dir, upload_dir};
