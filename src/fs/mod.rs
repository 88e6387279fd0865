//! Filesystem layer: locked snapshot reads and the session store.

pub mod locking;
pub mod session_store;

pub use session_store::SessionStore;
