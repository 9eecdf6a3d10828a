pub mod broadcast;
pub mod keys;
pub mod sync;
pub mod types;

pub use sync::{SyncEngine, SyncEngineHandle};
pub use types::*;
