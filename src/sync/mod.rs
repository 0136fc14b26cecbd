//! Client side of live-dev: watch a working tree and stream it to the
//! server's staging area.

pub mod engine;
pub mod ignore;
pub mod transport;
pub mod watcher;

pub use engine::{MessageSink, SyncCallbacks, SyncEngine};
pub use ignore::IgnoreRules;
pub use transport::{ConnectionState, StateChange, Transport, TransportOptions};
pub use watcher::{ChangeKind, FileEvent, FileWatcher};
