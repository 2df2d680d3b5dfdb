pub mod backend;
pub mod channel;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod models;
pub mod notifications;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod store;
pub mod tasks;

pub use backend::{Backend, MemoryBackend, RealtimeSocket, RestBackend, RestConfig};
pub use channel::{ChannelFilter, EventChannel, RealtimeTransport};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use events::CoreEvent;
pub use runtime::SyncCore;
