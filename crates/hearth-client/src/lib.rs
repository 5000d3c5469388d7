//! Client-side message synchronization.
//!
//! Reconciles optimistic local writes, store responses and pushed change
//! events into one consistent view per container ([`ChatSession`]) and per
//! user ([`ConversationList`]), backed by process-wide TTL caches
//! ([`Caches`]).

pub mod cache;
pub mod config;
pub mod containers;
pub mod events;
pub mod fetch;
pub mod inbox;
pub mod model;
pub mod optimistic;
pub mod reconcile;
pub mod session;
pub mod state;

mod error;

#[cfg(test)]
mod test_support;

use tracing_subscriber::{fmt, EnvFilter};

pub use cache::Caches;
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use events::{ChatView, InboxView};
pub use inbox::ConversationList;
pub use model::{Content, Delivery, Message};
pub use session::ChatSession;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling it again is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hearth_client=debug,hearth_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
