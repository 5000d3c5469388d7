//! # hearth-store
//!
//! The backing-store boundary of the hearth synchronization engine.
//!
//! The crate defines the narrow contract the client core needs from whatever
//! store sits behind it (the [`Backend`] trait: query, batch lookup,
//! insert/update/delete and a change-event subscription) together with the
//! row models that cross it. [`Database`] is a SQLite implementation of that
//! contract which broadcasts a [`ChangeEvent`] after every successful write.

pub mod backend;
pub mod containers;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod profiles;
pub mod reactions;

mod error;

pub use backend::{Backend, ChangeBus, ChangeEvent, ChangeFilter, ChangeNotification, Subscription};
pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
