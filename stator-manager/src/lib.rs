//! Stator manager - request correlation and entity API
//!
//! The runtime answers requests asynchronously: a request is an event on the
//! bus and its answer is a callback event carrying the same request id. This
//! crate bridges that to plain `async fn` calls.
//!
//! - [`Holder`] keeps one pending wait per request id, resolved by the
//!   callback, a deadline or shutdown.
//! - [`ApiManager`] builds the request events for entity CRUD, awaits the
//!   holder and decodes the returned [`stator_types::EntityView`]. It also
//!   administers mapper definitions in the repository.

pub mod error;
pub mod holder;
pub mod manager;

pub use error::{ManagerError, Result};
pub use holder::{Holder, HolderConfig, Waiter};
pub use manager::{ApiManager, PatchOptions};
