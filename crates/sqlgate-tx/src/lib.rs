//! Transaction propagation for sqlgate.
//!
//! - [`TransactionManager`] runs units of work under a [`Propagation`] mode
//! - [`TransactionHandle`] owns one connection with an open transaction,
//!   plus its savepoint stack
//! - [`TxContext`] carries the current handle through a call chain by value
//!
//! ```rust,ignore
//! let mgr = TransactionManager::new(provider);
//! let root = TxContext::new();
//! mgr.transaction(&cx, &root, |ctx| async move {
//!     let tx = ctx.active().expect("inside a transaction");
//!     tx.execute(&cx, "INSERT INTO audit (msg) VALUES ('hi')", &[]).await?;
//!     mgr.run_with_propagation(&cx, &ctx, Propagation::Nested.into(), |ctx| async move {
//!         // rolled back to a savepoint on error, outer work continues
//!         Outcome::Ok(())
//!     }).await
//! }).await;
//! ```

pub mod context;
pub mod handle;
pub mod manager;
pub mod options;

pub use context::{ContextLink, TxContext};
pub use handle::{HandleState, TransactionHandle};
pub use manager::TransactionManager;
pub use options::{Propagation, TxOptions};
