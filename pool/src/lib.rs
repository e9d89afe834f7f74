//! A bounded, asynchronous resource pool for non-blocking database clients
//! (using tokio).
//!
//! Opening a new database connection every time one is needed is both
//! inefficient and can lead to resource exhaustion under high traffic
//! conditions. The pool keeps a bounded set of physical connections and
//! multiplexes logical requests over them: a request is served from an idle
//! connection, triggers the creation of a new one while capacity remains,
//! waits in a bounded FIFO queue, or is rejected outright.
//!
//! The pool is agnostic to the resource type it is managing. Implementors of
//! the `ManageResource` trait provide the protocol-specific logic to create,
//! check and close connections.
//!
//! # Example
//!
//! Using an imaginary "foodb" protocol adapter.
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() {
//!     let manager = foodb::ConnectionManager::new("localhost:1234");
//!     let pool = ndbc_pool::Pool::builder()
//!         .max_size(Some(20))
//!         .max_waiters(Some(100))
//!         .build(manager);
//!
//!     for _ in 0..200 {
//!         let pool = pool.clone();
//!         tokio::spawn(async move {
//!             let rows = pool
//!                 .run(|mut conn| async move { conn.query("SELECT 1").await })
//!                 .await;
//!             // the connection went back to the pool when `conn` was dropped
//!         });
//!     }
//! }
//! ```
#![allow(clippy::needless_doctest_main)]
#![deny(missing_docs, missing_debug_implementations)]

mod api;
pub use api::{
    Builder, ErrorSink, ManageResource, NopErrorSink, Pool, PoolError, PooledResource, RunError,
};

mod inner;
mod internals;
pub use internals::State;

mod lock {
    #[cfg(feature = "parking_lot")]
    use parking_lot::Mutex as MutexImpl;
    #[cfg(feature = "parking_lot")]
    use parking_lot::MutexGuard;

    #[cfg(not(feature = "parking_lot"))]
    use std::sync::Mutex as MutexImpl;
    #[cfg(not(feature = "parking_lot"))]
    use std::sync::MutexGuard;

    /// The single point of serialization for pool bookkeeping. Never held
    /// across an `.await`.
    pub(crate) struct Mutex<T>(MutexImpl<T>);

    impl<T> Mutex<T> {
        pub(crate) fn new(val: T) -> Self {
            Self(MutexImpl::new(val))
        }

        pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
            #[cfg(feature = "parking_lot")]
            {
                self.0.lock()
            }
            #[cfg(not(feature = "parking_lot"))]
            {
                // The bookkeeping never panics halfway through a transition.
                self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
            }
        }
    }
}
