//! Bounded concurrency for copy tasks
//!
//! This crate provides the permit pool used by the task scheduler to cap the number of copy
//! tasks that are in flight at any moment. Each scheduler owns its own pool: there is no
//! process-wide state, so several schedulers can run side by side (and be tested in isolation).
//!
//! # Overview
//!
//! A [`Semaphore`] starts with exactly `limit` permits. Submitting work means acquiring an
//! owned permit first; when the pool is exhausted the submitter is parked until a running task
//! finishes and drops its permit. This is backpressure, not busy-waiting, and it keeps the number
//! of open files and allocated copy buffers proportional to the limit rather than to the size of
//! the fileset.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::Semaphore;
//!
//! # async fn example() {
//! let pool = Semaphore::new(16);
//!
//! // blocks while 16 permits are outstanding
//! let permit = pool.acquire_owned().await;
//! tokio::spawn(async move {
//!     // do the work here - the permit is released when it goes out of scope
//!     drop(permit);
//! });
//! # }
//! ```
//!
//! # Thread Safety
//!
//! [`Semaphore`] is cheap to clone; clones share the same permits and can be moved across tasks
//! and threads.

mod semaphore;

pub use semaphore::Permit;
pub use semaphore::Semaphore;
