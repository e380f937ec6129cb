//! Cross-process shared-memory object pool.
//!
//! A single named shared-memory segment, a fixed-capacity slot table binding
//! externally chosen 64-bit ids to byte-range leases, multi-process
//! reference counting, and a robust cross-process mutex coordinating it all.
//! One process creates the pool and publishes its name at a well-known link
//! path; any process that can read that path can open the same segment and
//! exchange large payloads with its sibling by passing only an id.
//!
//! ```no_run
//! use shm_object_pool::Pool;
//! use std::path::Path;
//!
//! let link_path = Path::new("/tmp/my-pool.link");
//! let pool = Pool::create(link_path, 64 * 1024 * 1024, 256)?;
//!
//! let mut view = pool.add_object(42, 1024)?;
//! view[0] = 7;
//!
//! // A sibling process: Pool::open(link_path)?.attach_object(42)?
//! # Ok::<(), shm_object_pool::PoolError>(())
//! ```
//!
//! This crate implements the allocator and synchronization core only. Shape,
//! dtype, and pickling-style serialization of payloads, size-string parsing,
//! and the process-wide singleton lifecycle are layered on top by callers.

mod alloc;
mod error;
mod layout;
mod link;
mod mutex;
mod pool;
mod segment;
mod slots;
mod view;

pub use error::{PoolError, Result};
pub use pool::Pool;
pub use view::View;
