//! Buffer management subsystem.
//!
//! # Data Flow
//! ```text
//! connection accepted
//!     → pool.rs checkout (inbound + outbound wire buffers)
//!     → conduits check out scratch buffers while framing
//!     → PooledBuffer dropped (success or failure) → returned to pool
//! ```
//!
//! # Design Decisions
//! - Fixed count of same-size buffers, allocated lazily up to the limit
//! - Checkout is an owned RAII handle; returning twice is impossible
//! - Exhaustion is reported, never waited on (the I/O thread must not block)

pub mod pool;

pub use pool::{BufferPool, PoolStats, PooledBuffer};
