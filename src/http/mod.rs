//! HTTP/1.1 protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → request.rs (parse head, decide request framing)
//!     → exchange + handler chain
//!     → response.rs (decide response framing, encode head)
//!     → server.rs (accept loop, one driver task per connection)
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{HeadLimits, RequestHead, RequestId};
pub use response::ResponseHead;
pub use server::{HttpServer, ServerError};
