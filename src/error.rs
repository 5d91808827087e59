// ABOUTME: Crate-wide boxed-error convenience alias.
// ABOUTME: Hot-path components define their own thiserror enums instead; see frame.rs, mailbox.rs, rpc/error.rs.

/// Error returned by non-hot-path functions.
///
/// Hot paths (frame parsing, mailbox processing, RPC dispatch) define their
/// own `thiserror` enums so callers can match on a specific failure kind;
/// this alias is for the convenience call sites (client/server setup,
/// demos) that only need to propagate a failure upward.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for postmq operations.
pub type Result<T> = std::result::Result<T, Error>;
