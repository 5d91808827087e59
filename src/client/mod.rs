// ABOUTME: Client module: connect, perform the handshake, and call remote methods over RPC.
// ABOUTME: Layered as error -> default -> builder.

pub mod builder;
pub mod default;
pub mod error;

pub use builder::ClientBuilder;
pub use default::Client;
pub use error::{ClientError, ClientResult};
