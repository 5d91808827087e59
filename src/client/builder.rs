// ABOUTME: Convenience constructors for Client: a no-frills quick_connect plus a fully configurable connect.

use crate::client::default::Client;
use crate::client::error::ClientResult;
use crate::codec::BincodeCodec;
use crate::config::Config;
use bytes::Bytes;
use tokio::net::ToSocketAddrs;

pub struct ClientBuilder;

impl ClientBuilder {
    /// Connects with default configuration and no authentication data.
    pub async fn quick_connect<A: ToSocketAddrs>(addr: A) -> ClientResult<Client<BincodeCodec>> {
        Client::connect(addr, Config::default(), None).await
    }

    /// Connects with the given configuration and authentication payload.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        config: Config,
        auth_data: Option<Bytes>,
    ) -> ClientResult<Client<BincodeCodec>> {
        Client::connect(addr, config, auth_data).await
    }
}
