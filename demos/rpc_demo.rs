// ABOUTME: End-to-end RPC demo: a Calculator service served and called over the postmq transport.
// ABOUTME: Demonstrates Server/ServiceRegistry on one side and Client/RpcProxy on the other.

use argh::FromArgs;
use postmq::{Client, Config, Server};
use std::net::SocketAddr;

#[derive(FromArgs)]
/// Calculator RPC demo over postmq.
struct Args {
    /// port to listen on / connect to
    #[argh(option, default = "7879")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let config = Config::default().with_address([127, 0, 0, 1].into(), args.port);

    let server = Server::new(config.clone());
    server.registry().register_method2(
        "Calculator",
        "Add",
        postmq::BincodeCodec,
        |a: i32, b: i32| async move { Ok(a + b) },
    );
    let addr: SocketAddr = server.bind()?;
    tracing::info!(%addr, "rpc_demo server listening");
    tokio::spawn(server.run());

    let client = Client::connect(addr, config, None).await?;
    let sum: i32 = client.call("Calculator", "Add", &100i32, &200i32, None).await?;
    println!("Calculator.Add(100, 200) = {sum}");

    client.disconnect().await;
    Ok(())
}
