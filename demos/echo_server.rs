// ABOUTME: Minimal MQ transport demo: accepts connections and mirrors every message it receives.
// ABOUTME: Exercises Frame/Mailbox/Postmaster/Session directly, with no RPC or handshake layered on top.

use argh::FromArgs;
use postmq::{BufferPool, Config, Message, Postmaster, Session, SessionListener};
use socket2::Socket;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

#[derive(FromArgs)]
/// Echo server for the postmq message-queue transport.
struct Args {
    /// port to listen on
    #[argh(option, default = "7878")]
    port: u16,
}

struct EchoListener;

impl SessionListener for EchoListener {
    fn on_connected(&self, session: &Arc<Session>) {
        tracing::info!(session_id = %session.id(), "client connected");
    }

    fn on_incoming_message(&self, session: &Arc<Session>, message: Message) {
        tracing::info!(session_id = %session.id(), frames = message.frame_count(), "echoing message");
        session.send(message);
    }

    fn on_closed(&self, session: &Arc<Session>, reason: postmq::CloseReason) {
        tracing::info!(session_id = %session.id(), ?reason, "client disconnected");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let config = Config::default().with_address([127, 0, 0, 1].into(), args.port);
    let listener = TcpListener::bind((config.ip, config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "echo server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let stream = apply_transport_options(stream)?;
        let config = config.clone();
        tokio::spawn(async move {
            tracing::info!(%peer, "accepted connection");
            let (read_half, write_half) = stream.into_split();
            let postmaster = Postmaster::new(config.max_read_write_workers);
            let buffer_pool = BufferPool::new(2, config.send_and_receive_buffer_size);
            let session = Session::new(config, postmaster, write_half, Arc::new(EchoListener))
                .expect("configured buffer size carries a frame header");
            session.run_reader(read_half, &buffer_pool).await;
        });
    }
}

fn apply_transport_options(stream: TcpStream) -> std::io::Result<TcpStream> {
    let std_stream = stream.into_std()?;
    let socket = Socket::from(std_stream);
    socket.set_nodelay(true)?;
    socket.set_linger(Some(Duration::ZERO))?;
    socket.set_nonblocking(true)?;
    TcpStream::from_std(socket.into())
}
