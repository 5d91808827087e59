// ABOUTME: Connects to echo_server, sends a few multi-frame messages, and prints what comes back.
// ABOUTME: Demonstrates constructing a Session directly over a TcpStream without the handshake/RPC layers.

use argh::FromArgs;
use bytes::Bytes;
use postmq::{BufferPool, CloseReason, Config, Message, Postmaster, Session, SessionListener};
use socket2::Socket;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(FromArgs)]
/// Echo client for the postmq message-queue transport.
struct Args {
    /// server port to connect to
    #[argh(option, default = "7878")]
    port: u16,

    /// number of echo round trips to send
    #[argh(option, default = "3")]
    count: usize,
}

struct PrintingListener {
    remaining: Mutex<usize>,
    done: tokio::sync::Notify,
}

impl SessionListener for PrintingListener {
    fn on_incoming_message(&self, _session: &Arc<Session>, message: Message) {
        for frame in message.frames() {
            if let Some(payload) = frame.payload() {
                println!("received echo: {payload:?}");
            }
        }
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_one();
        }
    }

    fn on_closed(&self, _session: &Arc<Session>, reason: CloseReason) {
        println!("session closed: {reason:?}");
        self.done.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let stream = TcpStream::connect(("127.0.0.1", args.port)).await?;
    let stream = apply_transport_options(stream)?;
    let (read_half, write_half) = stream.into_split();

    let config = Config::default();
    let postmaster = Postmaster::new(config.max_read_write_workers);
    let buffer_pool = BufferPool::new(2, config.send_and_receive_buffer_size);
    let listener = Arc::new(PrintingListener {
        remaining: Mutex::new(args.count),
        done: tokio::sync::Notify::new(),
    });
    let session = Session::new(config, postmaster, write_half, listener.clone())
        .expect("configured buffer size carries a frame header");
    let reader_session = session.clone();
    tokio::spawn(async move { reader_session.run_reader(read_half, &buffer_pool).await });

    for i in 0..args.count {
        let payload = Bytes::from(format!("hello #{i}").into_bytes());
        session.send(Message::from_payloads(vec![payload]));
    }

    listener.done.notified().await;
    Ok(())
}

fn apply_transport_options(stream: TcpStream) -> std::io::Result<TcpStream> {
    let std_stream = stream.into_std()?;
    let socket = Socket::from(std_stream);
    socket.set_nodelay(true)?;
    socket.set_linger(Some(Duration::ZERO))?;
    socket.set_nonblocking(true)?;
    TcpStream::from_std(socket.into())
}
