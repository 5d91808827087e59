// ABOUTME: Cross-module end-to-end scenarios over a real loopback TCP connection.
// ABOUTME: Exercises Session/Mailbox framing directly for the echo scenarios and Client/Server for the RPC ones.

use crate::buffer_pool::BufferPool;
use crate::client::Client;
use crate::config::Config;
use crate::message::Message;
use crate::postmaster::Postmaster;
use crate::rpc::{CancelToken, RemoteException, RpcError};
use crate::server::Server;
use crate::session::{CloseReason, Session, SessionListener};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

struct CollectingListener {
    received: Mutex<Vec<Message>>,
    closed: Mutex<Option<CloseReason>>,
}

impl CollectingListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
        })
    }

    fn take_one(&self) -> Option<Message> {
        self.received.lock().unwrap().pop()
    }
}

impl SessionListener for CollectingListener {
    fn on_incoming_message(&self, _session: &Arc<Session>, message: Message) {
        self.received.lock().unwrap().push(message);
    }

    fn on_closed(&self, _session: &Arc<Session>, reason: CloseReason) {
        *self.closed.lock().unwrap() = Some(reason);
    }
}

struct EchoListener;

impl SessionListener for EchoListener {
    fn on_incoming_message(&self, session: &Arc<Session>, message: Message) {
        session.send(message);
    }
}

/// Connects a raw client/server `Session` pair over loopback TCP. The
/// server side runs `EchoListener`; the client side collects incoming
/// messages in the returned listener for polling.
async fn connect_echo_pair(config: Config) -> (Arc<Session>, Arc<CollectingListener>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_postmaster = Postmaster::new(config.max_read_write_workers);
    let server_config = config.clone();
    let server_buffer_pool = BufferPool::new(2, config.send_and_receive_buffer_size);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let session =
            Session::new(server_config, server_postmaster, write_half, Arc::new(EchoListener)).unwrap();
        session.run_reader(read_half, &server_buffer_pool).await;
    });

    let client_stream = TcpStream::connect(addr).await.unwrap();
    let (client_read, client_write) = client_stream.into_split();
    let client_postmaster = Postmaster::new(config.max_read_write_workers);
    let client_listener = CollectingListener::new();
    let client_buffer_pool = BufferPool::new(2, config.send_and_receive_buffer_size);
    let client_session =
        Session::new(config, client_postmaster, client_write, client_listener.clone()).unwrap();
    let reader_session = client_session.clone();
    tokio::spawn(async move { reader_session.run_reader(client_read, &client_buffer_pool).await });

    (client_session, client_listener)
}

async fn wait_for_message(listener: &CollectingListener) -> Message {
    for _ in 0..200 {
        if let Some(message) = listener.take_one() {
            return message;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no message arrived within the deadline");
}

#[tokio::test]
async fn single_frame_echo() {
    let (client, listener) = connect_echo_pair(Config::default()).await;
    let payload = Bytes::from_static(&[0x01, 0x02, 0x03]);
    client.send(Message::from_payloads(vec![payload.clone()]));

    let received = wait_for_message(&listener).await;
    assert_eq!(received.frame_count(), 1);
    assert_eq!(received.frames()[0].payload().map(|b| b.as_ref()), Some(payload.as_ref()));
}

#[tokio::test]
async fn multi_frame_message() {
    let (client, listener) = connect_echo_pair(Config::default()).await;
    let chunk: Vec<u8> = (0..50).collect();
    let payloads: Vec<Bytes> = (0..4).map(|_| Bytes::from(chunk.clone())).collect();
    client.send(Message::from_payloads(payloads.clone()));

    let received = wait_for_message(&listener).await;
    assert_eq!(received.frame_count(), 4);
    for (frame, expected) in received.frames().iter().zip(payloads.iter()) {
        assert_eq!(frame.payload().map(|b| b.as_ref()), Some(expected.as_ref()));
    }
    assert!(received.frames().last().unwrap().is_terminal());
}

// Gather-header packet counting for a batch this size is exercised directly
// against a duplex socket in mailbox.rs's own tests; this end-to-end version
// confirms assembly still produces one 8-frame message over a real socket
// once `process_outbox` has split it across more than one gather write.
#[tokio::test]
async fn batching_reassembles_one_message_from_a_batch_over_budget() {
    let config = Config::default().with_buffer_size(16 * 1024);
    let max_frame_data = config.max_frame_data().unwrap();
    let (client, listener) = connect_echo_pair(config).await;

    let four_kib = Bytes::from(vec![0xAB; 4096]);
    let payloads: Vec<Bytes> = (0..8).map(|_| four_kib.clone()).collect();
    let total_frame_bytes: usize = payloads.len() * (4096 + 3);
    assert!(
        total_frame_bytes > max_frame_data * 2,
        "test payload must force >= 2 gather packets"
    );

    client.send(Message::from_payloads(payloads));

    let received = wait_for_message(&listener).await;
    assert_eq!(received.frame_count(), 8);
    assert!(received.frames().last().unwrap().is_terminal());
}

#[tokio::test]
async fn rpc_add_returns_the_sum_and_drains_the_wait_table() {
    let config = Config::default();
    let server = Server::new(config.clone());
    server.registry().register_method2(
        "Calculator",
        "Add",
        crate::codec::BincodeCodec,
        |a: i32, b: i32| async move { Ok(a + b) },
    );
    let addr = server.bind().unwrap();
    tokio::spawn(server.run());

    let client = Client::connect(addr, config, None).await.unwrap();
    let sum: i32 = client
        .call("Calculator", "Add", &100i32, &200i32, None)
        .await
        .unwrap();
    assert_eq!(sum, 300);
    assert_eq!(client.session().state(), crate::session::SessionState::Connected);
}

#[tokio::test]
async fn rpc_cancel_stops_the_long_running_call() {
    let config = Config::default();
    let server = Server::new(config.clone());
    let observed_cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let observed_cancel_for_handler = observed_cancel.clone();
    server.registry().register_method(
        "Calculator",
        "LongRunning",
        true,
        Arc::new(move |_args, cancel| {
            let observed_cancel = observed_cancel_for_handler.clone();
            Box::pin(async move {
                let token = cancel.expect("cancel token registered for this call");
                token.cancelled().await;
                observed_cancel.store(true, std::sync::atomic::Ordering::SeqCst);
                Err(RemoteException {
                    type_name: "Cancelled".to_string(),
                    message: "operation was cancelled".to_string(),
                    stack: String::new(),
                })
            })
        }),
    );
    let addr = server.bind().unwrap();
    tokio::spawn(server.run());

    let client = Client::connect(addr, config, None).await.unwrap();
    let token = CancelToken::new();
    let cancel_after = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            token.cancel();
        })
    };

    let result: Result<i32, RpcError> = client
        .call("Calculator", "LongRunning", &1i32, &2i32, Some(token))
        .await;
    cancel_after.await.unwrap();
    assert!(matches!(result, Err(RpcError::Cancelled)));

    for _ in 0..100 {
        if observed_cancel.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(observed_cancel.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn auth_failure_closes_both_sides_with_authentication_failure() {
    let config = Config::default().with_require_authentication(true);
    let server = Server::new(config.clone()).with_verifier(Arc::new(|_data: &[u8]| false));
    let addr = server.bind().unwrap();
    tokio::spawn(server.run());

    let auth_data = Bytes::from_static(&[5, 4, 3, 2, 1]);
    let result = Client::connect(addr, config, Some(auth_data)).await;
    assert!(matches!(result, Err(crate::client::ClientError::AuthenticationFailed)));
}
