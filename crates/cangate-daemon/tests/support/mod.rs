//! In-memory session harness shared by the daemon integration tests.
//!
//! Sessions run over `tokio::io::duplex`, so the full stack — greeting,
//! frame assembly, mode dispatch, bus relay — is exercised without a TCP
//! listener or a real CAN interface.  A [`MockBusProvider`] supplies
//! scripted buses: tests inject "received" frames through the handle
//! returned by `add_bus` and inspect transmissions via
//! [`MockBus::sent_frames`].

use std::sync::Arc;
use std::time::Duration;

use cangate_core::{BusFrame, FrameAssembler};
use cangate_daemon::application::session::{run_session, SessionContext, SessionError};
use cangate_daemon::infrastructure::bus::mock::{MockBus, MockBusProvider};
use cangate_daemon::infrastructure::network::acceptor::AckHint;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long a test waits for a reply or a bus transmission before failing.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Client half of an in-memory session.
///
/// Replies are cut out of the byte stream with the same assembler the
/// daemon uses, so a single read may yield several buffered replies and a
/// reply split across reads still comes out whole.
pub struct TestClient {
    stream: DuplexStream,
    asm: FrameAssembler,
}

impl TestClient {
    /// Writes raw bytes to the session.
    pub async fn send(&mut self, text: &str) {
        self.stream
            .write_all(text.as_bytes())
            .await
            .expect("write to session");
    }

    /// Waits for the next complete reply frame.
    pub async fn next_reply(&mut self) -> String {
        let mut chunk = [0u8; 512];
        loop {
            if let Some(frame) = self.asm.extract().expect("reply fits the assembler") {
                return frame.as_text().expect("replies are UTF-8").to_string();
            }
            let n = tokio::time::timeout(REPLY_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("reply before timeout")
                .expect("read from session");
            assert!(n > 0, "session closed while a reply was expected");
            self.asm.append(&chunk[..n]);
        }
    }

    /// Reads the `< hi >` greeting; every session starts with it.
    pub async fn expect_greeting(&mut self) {
        assert_eq!(self.next_reply().await, "< hi >", "greeting must come first");
    }

    /// Opens `bus` and asserts the `< ok >` acknowledgement.  The session
    /// sits in BCM mode afterwards.
    pub async fn open_bus(&mut self, bus: &str) {
        self.send(&format!("< open {bus} >")).await;
        assert_eq!(
            self.next_reply().await,
            "< ok >",
            "open must be acknowledged"
        );
    }
}

/// Spawns a session over a duplex pipe with the classic-CAN data limit.
///
/// The pipe buffer is large enough that a test can write a whole
/// oversized flood without the session keeping up.
pub fn spawn_session(
    provider: Arc<MockBusProvider>,
) -> (TestClient, JoinHandle<Result<(), SessionError>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let ctx = SessionContext {
        id: Uuid::new_v4(),
        peer: "duplex".to_string(),
        ack: AckHint::disabled(),
        provider,
        data_limit: 8,
    };
    let task = tokio::spawn(run_session(server, ctx));
    (
        TestClient {
            stream: client,
            asm: FrameAssembler::new(),
        },
        task,
    )
}

/// Polls the mock bus until at least `count` frames were transmitted.
///
/// Raw `< send >` and `< sendpdu >` produce no reply, so tests poll the
/// transmit recorder instead of sleeping a fixed amount.
pub async fn wait_for_sent(bus: &MockBus, count: usize) -> Vec<BusFrame> {
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    loop {
        let sent = bus.sent_frames();
        if sent.len() >= count {
            return sent;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {count} transmitted frames, bus saw {}",
            sent.len()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
