//! Shared harness for the integration tests: a DAP client talking to the
//! real server over an in-memory duplex pipe, with the server attached to a
//! scripted [`MockVm`].

use std::{collections::VecDeque, sync::Arc, time::Duration};

use serde_json::{json, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use vela_dap::{
    config::DapConfig,
    dap::{DapReader, DapWriter},
    server, DebugSession,
};
use vela_vdwp::{mock::MockVm, Location};

const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DapClient {
    reader: DapReader<ReadHalf<DuplexStream>>,
    writer: DapWriter<WriteHalf<DuplexStream>>,
    next_seq: i64,
    inbox: VecDeque<Value>,
}

impl DapClient {
    /// Start a fresh server on an in-memory pipe and return the client end.
    pub fn start(config: DapConfig) -> Self {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_end);
        let session = Arc::new(DebugSession::new(config));
        tokio::spawn(async move {
            let _ = server::run(session, server_read, server_write).await;
        });

        let (client_read, client_write) = tokio::io::split(client_end);
        Self {
            reader: DapReader::new(client_read),
            writer: DapWriter::new(client_write),
            next_seq: 1,
            inbox: VecDeque::new(),
        }
    }

    async fn read_message(&mut self) -> Value {
        tokio::time::timeout(MESSAGE_TIMEOUT, self.reader.read_value())
            .await
            .expect("timed out waiting for a dap message")
            .expect("dap read failed")
            .expect("dap stream closed")
    }

    /// Send a request and wait for its response, buffering any events that
    /// arrive in between.
    pub async fn request(&mut self, command: &str, arguments: Value) -> Value {
        let seq = self.next_seq;
        self.next_seq += 1;
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.writer.write_value(&request).await.expect("dap write failed");

        loop {
            let message = self.read_message().await;
            if message["type"] == "response" && message["request_seq"] == seq {
                return message;
            }
            self.inbox.push_back(message);
        }
    }

    pub async fn request_ok(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments).await;
        assert_eq!(
            response["success"], true,
            "request {command} failed: {response}"
        );
        response["body"].clone()
    }

    pub async fn request_err(&mut self, command: &str, arguments: Value) -> String {
        let response = self.request(command, arguments).await;
        assert_eq!(
            response["success"], false,
            "request {command} unexpectedly succeeded: {response}"
        );
        response["message"].as_str().unwrap_or_default().to_string()
    }

    /// The next event with the given name, buffered or freshly read.
    pub async fn next_event(&mut self, name: &str) -> Value {
        if let Some(pos) = self
            .inbox
            .iter()
            .position(|message| message["type"] == "event" && message["event"] == name)
        {
            return self.inbox.remove(pos).expect("indexed event vanished");
        }
        loop {
            let message = self.read_message().await;
            if message["type"] == "event" && message["event"] == name {
                return message;
            }
            self.inbox.push_back(message);
        }
    }

    /// Assert that no event with this name is buffered or arrives within the
    /// quiet window.
    pub async fn expect_no_event(&mut self, name: &str, window: Duration) {
        assert!(
            !self
                .inbox
                .iter()
                .any(|message| message["type"] == "event" && message["event"] == name),
            "unexpected buffered {name} event"
        );
        let result = tokio::time::timeout(window, async {
            loop {
                let message = self.read_message().await;
                if message["type"] == "event" && message["event"] == name {
                    return message;
                }
                self.inbox.push_back(message);
            }
        })
        .await;
        assert!(result.is_err(), "unexpected {name} event: {result:?}");
    }
}

/// Run `initialize` + `attach` against the mock and consume the handshake
/// events.
pub async fn attach(client: &mut DapClient, vm: &MockVm) {
    client
        .request_ok(
            "initialize",
            json!({ "clientName": "vela-dap-tests", "linesStartAt1": true }),
        )
        .await;
    client.next_event("initialized").await;
    client
        .request_ok(
            "attach",
            json!({ "host": "127.0.0.1", "port": vm.addr().port() }),
        )
        .await;
}

/// Suspend a thread and return its innermost DAP frame id.
pub async fn pause_and_top_frame(client: &mut DapClient, thread: u64) -> i64 {
    client
        .request_ok("pause", json!({ "threadId": thread }))
        .await;
    let stopped = client.next_event("stopped").await;
    assert_eq!(stopped["body"]["reason"], "pause");
    let body = client
        .request_ok("stackTrace", json!({ "threadId": thread }))
        .await;
    body["stackFrames"][0]["id"]
        .as_i64()
        .expect("stack frame id")
}

pub fn loc(function_id: u64, code_index: u64) -> Location {
    Location {
        function_id,
        code_index,
    }
}
