//! Per-origin connection state: the transport handle and the message-ID
//! and token counters.

use std::sync::{Arc, Mutex};

use rand::{random, thread_rng, Rng};
use tokio::task::JoinHandle;

use crate::transport::ClientTransport;

use super::origin::Origin;

/// Message-ID and token allocation for one origin. Both counters are
/// advanced under one lock so every outgoing message gets a fresh pair.
struct Counters {
    message_id: u16,
    token: u32,
}

impl Counters {
    fn new() -> Counters {
        Counters {
            message_id: thread_rng().gen_range(0..u16::MAX),
            token: random(),
        }
    }

    /// 16-bit, wraps 65535 back to 1; never 0 after first use.
    fn next_message_id(&mut self) -> u16 {
        self.message_id = match self.message_id {
            u16::MAX => 1,
            n => n + 1,
        };
        self.message_id
    }

    /// 4-byte big-endian counter, incremented per use.
    fn next_token(&mut self) -> Vec<u8> {
        self.token = self.token.wrapping_add(1);
        self.token.to_be_bytes().to_vec()
    }
}

/// One established connection, owned by the client's connection table.
pub(crate) struct Connection {
    pub(crate) origin: Origin,
    pub(crate) transport: Arc<dyn ClientTransport>,
    counters: Mutex<Counters>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(origin: Origin, transport: Arc<dyn ClientTransport>) -> Connection {
        Connection {
            origin,
            transport,
            counters: Mutex::new(Counters::new()),
            reader: Mutex::new(None),
        }
    }

    pub(crate) fn set_reader(&self, handle: JoinHandle<()>) {
        *self.reader.lock().unwrap() = Some(handle);
    }

    /// Allocate a message-ID/token pair for the next outgoing message.
    pub(crate) fn allocate(&self) -> (u16, Vec<u8>) {
        let mut counters = self.counters.lock().unwrap();
        (counters.next_message_id(), counters.next_token())
    }

    /// Stop the reader task and release the transport. Safe to call more
    /// than once.
    pub(crate) async fn shutdown(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        let _ = self.transport.close().await;
    }
}
