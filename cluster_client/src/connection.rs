//! Node connection: one transport, one driver thread, strictly
//! sequential writes with true pipelining over the wire.
//!
//! A background driver thread owns the socket and drains a request
//! queue fed by `mpsc::Sender`; each enqueued entry carries its own
//! one-shot reply channel instead of writing into a shared outbound
//! stream, so callers can keep enqueueing while earlier requests are
//! still in flight on the wire.

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use logger::logger::Logger;

use crate::channel::Channel;
use crate::config::RespVersion;
use crate::error::{ClientError, ClientResult};
use crate::resp::{encode_command, Decoder, Token};

/// One request enqueued onto the driver's FIFO: the already-encoded
/// bytes, how many tokens the reply is expected to contain, and the
/// one-shot channel to resume with the result.
struct PendingRequest {
    bytes: Vec<u8>,
    expected_tokens: usize,
    reply: Sender<ClientResult<Vec<Token>>>,
}

/// Outcome of `enqueue`'s back-pressure contract.
#[derive(Debug, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued,
    Dropped,
    Terminated,
}

/// A single persistent connection to one node. Writes and reads are
/// serialized by one driver thread; callers may keep
/// enqueueing while earlier requests are still in flight.
pub struct NodeConnection {
    sender: Mutex<Option<Sender<PendingRequest>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    shutdown_handle: Box<dyn Channel>,
}

impl NodeConnection {
    /// Spawns the driver thread over an already-connected channel. If
    /// `resp_version` is RESP3, performs the `HELLO 3` handshake
    /// synchronously first: the first inbound token is
    /// consumed, and an error token fails the connection outright
    /// before the driver thread (and its request queue) ever starts.
    pub fn spawn(
        mut channel: Box<dyn Channel>,
        logger: Logger,
        label: String,
        resp_version: RespVersion,
    ) -> ClientResult<Self> {
        if resp_version == RespVersion::Resp3 {
            hello_handshake(&mut channel)?;
        }
        let shutdown_handle = channel.try_clone_channel()?;
        let (tx, rx) = mpsc::channel::<PendingRequest>();
        let driver = thread::spawn(move || drive(channel, rx, logger, label));
        Ok(NodeConnection {
            sender: Mutex::new(Some(tx)),
            driver: Mutex::new(Some(driver)),
            shutdown_handle,
        })
    }

    fn enqueue(&self, bytes: Vec<u8>, expected_tokens: usize) -> (EnqueueOutcome, Receiver<ClientResult<Vec<Token>>>) {
        let (reply_tx, reply_rx) = mpsc::channel();
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            None => (EnqueueOutcome::Terminated, reply_rx),
            Some(sender) => {
                let req = PendingRequest {
                    bytes,
                    expected_tokens,
                    reply: reply_tx,
                };
                match sender.send(req) {
                    Ok(()) => (EnqueueOutcome::Enqueued, reply_rx),
                    Err(_) => (EnqueueOutcome::Dropped, reply_rx),
                }
            }
        }
    }

    /// Sends a single request, returning its one response token.
    pub fn send(&self, command_bytes: Vec<u8>) -> ClientResult<Token> {
        let (outcome, rx) = self.enqueue(command_bytes, 1);
        if outcome != EnqueueOutcome::Enqueued {
            return Err(ClientError::ConnectionClosed);
        }
        let mut tokens = rx.recv().map_err(|_| ClientError::ConnectionClosed)??;
        tokens.pop().ok_or(ClientError::ConnectionClosed)
    }

    /// Writes once, collects `count` responses in order. A single bad
    /// response does not fail the batch — the caller inspects each
    /// token for error shapes itself.
    pub fn pipeline(&self, command_bytes_concat: Vec<u8>, count: usize) -> ClientResult<Vec<Token>> {
        let (outcome, rx) = self.enqueue(command_bytes_concat, count);
        if outcome != EnqueueOutcome::Enqueued {
            return Err(ClientError::ConnectionClosed);
        }
        rx.recv().map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Stops accepting new requests; in-flight requests still drain.
    pub fn trigger_graceful_shutdown(&self) {
        let mut guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    /// Stops accepting new requests and tears down the transport itself.
    /// Unlike `trigger_graceful_shutdown`, this unblocks a driver thread
    /// currently parked in a blocking read on a request that will never
    /// get a reply, rather than waiting for it to drain naturally.
    pub fn trigger_forceful_shutdown(&self) {
        self.trigger_graceful_shutdown();
        let _ = self.shutdown_handle.shutdown();
    }

    /// Waits for the driver thread to finish, per `run()`'s contract.
    pub fn join(&self) {
        let handle = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Sends `HELLO 3` and blocks for the single reply token it produces.
/// An error token fails the connection with `command_error`; anything
/// else is discarded.
fn hello_handshake(channel: &mut Box<dyn Channel>) -> ClientResult<()> {
    let bytes = encode_command(&[b"HELLO".to_vec(), b"3".to_vec()]);
    channel.write_all(&bytes)?;
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(token) = decoder.try_decode()? {
            return match token.error_message() {
                Some(msg) => Err(ClientError::CommandError(msg.to_string())),
                None => Ok(()),
            };
        }
        let n = channel.read(&mut buf)?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        decoder.feed(&buf[..n]);
    }
}

fn drive(mut channel: Box<dyn Channel>, rx: Receiver<PendingRequest>, logger: Logger, label: String) {
    let mut decoder = Decoder::new();
    for request in rx.iter() {
        if let Err(e) = channel.write_all(&request.bytes) {
            logger.error(&format!("write failed on {label}: {e}"), "node_connection");
            let _ = request.reply.send(Err(ClientError::ConnectionClosed));
            break;
        }
        match read_n_tokens(&mut channel, &mut decoder, request.expected_tokens) {
            Ok(tokens) => {
                let _ = request.reply.send(Ok(tokens));
            }
            Err(e) => {
                logger.error(&format!("read failed on {label}: {e}"), "node_connection");
                let _ = request.reply.send(Err(e));
                break;
            }
        }
    }
    // Channel closed mid-request, or the loop broke above: drain all
    // further enqueued requests with `connection_closed`.
    for leftover in rx.iter() {
        let _ = leftover.reply.send(Err(ClientError::ConnectionClosed));
    }
}

fn read_n_tokens(
    channel: &mut Box<dyn Channel>,
    decoder: &mut Decoder,
    count: usize,
) -> ClientResult<Vec<Token>> {
    let mut tokens = Vec::with_capacity(count);
    let mut buf = [0u8; 4096];
    while tokens.len() < count {
        match decoder.try_decode()? {
            Some(token) => {
                tokens.push(token);
                continue;
            }
            None => {}
        }
        let n = channel.read(&mut buf)?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        decoder.feed(&buf[..n]);
    }
    Ok(tokens)
}

/// Shared handle to a node connection, cloneable across caller threads.
pub type SharedConnection = Arc<NodeConnection>;
