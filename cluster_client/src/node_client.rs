//! Node client / pool: the lifecycle wrapper around one node's
//! connection(s), exposing `execute`/`execute_many`/`execute_with_ask`.
//!
//! A single persistent connection with reconnect — dial, handshake,
//! then hand the socket to a background driver thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use logger::logger::Logger;

use crate::channel::ChannelFactory;
use crate::config::RespVersion;
use crate::error::{ClientError, ClientResult};
use crate::node_id::NodeId;
use crate::resp::{encode_command, encode_pipeline, Token};

use crate::connection::NodeConnection;

/// Prefixes a pipeline with `ASKING` before each real command; the
/// response to each `ASKING` is discarded.
fn build_ask_pipeline(commands: &[Vec<Vec<u8>>]) -> (Vec<u8>, usize) {
    let mut interleaved: Vec<Vec<Vec<u8>>> = Vec::with_capacity(commands.len() * 2);
    for cmd in commands {
        interleaved.push(vec![b"ASKING".to_vec()]);
        interleaved.push(cmd.clone());
    }
    (encode_pipeline(&interleaved), interleaved.len())
}

pub struct NodeClient {
    id: NodeId,
    connection: Mutex<Option<Arc<NodeConnection>>>,
    factory: Arc<dyn ChannelFactory>,
    logger: Logger,
    resp_version: RespVersion,
    shut_down: AtomicBool,
}

impl NodeClient {
    pub fn new(
        id: NodeId,
        factory: Arc<dyn ChannelFactory>,
        logger: Logger,
        resp_version: RespVersion,
    ) -> ClientResult<Self> {
        let client = NodeClient {
            connection: Mutex::new(None),
            id,
            factory,
            logger,
            resp_version,
            shut_down: AtomicBool::new(false),
        };
        client.ensure_connected()?;
        Ok(client)
    }

    fn ensure_connected(&self) -> ClientResult<Arc<NodeConnection>> {
        let mut guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let transport = self.factory.connect(&self.id.endpoint, self.id.port)?;
        let conn = Arc::new(NodeConnection::spawn(
            transport,
            self.logger.clone(),
            self.id.to_string(),
            self.resp_version,
        )?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn invalidate(&self) {
        let mut guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Sends one command, decoding its single response token.
    pub fn execute(&self, args: &[Vec<u8>]) -> ClientResult<Token> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ClientError::ClusterClientIsShutDown);
        }
        let conn = self.ensure_connected()?;
        let bytes = encode_command(args);
        match conn.send(bytes) {
            Ok(token) => Ok(token),
            Err(ClientError::ConnectionClosed) => {
                self.invalidate();
                Err(ClientError::ConnectionClosed)
            }
            Err(other) => Err(other),
        }
    }

    /// Pipelines several commands on one connection.
    pub fn execute_many(&self, commands: &[Vec<Vec<u8>>]) -> ClientResult<Vec<Token>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ClientError::ClusterClientIsShutDown);
        }
        let conn = self.ensure_connected()?;
        let bytes = encode_pipeline(commands);
        match conn.pipeline(bytes, commands.len()) {
            Ok(tokens) => Ok(tokens),
            Err(ClientError::ConnectionClosed) => {
                self.invalidate();
                Err(ClientError::ConnectionClosed)
            }
            Err(other) => Err(other),
        }
    }

    /// Pipelines with each request preceded by `ASKING`, discarding the
    /// `ASKING` acknowledgements before returning the real responses.
    pub fn execute_with_ask(&self, commands: &[Vec<Vec<u8>>]) -> ClientResult<Vec<Token>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ClientError::ClusterClientIsShutDown);
        }
        let conn = self.ensure_connected()?;
        let (bytes, total) = build_ask_pipeline(commands);
        let all = match conn.pipeline(bytes, total) {
            Ok(tokens) => tokens,
            Err(ClientError::ConnectionClosed) => {
                self.invalidate();
                return Err(ClientError::ConnectionClosed);
            }
            Err(other) => return Err(other),
        };
        Ok(all
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 1)
            .map(|(_, t)| t)
            .collect())
    }

    /// Stops accepting new requests and closes the underlying
    /// connection once in-flight requests finish.
    pub fn trigger_graceful_shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = guard.as_ref() {
            conn.trigger_graceful_shutdown();
        }
    }

    /// Stops accepting new requests and tears down the underlying
    /// transport immediately. The
    /// cluster client calls this after `trigger_graceful_shutdown` has
    /// had a bounded timeout to drain in-flight requests on its own.
    pub fn trigger_forceful_shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = guard.as_ref() {
            conn.trigger_forceful_shutdown();
        }
    }

    /// Blocks until the connection's driver thread has finished,
    /// matching `run()`'s contract.
    pub fn run(&self) {
        let conn = {
            let guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        if let Some(conn) = conn {
            conn.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::io::{self, Read, Write};
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    struct MockFactory {
        to_read: Vec<Vec<u8>>,
    }

    struct MockChannel {
        to_read: StdArc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut q = self.to_read.lock().unwrap();
            if q.is_empty() {
                return Ok(0);
            }
            let chunk = q.remove(0);
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }
    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Channel for MockChannel {
        fn try_clone_channel(&self) -> io::Result<Box<dyn Channel>> {
            Ok(Box::new(MockChannel {
                to_read: self.to_read.clone(),
            }))
        }
    }

    impl ChannelFactory for MockFactory {
        fn connect(&self, _endpoint: &str, _port: u16) -> ClientResult<Box<dyn Channel>> {
            Ok(Box::new(MockChannel {
                to_read: StdArc::new(StdMutex::new(self.to_read.clone())),
            }))
        }
    }

    #[test]
    fn test01_execute_single() {
        let factory = Arc::new(MockFactory {
            to_read: vec![b"$3\r\nbar\r\n".to_vec()],
        });
        let client = NodeClient::new(NodeId::new("127.0.0.1", 6379), factory, Logger::null(), RespVersion::Resp2).unwrap();
        let token = client.execute(&[b"GET".to_vec(), b"foo".to_vec()]).unwrap();
        assert_eq!(token, Token::BlobString(b"bar".to_vec()));
        client.trigger_graceful_shutdown();
    }

    #[test]
    fn test02_execute_with_ask_discards_asking_ack() {
        let factory = Arc::new(MockFactory {
            to_read: vec![b"+OK\r\n$3\r\nbaz\r\n".to_vec()],
        });
        let client = NodeClient::new(NodeId::new("127.0.0.1", 6379), factory, Logger::null(), RespVersion::Resp2).unwrap();
        let tokens = client
            .execute_with_ask(&[vec![b"GET".to_vec(), b"foo".to_vec()]])
            .unwrap();
        assert_eq!(tokens, vec![Token::BlobString(b"baz".to_vec())]);
        client.trigger_graceful_shutdown();
    }

    #[test]
    fn test03_shutdown_rejects_new_requests() {
        let factory = Arc::new(MockFactory {
            to_read: vec![b"$3\r\nbar\r\n".to_vec()],
        });
        let client = NodeClient::new(NodeId::new("127.0.0.1", 6379), factory, Logger::null(), RespVersion::Resp2).unwrap();
        client.trigger_graceful_shutdown();
        let result = client.execute(&[b"GET".to_vec(), b"foo".to_vec()]);
        assert_eq!(result, Err(ClientError::ClusterClientIsShutDown));
    }
}
