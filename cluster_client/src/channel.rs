//! Transport abstraction.
//!
//! The core never names a concrete transport: a `ChannelFactory`
//! produces an opaque bidirectional byte stream, so TLS or an
//! in-process mock listener can be substituted without touching the
//! node connection.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::ClientResult;

pub trait Channel: Read + Write + Send {
    /// Clones the underlying transport so reader and writer halves can
    /// run on independent threads.
    fn try_clone_channel(&self) -> std::io::Result<Box<dyn Channel>>;

    /// Forcefully interrupts a blocked read/write on this transport.
    /// Plain sockets tear down both halves; transports with nothing to
    /// interrupt (e.g. an in-memory mock) can leave this a no-op.
    fn shutdown(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Channel for TcpStream {
    fn try_clone_channel(&self) -> std::io::Result<Box<dyn Channel>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> std::io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

pub trait ChannelFactory: Send + Sync {
    fn connect(&self, endpoint: &str, port: u16) -> ClientResult<Box<dyn Channel>>;
}

/// Plain, unencrypted TCP transport. TLS setup is out of scope; a
/// caller who needs it supplies their own `ChannelFactory`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpChannelFactory;

impl ChannelFactory for TcpChannelFactory {
    fn connect(&self, endpoint: &str, port: u16) -> ClientResult<Box<dyn Channel>> {
        let stream = TcpStream::connect((endpoint, port))?;
        Ok(Box::new(stream))
    }
}
