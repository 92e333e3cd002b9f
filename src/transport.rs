//! The transport seam: the bus runs on any non-blocking byte stream. Production uses TCP;
//!  tests plug in in-process duplex pipes (see `test_util`). TLS or other decorations are
//!  expected to be provided by a wrapping factory - the bus treats the stream as opaque.

use std::net::SocketAddr;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use crate::config::BusConfig;
use crate::util::safe_converter::PrecheckedCast;

/// a connected byte-stream transport
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;

/// Produces transports: outbound connects and the inbound accept stream. This is the
///  boundary to the socket layer, introduced to facilitate swapping the I/O substrate out
///  for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<BoxTransport>;

    async fn listen(&self, addr: SocketAddr) -> std::io::Result<Box<dyn Acceptor>>;
}

#[async_trait]
pub trait Acceptor: Send + 'static {
    async fn accept(&mut self) -> std::io::Result<BoxTransport>;

    fn local_addr(&self) -> SocketAddr;
}

/// TCP implementation used in production.
pub struct TcpTransportFactory {
    send_buffer_size: usize,
    receive_buffer_size: usize,
}

impl TcpTransportFactory {
    pub fn new(config: &BusConfig) -> TcpTransportFactory {
        TcpTransportFactory {
            send_buffer_size: config.socket_send_buffer_size,
            receive_buffer_size: config.socket_receive_buffer_size,
        }
    }

    fn socket_for(&self, addr: SocketAddr) -> std::io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        }
        else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(self.send_buffer_size.prechecked_cast())?;
        socket.set_recv_buffer_size(self.receive_buffer_size.prechecked_cast())?;
        Ok(socket)
    }

    fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
        // latency matters more than throughput for a message bus; batching is done above
        stream.set_nodelay(true)
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<BoxTransport> {
        let stream = self.socket_for(addr)?.connect(addr).await?;
        Self::configure_stream(&stream)?;
        debug!("connected to {:?} from {:?}", addr, stream.local_addr()?);
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: SocketAddr) -> std::io::Result<Box<dyn Acceptor>> {
        let socket = self.socket_for(addr)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

struct TcpAcceptor {
    listener: tokio::net::TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> std::io::Result<BoxTransport> {
        let (stream, from) = self.listener.accept().await?;
        TcpTransportFactory::configure_stream(&stream)?;
        debug!("accepted inbound transport from {:?}", from);
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
            .expect("a bound TCP listener has a local addr")
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use super::*;

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let config = BusConfig::default_for("a", SocketAddr::from(([127, 0, 0, 1], 0)));
        let factory = TcpTransportFactory::new(&config);

        let mut acceptor = factory.listen(config.bind_addr).await.unwrap();
        let addr = acceptor.local_addr();

        let client = tokio::spawn(async move {
            let config = BusConfig::default_for("b", SocketAddr::from(([127, 0, 0, 1], 0)));
            let factory = TcpTransportFactory::new(&config);
            let mut transport = factory.connect(addr).await.unwrap();
            transport.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            transport.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });

        let mut server_side = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server_side.write_all(b"pong").await.unwrap();

        client.await.unwrap();
    }
}
