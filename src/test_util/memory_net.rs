//! An in-process transport substrate: duplex pipes behind the [`TransportFactory`] seam,
//!  with a kill switch per logical pipe so tests can fault a live transport at any moment,
//!  and optional single-byte corruption for integrity-fault tests.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::transport::{Acceptor, BoxTransport, TransportFactory};

/// shared fault state of one logical pipe (both directions)
struct KillSwitch {
    killed: AtomicBool,
    corrupt_next_write: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

impl KillSwitch {
    fn new() -> Arc<KillSwitch> {
        Arc::new(KillSwitch {
            killed: AtomicBool::new(false),
            corrupt_next_write: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
        })
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        for waker in self.wakers.lock().unwrap().drain(..) {
            waker.wake();
        }
    }

    fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock().unwrap();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }
}

/// one end of a faultable pipe
struct FaultStream {
    inner: DuplexStream,
    switch: Arc<KillSwitch>,
}

impl FaultStream {
    fn dead(&self) -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "pipe severed by test harness")
    }
}

impl AsyncRead for FaultStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.switch.killed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(self.dead()));
        }
        self.switch.register(cx.waker());
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FaultStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.switch.killed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(self.dead()));
        }
        self.switch.register(cx.waker());

        if !buf.is_empty() && self.switch.corrupt_next_write.swap(false, Ordering::SeqCst) {
            let mut corrupted = buf.to_vec();
            corrupted[buf.len() / 2] ^= 0x20;
            let this = self.get_mut();
            return match Pin::new(&mut this.inner).poll_write(cx, &corrupted) {
                Poll::Pending => {
                    // nothing was written; re-arm for the next attempt
                    this.switch.corrupt_next_write.store(true, Ordering::SeqCst);
                    Poll::Pending
                }
                ready => ready,
            };
        }

        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.switch.killed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(self.dead()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

struct MemoryNetInner {
    listeners: FxHashMap<SocketAddr, UnboundedSender<BoxTransport>>,
    pipes: Vec<Arc<KillSwitch>>,
    next_port: u16,
}

/// An in-process network. Every bus under test shares one `MemoryNet`; listeners register by
///  address, connects hand the far end of a fresh pipe to the listener's accept queue.
pub struct MemoryNet {
    inner: Mutex<MemoryNetInner>,
}

impl MemoryNet {
    pub fn new() -> Arc<MemoryNet> {
        Arc::new(MemoryNet {
            inner: Mutex::new(MemoryNetInner {
                listeners: FxHashMap::default(),
                pipes: Vec::new(),
                next_port: 40_000,
            }),
        })
    }

    /// sever every live pipe: both ends of each transport start failing immediately
    pub fn sever_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for pipe in inner.pipes.drain(..) {
            pipe.kill();
        }
    }

    /// flip one byte in the next write that passes through any live pipe
    pub fn corrupt_next_write(&self) {
        let inner = self.inner.lock().unwrap();
        if let Some(pipe) = inner.pipes.last() {
            pipe.corrupt_next_write.store(true, Ordering::SeqCst);
        }
    }

    /// number of pipes created and not yet severed
    pub fn live_pipes(&self) -> usize {
        self.inner.lock().unwrap().pipes.len()
    }
}

#[async_trait]
impl TransportFactory for MemoryNet {
    async fn connect(&self, addr: SocketAddr) -> io::Result<BoxTransport> {
        let (sender, switch) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(sender) = inner.listeners.get(&addr).cloned() else {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"));
            };
            let switch = KillSwitch::new();
            inner.pipes.push(switch.clone());
            (sender, switch)
        };

        let (near, far) = tokio::io::duplex(256 * 1024);
        let far: BoxTransport = Box::new(FaultStream { inner: far, switch: switch.clone() });
        sender.send(far)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;

        Ok(Box::new(FaultStream { inner: near, switch }))
    }

    async fn listen(&self, addr: SocketAddr) -> io::Result<Box<dyn Acceptor>> {
        let (sender, receiver) = unbounded_channel();
        let mut inner = self.inner.lock().unwrap();

        let addr = if addr.port() == 0 {
            inner.next_port += 1;
            SocketAddr::new(addr.ip(), inner.next_port)
        }
        else {
            addr
        };

        if inner.listeners.insert(addr, sender).is_some() {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
        }

        Ok(Box::new(MemoryAcceptor { receiver, addr }))
    }
}

struct MemoryAcceptor {
    receiver: UnboundedReceiver<BoxTransport>,
    addr: SocketAddr,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&mut self) -> io::Result<BoxTransport> {
        self.receiver.recv().await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "memory net shut down"))
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let net = MemoryNet::new();
        let mut acceptor = net.listen(addr(1000)).await.unwrap();

        let mut client = net.connect(addr(1000)).await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_connect_without_listener_refused() {
        let net = MemoryNet::new();
        assert!(net.connect(addr(4711)).await.is_err());
    }

    #[tokio::test]
    async fn test_sever_fails_both_ends() {
        let net = MemoryNet::new();
        let mut acceptor = net.listen(addr(1000)).await.unwrap();
        let mut client = net.connect(addr(1000)).await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        // a blocked read must be woken by the kill, not hang
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            server.read_exact(&mut buf).await
        });

        tokio::task::yield_now().await;
        net.sever_all();

        assert!(reader.await.unwrap().is_err());
        assert!(client.write_all(b"x").await.is_err());
        assert_eq!(net.live_pipes(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_next_write_flips_one_byte() {
        let net = MemoryNet::new();
        let mut acceptor = net.listen(addr(1000)).await.unwrap();
        let mut client = net.connect(addr(1000)).await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        net.corrupt_next_write();
        client.write_all(b"aaaa").await.unwrap();
        client.write_all(b"bbbb").await.unwrap();

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();

        let flipped = buf.iter().zip(b"aaaabbbb").filter(|(a, b)| a != b).count();
        assert_eq!(flipped, 1);
        assert_eq!(&buf[4..], b"bbbb");
    }

    #[tokio::test]
    async fn test_port_zero_gets_assigned() {
        let net = MemoryNet::new();
        let acceptor = net.listen(addr(0)).await.unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
    }
}
