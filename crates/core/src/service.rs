//! Ancillary services started and stopped with the pipeline.
//!
//! The delivery channel (HTTP) and the signaling channel (WebSocket) only
//! run while the pipeline is active. What they speak is up to the host;
//! [`TcpService`] owns the listening socket and accept loop and hands
//! every connection to a [`ConnectionHandler`].

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, SinkError};
use crate::pipeline::Settings;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// A service tied to the pipeline lifecycle.
pub trait AncillaryService: Send {
    fn name(&self) -> &str;

    /// Start serving. Called once per activation, in registration order.
    fn start(&mut self, settings: &Settings) -> Result<()>;

    /// Stop serving. Called in reverse registration order; must not fail.
    fn stop(&mut self);
}

/// Serves one accepted connection. Runs on a dedicated thread.
pub trait ConnectionHandler: Send + Sync {
    fn handle(&self, stream: TcpStream, peer: SocketAddr);
}

impl<F> ConnectionHandler for F
where
    F: Fn(TcpStream, SocketAddr) + Send + Sync,
{
    fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        self(stream, peer)
    }
}

/// Which configured port a [`TcpService`] binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePort {
    /// Page delivery, `Settings::http_port`.
    Http,
    /// Signaling, `Settings::ws_port`.
    Signaling,
}

impl ServicePort {
    fn port(self, settings: &Settings) -> u16 {
        match self {
            ServicePort::Http => settings.http_port,
            ServicePort::Signaling => settings.ws_port,
        }
    }
}

/// TCP listener with a polling accept loop on its own thread.
pub struct TcpService {
    name: String,
    port: ServicePort,
    handler: Arc<dyn ConnectionHandler>,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpService {
    pub fn new(name: &str, port: ServicePort, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            name: name.to_string(),
            port,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: None,
            local_addr: None,
        }
    }

    /// Address actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn bind(&self, settings: &Settings) -> io::Result<TcpListener> {
        let addr = format!("{}:{}", settings.bind_address, self.port.port(settings));
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

impl AncillaryService for TcpService {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, settings: &Settings) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let listener = self.bind(settings).map_err(|e| SinkError::Lifecycle {
            service: self.name.clone(),
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let handler = self.handler.clone();
        let name = self.name.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-accept", self.name))
            .spawn(move || accept_loop(&name, listener, handler, running));
        match spawned {
            Ok(handle) => self.accept_thread = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(SinkError::Lifecycle {
                    service: self.name.clone(),
                    reason: e.to_string(),
                });
            }
        }

        self.local_addr = Some(local_addr);
        tracing::info!(service = %self.name, addr = %local_addr, "service listening");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take()
            && handle.join().is_err()
        {
            tracing::warn!(service = %self.name, "accept thread panicked");
        }
        if self.local_addr.take().is_some() {
            tracing::info!(service = %self.name, "service stopped");
        }
    }
}

impl Drop for TcpService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Source of incoming connections for [`accept_loop`].
trait Acceptor {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Acceptor for TcpListener {
    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self)
    }
}

/// Non-blocking accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval so
/// that [`TcpService::stop`] returns promptly. Accept errors back off for
/// the same interval.
fn accept_loop(
    service: &str,
    listener: impl Acceptor,
    handler: Arc<dyn ConnectionHandler>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                tracing::debug!(service, %peer, "connection accepted");
                let handler = handler.clone();
                thread::spawn(move || handler.handle(stream, peer));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(service, error = %e, "TCP accept error");
                }
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::debug!(service, "accept loop exited");
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn ephemeral() -> Settings {
        Settings {
            bind_address: "127.0.0.1".to_string(),
            http_port: 0,
            ws_port: 0,
            ..Settings::default()
        }
    }

    fn echo() -> Arc<dyn ConnectionHandler> {
        Arc::new(|mut stream: TcpStream, _peer: SocketAddr| {
            let mut buf = [0u8; 4];
            if stream.read_exact(&mut buf).is_ok() {
                let _ = stream.write_all(&buf);
            }
        })
    }

    #[test]
    fn serves_connections_until_stopped() {
        let mut svc = TcpService::new("http", ServicePort::Http, echo());
        svc.start(&ephemeral()).unwrap();
        let addr = svc.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");

        svc.stop();
        assert!(!svc.is_running());
        assert!(svc.local_addr().is_none());
    }

    #[test]
    fn port_in_use_is_a_lifecycle_error() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let settings = Settings {
            bind_address: "127.0.0.1".to_string(),
            ws_port: taken.local_addr().unwrap().port(),
            ..Settings::default()
        };
        let mut svc = TcpService::new("signaling", ServicePort::Signaling, echo());
        match svc.start(&settings) {
            Err(SinkError::Lifecycle { service, .. }) => assert_eq!(service, "signaling"),
            other => panic!("expected lifecycle error, got {other:?}"),
        }
        assert!(!svc.is_running());
    }

    #[test]
    fn restart_after_stop() {
        let mut svc = TcpService::new("http", ServicePort::Http, echo());
        svc.start(&ephemeral()).unwrap();
        svc.stop();
        svc.start(&ephemeral()).unwrap();
        assert!(svc.is_running());
        svc.stop();
    }

    /// Fails every accept, as with a descriptor limit being hit.
    struct Exhausted {
        calls: Arc<AtomicUsize>,
    }

    impl Acceptor for Exhausted {
        fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("too many open files"))
        }
    }

    #[test]
    fn accept_errors_back_off() {
        let calls = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let worker = {
            let acceptor = Exhausted {
                calls: Arc::clone(&calls),
            };
            let running = Arc::clone(&running);
            thread::spawn(move || accept_loop("http", acceptor, echo(), running))
        };
        thread::sleep(Duration::from_millis(300));
        running.store(false, Ordering::SeqCst);
        worker.join().unwrap();

        let calls = calls.load(Ordering::SeqCst);
        assert!((1..=10).contains(&calls), "{calls} accept attempts");
    }
}
