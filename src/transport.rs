//! Single-shot TCP transport: one connection per run

use log::{debug, info};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};

use crate::error::{first_error, Result, TransferError};
use crate::protocol::DEFAULT_PORT;

// Socket tuning: disable Nagle, keepalive, large kernel buffers for throughput
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        unsafe {
            let keepalive: libc::c_int = 1;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &keepalive as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepalive) as libc::socklen_t,
            );

            let sz: libc::c_int = 8 * 1024 * 1024;
            let p = &sz as *const _ as *const libc::c_void;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                p,
                std::mem::size_of_val(&sz) as libc::socklen_t,
            );
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                p,
                std::mem::size_of_val(&sz) as libc::socklen_t,
            );
        }
    }
}

/// Fill in what a bare address leaves out: `:6969` gets a wildcard host when
/// listening and loopback when dialing, and a missing port becomes
/// `DEFAULT_PORT`.
pub fn complete_addr(addr: &str, listening: bool) -> String {
    if addr.parse::<std::net::Ipv6Addr>().is_ok() {
        return format!("[{}]:{}", addr, DEFAULT_PORT);
    }
    if let Some(port) = addr.strip_prefix(':') {
        let host = if listening { "0.0.0.0" } else { "127.0.0.1" };
        return format!("{}:{}", host, port);
    }
    if addr.ends_with(']') || !addr.contains(':') {
        return format!("{}:{}", addr, DEFAULT_PORT);
    }
    addr.to_string()
}

/// Outbound connection to `remote`
pub fn dial(remote: &str) -> Result<TcpStream> {
    let remote = complete_addr(remote, false);
    let stream = TcpStream::connect(&remote)
        .map_err(|e| TransferError::transport(format!("connect {}", remote), e))?;
    tune_socket(&stream);
    match stream.peer_addr() {
        Ok(peer) => info!("Connected: {}", peer),
        Err(_) => info!("Connected: {}", remote),
    }
    Ok(stream)
}

/// Listener that hands out exactly one connection
pub struct OneShotListener {
    listener: TcpListener,
}

impl OneShotListener {
    pub fn bind(bind: &str) -> Result<Self> {
        let bind = complete_addr(bind, true);
        let listener = TcpListener::bind(&bind)
            .map_err(|e| TransferError::transport(format!("bind {}", bind), e))?;
        debug!("Listening: {}", bind);
        Ok(OneShotListener { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TransferError::transport("local address", e))
    }

    /// Accept one connection and stop listening
    pub fn accept(self) -> Result<TcpStream> {
        let (stream, peer) = self
            .listener
            .accept()
            .map_err(|e| TransferError::transport("accept", e))?;
        tune_socket(&stream);
        info!("Accepted connection: {}", peer);
        Ok(stream)
    }
}

/// Bind, accept exactly one inbound connection, then stop listening
pub fn listen_accept(bind: &str) -> Result<TcpStream> {
    OneShotListener::bind(bind)?.accept()
}

/// Close the connection. A peer that already went away is not an error.
pub fn close(stream: TcpStream) -> Result<()> {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(TransferError::transport("close connection", e)),
    }
}

/// Run `f` with an outbound connection, then close it exactly once
pub fn with_dial<T>(remote: &str, f: impl FnOnce(&mut TcpStream) -> Result<T>) -> Result<T> {
    let mut stream = dial(remote)?;
    let outcome = f(&mut stream);
    first_error(outcome, close(stream))
}

/// Run `f` with the one accepted connection, then close it exactly once
pub fn with_listener<T>(
    listener: OneShotListener,
    f: impl FnOnce(&mut TcpStream) -> Result<T>,
) -> Result<T> {
    let mut stream = listener.accept()?;
    let outcome = f(&mut stream);
    first_error(outcome, close(stream))
}

pub fn with_listen<T>(bind: &str, f: impl FnOnce(&mut TcpStream) -> Result<T>) -> Result<T> {
    with_listener(OneShotListener::bind(bind)?, f)
}
