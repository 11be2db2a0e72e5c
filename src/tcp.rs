//! TCP server and client on top of the stream machinery.
//!
//! A [`TcpServer`] is a listening descriptor whose read pump is an
//! accept loop; a [`TcpClient`] is a [`Stream`] whose first write
//! readiness completes a non-blocking connect.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Deref;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::io::{Driver, Registration, set_cloexec, set_nonblocking};
use crate::metrics;
use crate::reactor::{Core, Reactor};
use crate::stream::{ConnectState, Stream, StreamCore};

/// Listener-specific state hanging off a [`Registration`].
pub(crate) struct ListenerCore {
    on_accept: Option<Box<dyn FnMut(&TcpServer, OwnedFd, SocketAddr)>>,
    pub(crate) on_close: Option<Box<dyn FnMut(&TcpServer)>>,
    on_error: Option<Box<dyn FnMut(&TcpServer, io::Error)>>,
}

impl ListenerCore {
    pub(crate) fn clear_handlers(&mut self) {
        self.on_accept = None;
        self.on_close = None;
        self.on_error = None;
    }
}

/// A listening TCP socket delivering accepted descriptors.
#[derive(Clone)]
pub struct TcpServer {
    reg: Rc<Registration>,
    reactor: Weak<Core>,
}

impl TcpServer {
    /// Resolve `host:port`, bind a non-blocking listener with
    /// `SO_REUSEADDR`, and register it. An empty `host` listens on all
    /// interfaces. The accept handler receives each accepted descriptor
    /// (already non-blocking) and its peer address; adopt it with
    /// [`Stream::open`] to start reading.
    pub fn bind(
        reactor: &Reactor,
        host: &str,
        port: u16,
        on_accept: impl FnMut(&TcpServer, OwnedFd, SocketAddr) + 'static,
    ) -> Result<TcpServer, Error> {
        let core = reactor.core();
        let mut last_err = None;
        for addr in resolve(host, port)? {
            match bind_listener(addr, core.config.backlog) {
                Ok(fd) => {
                    let listener = ListenerCore {
                        on_accept: Some(Box::new(on_accept)),
                        on_close: None,
                        on_error: None,
                    };
                    let reg = Registration::new(fd, Driver::Listener(listener), &core.config);
                    core.add(&reg)?;
                    return Ok(TcpServer {
                        reg,
                        reactor: Rc::downgrade(core),
                    });
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Resolve(format!("no addresses for {host}:{port}"))))
    }

    pub(crate) fn from_parts(core: &Rc<Core>, reg: &Rc<Registration>) -> TcpServer {
        TcpServer {
            reg: Rc::clone(reg),
            reactor: Rc::downgrade(core),
        }
    }

    /// The listening descriptor.
    pub fn fd(&self) -> RawFd {
        self.reg.fd()
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.reg.fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        sockaddr_to_socket_addr(&storage)
            .ok_or_else(|| Error::Resolve("unknown address family".into()))
    }

    /// Set the handler invoked exactly once when the listener closes.
    pub fn on_close(&self, handler: impl FnMut(&TcpServer) + 'static) {
        if let Some(listener) = self.reg.driver.borrow_mut().listener_mut() {
            listener.on_close = Some(Box::new(handler));
        }
    }

    /// Set the handler invoked on a fatal accept error. The listener
    /// stays registered; close it explicitly if the error is terminal.
    pub fn on_error(&self, handler: impl FnMut(&TcpServer, io::Error) + 'static) {
        if let Some(listener) = self.reg.driver.borrow_mut().listener_mut() {
            listener.on_error = Some(Box::new(handler));
        }
    }

    /// Stop accepting and close the listener at the next reactor pass.
    pub fn close(&self) {
        self.reg.hard_close();
    }

    /// The reactor this listener is registered on, if still alive.
    pub fn reactor(&self) -> Option<Reactor> {
        self.reactor.upgrade().map(Reactor::from_core)
    }
}

/// An outbound TCP connection. Dereferences to [`Stream`]; all stream
/// handlers and push operations apply once connected (pushes queued
/// before the connect completes drain right after it).
#[derive(Clone)]
pub struct TcpClient {
    stream: Stream,
}

impl TcpClient {
    /// Resolve `host:port` and start a non-blocking connect. The
    /// connect handler fires exactly once when the connection is
    /// established (synchronously, if the connect completes
    /// immediately); a failed connect takes the stream's fatal error
    /// path: error handler, then close handler.
    pub fn connect(
        reactor: &Reactor,
        host: &str,
        port: u16,
        on_connect: impl FnMut(&Stream) + 'static,
    ) -> Result<TcpClient, Error> {
        let core = reactor.core();
        let addrs = resolve(host, port)?;
        let addr = addrs[0];

        let fd = new_socket(&addr)?;
        let (storage, len) = socket_addr_to_sockaddr(addr);
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        let in_progress = if rc == 0 {
            false
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINPROGRESS) {
                true
            } else {
                return Err(Error::Io(err));
            }
        };

        let mut stream_core = StreamCore::new();
        stream_core.connect = Some(ConnectState {
            connected: !in_progress,
            handler: Some(Box::new(on_connect)),
        });
        let stream = Stream::register(core, fd, stream_core)?;

        if in_progress {
            // Completion is reported as write readiness.
            stream.mark_connect_pending();
        } else {
            metrics::CONNECTIONS_ESTABLISHED.increment();
            stream.fire_connect_now();
        }
        Ok(TcpClient { stream })
    }

    /// The underlying stream handle.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

impl Deref for TcpClient {
    type Target = Stream;

    fn deref(&self) -> &Stream {
        &self.stream
    }
}

/// One accept-pump iteration: accept a single connection and hand it to
/// the accept handler; `EAGAIN` clears `can` so the pump yields.
pub(crate) fn perf_accept(core: &Rc<Core>, reg: &Rc<Registration>) {
    match sys_accept(reg.fd()) {
        Ok((fd, peer)) => {
            reg.read.can.set(true);
            metrics::CONNECTIONS_ACCEPTED.increment();
            let server = TcpServer::from_parts(core, reg);
            let handler = reg
                .driver
                .borrow_mut()
                .listener_mut()
                .and_then(|l| l.on_accept.take());
            if let Some(mut handler) = handler {
                handler(&server, fd, peer);
                let mut driver = reg.driver.borrow_mut();
                if let Some(listener) = driver.listener_mut()
                    && listener.on_accept.is_none()
                {
                    listener.on_accept = Some(handler);
                }
            }
        }
        Err(err) => match err.kind() {
            io::ErrorKind::WouldBlock => reg.read.can.set(false),
            io::ErrorKind::Interrupted => reg.read.can.set(true),
            _ => {
                reg.read.can.set(false);
                let handler = reg
                    .driver
                    .borrow_mut()
                    .listener_mut()
                    .and_then(|l| l.on_error.take());
                if let Some(mut handler) = handler {
                    handler(&TcpServer::from_parts(core, reg), err);
                    let mut driver = reg.driver.borrow_mut();
                    if let Some(listener) = driver.listener_mut()
                        && listener.on_error.is_none()
                    {
                        listener.on_error = Some(handler);
                    }
                }
            }
        },
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs().map_err(Error::Io)?.collect();
    if addrs.is_empty() {
        return Err(Error::Resolve(format!("no addresses for {host}:{port}")));
    }
    Ok(addrs)
}

/// Create a non-blocking, close-on-exec stream socket for `addr`'s
/// family.
fn new_socket(addr: &SocketAddr) -> Result<OwnedFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    set_nonblocking(fd.as_raw_fd())?;
    set_cloexec(fd.as_raw_fd())?;
    Ok(fd)
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<OwnedFd, Error> {
    let fd = new_socket(&addr)?;

    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let (storage, len) = socket_addr_to_sockaddr(addr);
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    if rc != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(fd)
}

/// Accept one connection, returning the new descriptor already in
/// non-blocking close-on-exec mode.
#[cfg(target_os = "linux")]
fn sys_accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let accepted = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if accepted < 0 {
        return Err(io::Error::last_os_error());
    }
    let accepted = unsafe { OwnedFd::from_raw_fd(accepted) };
    let peer = sockaddr_to_socket_addr(&storage)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    Ok((accepted, peer))
}

#[cfg(not(target_os = "linux"))]
fn sys_accept(fd: RawFd) -> io::Result<(OwnedFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let accepted =
        unsafe { libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if accepted < 0 {
        return Err(io::Error::last_os_error());
    }
    let accepted = unsafe { OwnedFd::from_raw_fd(accepted) };
    set_nonblocking(accepted.as_raw_fd())?;
    set_cloexec(accepted.as_raw_fd())?;
    let peer = sockaddr_to_socket_addr(&storage)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    Ok((accepted, peer))
}

/// Write a `SocketAddr` into a `sockaddr_storage`, returning the
/// storage and the address length.
fn socket_addr_to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Convert a `sockaddr_storage` to a `SocketAddr`.
fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}
