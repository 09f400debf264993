//! TCP front-end: the listen socket, the connection table, and the glue
//! between the event loop and the per-connection state machines.

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, error};

use crate::shm::ShmCache;

use super::conn::{ConnState, McConn};
use super::event_loop::{Driver, EventMgr, READABLE};
use super::stats::Stats;

pub const DEFAULT_PORT: u16 = 11217;

const LISTEN_BACKLOG: libc::c_int = 1024;
const MAX_EVENTS: usize = 1024;

pub struct Server {
    em: Rc<EventMgr>,
    listen_fd: RawFd,
    port: u16,
    conns: HashMap<RawFd, McConn>,
    shmc: ShmCache,
    stats: Stats,
}

impl Server {
    /// Bind the listen socket and register it with a fresh event loop.
    /// Pass port 0 to let the kernel choose; [`port`](Self::port) reports
    /// the actual binding.
    pub fn new(shmc: ShmCache, port: u16, interface: Option<Ipv4Addr>) -> io::Result<Server> {
        let em = Rc::new(EventMgr::new(MAX_EVENTS)?);

        let listen_fd = open_listener(port, interface)?;
        // The connection owns the descriptor from here on; any error below
        // closes it on drop.
        let listener = McConn::new(listen_fd, ConnState::Listening);
        let port = bound_port(listen_fd)?;

        let mut conns = HashMap::new();
        conns.insert(listen_fd, listener);

        em.add(listen_fd, READABLE)?;

        debug!(target: "netshell::server", "listening on port {port}");

        Ok(Server {
            em,
            listen_fd,
            port,
            conns,
            shmc,
            stats: Stats::default(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop flag for the loop; settable from signal handlers or other
    /// threads.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.em.stop_flag()
    }

    /// Run the event loop until the stop flag is raised.
    pub fn run(&mut self) -> io::Result<()> {
        let em = Rc::clone(&self.em);
        em.run(self)
    }

    /// Tear the front-end down, handing the engine back to the caller.
    pub fn into_inner(self) -> ShmCache {
        self.shmc
    }

    fn on_listening(&mut self) {
        let fd = unsafe { libc::accept(self.listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            error!(
                target: "netshell::server",
                "accept failed: {}",
                io::Error::last_os_error()
            );
            return;
        }

        if let Err(e) = set_nonblocking(fd) {
            error!(target: "netshell::server", "fcntl failed: {e}");
            unsafe { libc::close(fd) };
            return;
        }

        let conn = McConn::new(fd, ConnState::Read);
        if let Err(e) = self.em.add(fd, READABLE) {
            error!(target: "netshell::server", "register fd {fd} failed: {e}");
            drop(conn);
        } else {
            debug!(target: "netshell::server", "fd {fd}: accepted");
            self.conns.insert(fd, conn);
        }
    }

    fn close_conn(&mut self, fd: RawFd) {
        let _ = self.em.delete(fd);
        self.conns.remove(&fd);
        debug!(target: "netshell::server", "fd {fd}: closed");
    }
}

impl Driver for Server {
    fn drive(&mut self, fd: RawFd, _events: u32) {
        let state = match self.conns.get(&fd) {
            Some(conn) => conn.state,
            None => return,
        };

        if state == ConnState::Listening {
            self.on_listening();
            return;
        }

        let conn = self.conns.get_mut(&fd).expect("connection vanished");
        conn.drive_machine(&self.shmc, &mut self.stats, &self.em);
        if conn.state == ConnState::Close {
            self.close_conn(fd);
        }
    }

    fn timer(&mut self) {
        debug!(
            target: "netshell::server",
            "tick: {} conns, get {} ({} miss), set {}, del {}, err {}",
            self.conns.len() - 1,
            self.stats.get_cnts,
            self.stats.get_misses,
            self.stats.set_cnts,
            self.stats.del_cnts,
            self.stats.err_cnts
        );
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn open_listener(port: u16, interface: Option<Ipv4Addr>) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = (|| {
        set_nonblocking(fd)?;

        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // Best effort, as for the original socket tuning.
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: match interface {
                    Some(ip) => u32::from(ip).to_be(),
                    None => libc::INADDR_ANY.to_be(),
                },
            },
            sin_zero: [0; 8],
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })();

    match result {
        Ok(()) => Ok(fd),
        Err(e) => {
            unsafe { libc::close(fd) };
            Err(e)
        }
    }
}

fn bound_port(fd: RawFd) -> io::Result<u16> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(u16::from_be(addr.sin_port))
}
