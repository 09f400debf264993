//! Level-triggered readiness multiplexer with a ~500 ms timer tick.
//!
//! Connections are registered by file descriptor; every wakeup dispatches
//! the driver once per ready descriptor. The timer callback runs on idle
//! wakeups, and otherwise whenever at least half a second of wall time has
//! passed since the last tick. The loop is reentrant-stop-safe: any callback
//! (or a signal handler holding the stop flag) can request termination and
//! the loop exits at the next iteration.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const READABLE: u32 = libc::EPOLLIN as u32;
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;

const TICK: Duration = Duration::from_millis(500);

/// Dispatch surface the loop drives: one call per ready descriptor, plus the
/// periodic tick.
pub trait Driver {
    fn drive(&mut self, fd: RawFd, events: u32);
    fn timer(&mut self) {}
}

pub struct EventMgr {
    efd: RawFd,
    nevents: usize,
    stop: Arc<AtomicBool>,
}

impl EventMgr {
    pub fn new(nevents: usize) -> io::Result<EventMgr> {
        let efd = unsafe { libc::epoll_create1(0) };
        if efd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventMgr {
            efd,
            nevents,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared stop flag; setting it terminates [`run`](Self::run) at the
    /// next iteration. Safe to store from a signal handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.efd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn update(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Run until the stop flag is raised. `EINTR` on the wait is retried
    /// transparently; any other wait failure is returned.
    pub fn run(&self, driver: &mut dyn Driver) -> io::Result<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.nevents];
        let mut anchor = Instant::now();

        self.stop.store(false, Ordering::Relaxed);

        while !self.stop.load(Ordering::Relaxed) {
            let n = unsafe {
                libc::epoll_wait(
                    self.efd,
                    events.as_mut_ptr(),
                    self.nevents as libc::c_int,
                    TICK.as_millis() as libc::c_int,
                )
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }

            for event in &events[..n as usize] {
                driver.drive(event.u64 as RawFd, event.events);
            }

            if n == 0 {
                driver.timer();
                anchor = Instant::now();
            } else if anchor.elapsed() > TICK {
                driver.timer();
                anchor = Instant::now();
            }
        }

        Ok(())
    }
}

impl Drop for EventMgr {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.efd);
        }
    }
}
