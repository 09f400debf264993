//! Per-connection protocol state machine.
//!
//! Requests arrive as a `\r\n`-terminated command line in a fixed 312-byte
//! header buffer, optionally followed by a counted payload for the storage
//! commands. Responses go out with `writev` over up to three segments:
//! the formatted header, the body, and a fixed `"\r\nEND\r\n"` trailer
//! whenever a body is present.

use std::ffi::OsStr;
use std::io::{self, Write as _};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use log::debug;

use crate::shm::{CacheError, ShmCache};

use super::event_loop::{EventMgr, READABLE, WRITABLE};
use super::stats::Stats;
use super::token::{tokenize, Token, MAX_TOKENS};

/// Request header buffer size; the enforced maximum command-line length.
pub const REQ_HEADER_SIZE: usize = 312;

const RES_TAIL: &[u8] = b"\r\nEND\r\n";

const STATS_SIZE: usize = 1024;

const CMD_TOKEN: usize = 0;
const KEY_TOKEN: usize = 1;
const FILE_TOKEN: usize = 1;
const FLAG_TOKEN: usize = 2;
const NVAL_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Listening,
    Read,
    NRead,
    Write,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdType {
    Set,
    Add,
    Replace,
    Prepend,
    Append,
}

#[derive(PartialEq)]
enum Drive {
    Stop,
    GoOn,
}

pub struct McConn {
    fd: RawFd,
    pub state: ConnState,

    req_header: [u8; REQ_HEADER_SIZE],
    req_header_bytes: usize,

    req_body: Vec<u8>,
    req_body_bytes: usize,

    res_header: Vec<u8>,
    res_header_bytes: usize,
    res_body: Vec<u8>,
    res_body_bytes: usize,
    res_tail_bytes: usize,

    ctype: CmdType,
    flags: u32,
    tokens: [Token; MAX_TOKENS],
    ntokens: usize,
}

impl McConn {
    pub fn new(fd: RawFd, state: ConnState) -> McConn {
        McConn {
            fd,
            state,
            req_header: [0; REQ_HEADER_SIZE],
            req_header_bytes: 0,
            req_body: Vec::new(),
            req_body_bytes: 0,
            res_header: Vec::new(),
            res_header_bytes: 0,
            res_body: Vec::new(),
            res_body_bytes: 0,
            res_tail_bytes: 0,
            ctype: CmdType::Set,
            flags: 0,
            tokens: [Token::default(); MAX_TOKENS],
            ntokens: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Step the machine until it suspends (waiting for readiness) or lands
    /// in `Close`.
    pub fn drive_machine(&mut self, shmc: &ShmCache, stats: &mut Stats, em: &EventMgr) {
        loop {
            let rc = match self.state {
                ConnState::Read => self.on_read(shmc, stats, em),
                ConnState::NRead => self.on_nread(shmc, stats, em),
                ConnState::Write => self.on_write(em),
                // Close is resolved by the owner; the listener never steps.
                ConnState::Close | ConnState::Listening => break,
            };
            if rc == Drive::Stop {
                break;
            }
        }
    }

    fn out_str(&mut self, s: &str) {
        self.res_header.clear();
        self.res_header.extend_from_slice(s.as_bytes());
    }

    fn server_error(&mut self, e: &CacheError) {
        self.res_header.clear();
        let _ = write!(self.res_header, "SERVER_ERROR {e}\r\n");
    }

    fn to_write(&mut self, em: &EventMgr) -> Drive {
        if em.update(self.fd, WRITABLE).is_ok() {
            self.state = ConnState::Write;
        } else {
            debug!(target: "netshell::conn", "fd {}: re-arm for write failed", self.fd);
            self.state = ConnState::Close;
        }
        Drive::GoOn
    }

    fn on_read(&mut self, shmc: &ShmCache, stats: &mut Stats, em: &EventMgr) -> Drive {
        let mut nn: isize = 1;
        while self.req_header_bytes < REQ_HEADER_SIZE {
            nn = unsafe {
                libc::recv(
                    self.fd,
                    self.req_header.as_mut_ptr().add(self.req_header_bytes) as *mut libc::c_void,
                    REQ_HEADER_SIZE - self.req_header_bytes,
                    0,
                )
            };
            if nn <= 0 {
                break;
            }
            self.req_header_bytes += nn as usize;
        }

        if nn == 0 {
            self.state = ConnState::Close;
            return Drive::GoOn;
        }
        let mut eagain = false;
        if nn < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN)
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
            {
                eagain = true;
            } else {
                debug!(target: "netshell::conn", "fd {}: recv failed: {err}", self.fd);
                self.state = ConnState::Close;
                return Drive::GoOn;
            }
        }

        let filled = self.req_header_bytes;
        let newline = match self.req_header[..filled].iter().position(|&b| b == b'\n') {
            Some(p) => p,
            None => {
                if filled == REQ_HEADER_SIZE {
                    self.out_str("ERROR request header too long\r\n");
                    self.req_header_bytes = 0;
                    return self.to_write(em);
                }
                return Drive::Stop;
            }
        };

        let body_leftover = newline + 1;
        let mut line_end = newline;
        if line_end > 1 && self.req_header[line_end - 1] == b'\r' {
            line_end -= 1;
        }

        let mut tokens = [Token::default(); MAX_TOKENS];
        self.ntokens = tokenize(&self.req_header[..line_end], &mut tokens);
        self.tokens = tokens;

        // get key
        // set/add/replace/prepend/append key flags exptime bytes
        // incr/decr key value
        // delete key
        // quit
        // With no real tokens (a bare newline) index 0 is the sentinel.
        let cmd = if self.ntokens > 1 {
            self.tokens[CMD_TOKEN].bytes(&self.req_header).to_vec()
        } else {
            Vec::new()
        };
        let mut stop = true;
        match (self.ntokens, cmd.as_slice()) {
            (3, b"get") => self.do_get(shmc, stats),
            (6, b"set") => {
                self.ctype = CmdType::Set;
                stop = false;
            }
            (6, b"add") => {
                self.ctype = CmdType::Add;
                stop = false;
            }
            (6, b"replace") => {
                self.ctype = CmdType::Replace;
                stop = false;
            }
            (6, b"prepend") => {
                self.ctype = CmdType::Prepend;
                stop = false;
            }
            (6, b"append") => {
                self.ctype = CmdType::Append;
                stop = false;
            }
            (4, b"incr") => self.do_arith(shmc, stats, true),
            (4, b"decr") => self.do_arith(shmc, stats, false),
            (3, b"delete") => self.do_delete(shmc, stats),
            (2, b"stats") => self.do_stats(shmc, stats),
            (3, b"dump") => self.do_dump(shmc, stats),
            (3, b"load") => self.do_load(shmc, stats),
            (2, b"quit") => {
                self.state = ConnState::Close;
                return Drive::GoOn;
            }
            _ => self.out_str("CLIENT_ERROR unknow command\r\n"),
        }

        if !stop {
            // Counted payload follows (exptime in token 3 is accepted and
            // ignored). Any bytes already buffered past the command line
            // belong to the payload.
            let nval = parse_num(self.tokens[NVAL_TOKEN].bytes(&self.req_header)) as usize;
            let body_size = nval + 2;
            self.req_body.resize(body_size, 0);
            self.req_body_bytes = 0;

            let leftover = filled - body_leftover;
            if leftover > 0 {
                let n = leftover.min(body_size);
                self.req_body[..n]
                    .copy_from_slice(&self.req_header[body_leftover..body_leftover + n]);
                self.req_body_bytes = n;
            }

            self.state = ConnState::NRead;
            if self.req_body_bytes == body_size {
                Drive::GoOn
            } else if eagain {
                Drive::Stop
            } else {
                Drive::GoOn
            }
        } else {
            self.req_header_bytes = 0;
            self.to_write(em)
        }
    }

    fn on_nread(&mut self, shmc: &ShmCache, stats: &mut Stats, em: &EventMgr) -> Drive {
        let body_size = self.req_body.len();
        if self.req_body_bytes != body_size {
            let mut nn: isize = 1;
            while self.req_body_bytes < body_size {
                nn = unsafe {
                    libc::recv(
                        self.fd,
                        self.req_body.as_mut_ptr().add(self.req_body_bytes) as *mut libc::c_void,
                        body_size - self.req_body_bytes,
                        0,
                    )
                };
                if nn <= 0 {
                    break;
                }
                self.req_body_bytes += nn as usize;
            }

            if nn == 0 {
                self.state = ConnState::Close;
                return Drive::GoOn;
            }
            if nn < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN)
                    || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                {
                    return Drive::Stop;
                }
                debug!(target: "netshell::conn", "fd {}: recv failed: {err}", self.fd);
                self.state = ConnState::Close;
                return Drive::GoOn;
            }
        }

        self.flags = parse_num(self.tokens[FLAG_TOKEN].bytes(&self.req_header)) as u32;
        self.do_storage(shmc, stats);

        self.req_header_bytes = 0;
        self.req_body_bytes = 0;
        self.to_write(em)
    }

    fn on_write(&mut self, em: &EventMgr) -> Drive {
        loop {
            let has_body = !self.res_body.is_empty();

            let mut iov: [libc::iovec; 3] = unsafe { std::mem::zeroed() };
            iov[0].iov_base =
                unsafe { self.res_header.as_ptr().add(self.res_header_bytes) } as *mut libc::c_void;
            iov[0].iov_len = self.res_header.len() - self.res_header_bytes;
            let niov = if has_body {
                iov[1].iov_base = unsafe { self.res_body.as_ptr().add(self.res_body_bytes) }
                    as *mut libc::c_void;
                iov[1].iov_len = self.res_body.len() - self.res_body_bytes;
                iov[2].iov_base =
                    unsafe { RES_TAIL.as_ptr().add(self.res_tail_bytes) } as *mut libc::c_void;
                iov[2].iov_len = RES_TAIL.len() - self.res_tail_bytes;
                3
            } else {
                1
            };

            if iov[..niov].iter().map(|v| v.iov_len).sum::<usize>() == 0 {
                break;
            }

            let nn = unsafe { libc::writev(self.fd, iov.as_ptr(), niov as libc::c_int) };
            if nn < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return Drive::Stop,
                    _ => {
                        debug!(target: "netshell::conn", "fd {}: writev failed: {err}", self.fd);
                        self.state = ConnState::Close;
                        return Drive::GoOn;
                    }
                }
            }

            let mut n = nn as usize;
            let adv = n.min(self.res_header.len() - self.res_header_bytes);
            self.res_header_bytes += adv;
            n -= adv;
            if has_body {
                let adv = n.min(self.res_body.len() - self.res_body_bytes);
                self.res_body_bytes += adv;
                n -= adv;
                let adv = n.min(RES_TAIL.len() - self.res_tail_bytes);
                self.res_tail_bytes += adv;
            }
        }

        self.res_header.clear();
        self.res_header_bytes = 0;
        self.res_body.clear();
        self.res_body_bytes = 0;
        self.res_tail_bytes = 0;

        if em.update(self.fd, READABLE).is_ok() {
            self.state = ConnState::Read;
            Drive::Stop
        } else {
            self.state = ConnState::Close;
            Drive::GoOn
        }
    }

    fn do_get(&mut self, shmc: &ShmCache, stats: &mut Stats) {
        stats.get_cnts += 1;

        let key = self.tokens[KEY_TOKEN].bytes(&self.req_header).to_vec();
        match shmc.get(&key) {
            Ok((val, flags)) => {
                self.res_header.clear();
                self.res_header.extend_from_slice(b"VALUE ");
                self.res_header.extend_from_slice(&key);
                let _ = write!(self.res_header, " {} {}\r\n", flags, val.len());
                self.res_body = val;
            }
            Err(CacheError::NotFound) => {
                stats.get_misses += 1;
                self.out_str("END\r\n");
            }
            Err(e) => {
                stats.err_cnts += 1;
                self.server_error(&e);
            }
        }
    }

    fn do_arith(&mut self, shmc: &ShmCache, stats: &mut Stats, incr: bool) {
        let key = self.tokens[KEY_TOKEN].bytes(&self.req_header).to_vec();
        let delta = parse_num(self.tokens[KEY_TOKEN + 1].bytes(&self.req_header));

        let rc = if incr {
            stats.incr_cnts += 1;
            shmc.incr(&key, delta)
        } else {
            stats.decr_cnts += 1;
            shmc.decr(&key, delta)
        };

        match rc {
            Ok(new_val) => {
                self.res_header.clear();
                let _ = write!(self.res_header, "{new_val}\r\n");
            }
            Err(CacheError::NotFound) => {
                if incr {
                    stats.incr_misses += 1;
                } else {
                    stats.decr_misses += 1;
                }
                self.out_str("NOT_FOUND\r\n");
            }
            Err(e) => {
                stats.err_cnts += 1;
                self.server_error(&e);
            }
        }
    }

    fn do_delete(&mut self, shmc: &ShmCache, stats: &mut Stats) {
        stats.del_cnts += 1;

        let key = self.tokens[KEY_TOKEN].bytes(&self.req_header).to_vec();
        match shmc.del(&key) {
            Ok(()) => self.out_str("DELETED\r\n"),
            Err(CacheError::NotFound) => {
                stats.del_misses += 1;
                self.out_str("NOT_FOUND\r\n");
            }
            Err(e) => {
                stats.err_cnts += 1;
                self.server_error(&e);
            }
        }
    }

    fn do_stats(&mut self, shmc: &ShmCache, stats: &mut Stats) {
        let attr = shmc.attr();

        let mut body = Vec::with_capacity(STATS_SIZE);
        let _ = write!(body, "STAT cmd_get {}\r\n", stats.get_cnts);
        let _ = write!(body, "STAT cmd_set {}\r\n", stats.set_cnts);
        let _ = write!(body, "STAT cmd_del {}\r\n", stats.del_cnts);
        let _ = write!(body, "STAT cmd_incr {}\r\n", stats.incr_cnts);
        let _ = write!(body, "STAT cmd_decr {}\r\n", stats.decr_cnts);
        let _ = write!(body, "STAT get_misses {}\r\n", stats.get_misses);
        let _ = write!(body, "STAT del_misses {}\r\n", stats.del_misses);
        let _ = write!(body, "STAT incr_misses {}\r\n", stats.incr_misses);
        let _ = write!(body, "STAT decr_misses {}\r\n", stats.decr_misses);
        let _ = write!(body, "STAT err_cnts {}\r\n", stats.err_cnts);
        let _ = write!(body, "STAT nbuckets {}\r\n", attr.nbuckets);
        let _ = write!(body, "STAT item_min {}\r\n", attr.item_size_min);
        let _ = write!(body, "STAT item_max {}\r\n", attr.item_size_max);
        let _ = write!(body, "STAT item_factor {:.2}\r\n", attr.item_size_factor);
        let _ = write!(body, "STAT evict_free {}\r\n", attr.evict_to_free);
        let _ = write!(body, "STAT default_counter {}\r\n", attr.default_counter);
        let _ = write!(body, "STAT use_flock {}\r\n", attr.use_flock);
        let _ = write!(body, "STAT bytes {}\r\n", attr.mem_used);
        let _ = write!(body, "STAT limit_maxbytes {}\r\n", attr.mem_limit);
        let _ = write!(body, "STAT total_items {}\r\n", attr.nitems);
        // The final line's "\r\n" comes from the fixed response trailer.
        let _ = write!(body, "STAT max_depth {}", attr.max_depth);
        body.truncate(STATS_SIZE);

        self.res_header.clear();
        self.res_body = body;
    }

    fn snapshot_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(
            self.tokens[FILE_TOKEN].bytes(&self.req_header),
        ))
    }

    fn do_dump(&mut self, shmc: &ShmCache, stats: &mut Stats) {
        match shmc.dump(self.snapshot_path()) {
            Ok(()) => self.out_str("DUMPED\r\n"),
            Err(e) => {
                stats.err_cnts += 1;
                self.server_error(&e);
            }
        }
    }

    fn do_load(&mut self, shmc: &ShmCache, stats: &mut Stats) {
        match shmc.load(self.snapshot_path()) {
            Ok(()) => self.out_str("LOADED\r\n"),
            Err(e) => {
                stats.err_cnts += 1;
                self.server_error(&e);
            }
        }
    }

    fn do_storage(&mut self, shmc: &ShmCache, stats: &mut Stats) {
        stats.set_cnts += 1;

        let key = self.tokens[KEY_TOKEN].bytes(&self.req_header).to_vec();
        let nval = self.req_body.len() - 2;
        let flags = self.flags;

        let rc = match self.ctype {
            CmdType::Set => shmc.set(&key, &self.req_body[..nval], flags),
            CmdType::Add => shmc.add(&key, &self.req_body[..nval], flags),
            CmdType::Replace => shmc.replace(&key, &self.req_body[..nval], flags),
            CmdType::Prepend => shmc.prepend(&key, &self.req_body[..nval], flags),
            CmdType::Append => shmc.append(&key, &self.req_body[..nval], flags),
        };

        match (self.ctype, rc) {
            (_, Ok(())) => self.out_str("STORED\r\n"),
            (CmdType::Add, Err(CacheError::Exists)) => self.out_str("EXISTS\r\n"),
            (
                CmdType::Replace | CmdType::Prepend | CmdType::Append,
                Err(CacheError::NotFound),
            ) => self.out_str("NOT_FOUND\r\n"),
            (_, Err(e)) => {
                stats.err_cnts += 1;
                self.server_error(&e);
            }
        }
    }
}

impl Drop for McConn {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

fn parse_num(bytes: &[u8]) -> u64 {
    let mut value: u64 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::parse_num;

    #[test]
    fn parse_num_reads_a_decimal_prefix() {
        assert_eq!(parse_num(b"0"), 0);
        assert_eq!(parse_num(b"11217"), 11217);
        assert_eq!(parse_num(b"5x"), 5);
        assert_eq!(parse_num(b""), 0);
    }
}
