use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use netshell::net::server::DEFAULT_PORT;
use netshell::{Attr, Server, ShmCache};

const DEFAULT_TOKEN: &str = "/dev/shm/netshell.mmap";

static STOP: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_sig: libc::c_int) {
    if let Some(flag) = STOP.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

struct Options {
    interface: Option<Ipv4Addr>,
    port: u16,
    mem_limit: u64,
    evict_to_free: u32,
    item_size_min: u64,
    item_size_max: u64,
    item_size_factor: f32,
    nbuckets: u32,
    token: PathBuf,
    mode: u32,
    default_counter: u32,
    use_flock: u32,
    new_map: bool,
    daemonize: bool,
    pidfile: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            interface: None,
            port: DEFAULT_PORT,
            mem_limit: 64 * 1024 * 1024,
            evict_to_free: 1,
            item_size_min: 64,
            item_size_max: 1024 * 1024,
            item_size_factor: 2.0,
            nbuckets: 65536,
            token: PathBuf::from(DEFAULT_TOKEN),
            mode: 0o644,
            default_counter: 0,
            use_flock: 0,
            new_map: false,
            daemonize: false,
            pidfile: None,
        }
    }
}

fn usage(error: Option<&str>) {
    if let Some(error) = error {
        eprintln!("{error}\n");
    }
    eprintln!(
        "usage: netshell [option]\n\
         \x20   -i interface to listen on (default: all addresses)\n\
         \x20   -p listen port, default 11217\n\
         \x20   -m max memory to use in megabytes (default: 64 MB)\n\
         \x20   -M return error on memory exhausted (rather than LRU)\n\
         \x20   -n <bytes>  minimum space allocated for key+value (default: 64)\n\
         \x20   -f <factor> chunk size growth factor (default: 2)\n\
         \x20   -P <file> save PID in <file>, only used with -d option\n\
         \x20   -I override the maximum item size (default: 1mb, min: 1k, max: 128m)\n\
         \x20   -d run as daemon, default no\n\
         \x20   -b max bucket count (default: 65536)\n\
         \x20   -t mmap file (default: {DEFAULT_TOKEN})\n\
         \x20   -u token's mode, octal (default: 0644)\n\
         \x20   -c use default counter (default: no)\n\
         \x20   -l use flock instead of the in-region rwlock (default: no)\n\
         \x20   -a afresh new map: unlink the old map first (default: use old)"
    );
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(|s| s.as_str())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-i" => {
                let v = value(args, &mut i, "-i")?;
                opts.interface = Some(v.parse().map_err(|_| format!("invalid -i value {v}"))?);
            }
            "-p" => {
                let v = value(args, &mut i, "-p")?;
                opts.port = v.parse().map_err(|_| format!("invalid -p value {v}"))?;
            }
            "-m" => {
                let v = value(args, &mut i, "-m")?;
                let mb: u64 = v.parse().map_err(|_| format!("invalid -m value {v}"))?;
                opts.mem_limit = mb * 1024 * 1024;
            }
            "-M" => opts.evict_to_free = 0,
            "-n" => {
                let v = value(args, &mut i, "-n")?;
                opts.item_size_min = v.parse().map_err(|_| format!("invalid -n value {v}"))?;
            }
            "-f" => {
                let v = value(args, &mut i, "-f")?;
                opts.item_size_factor =
                    v.parse().map_err(|_| format!("invalid -f value {v}"))?;
            }
            "-P" => opts.pidfile = Some(PathBuf::from(value(args, &mut i, "-P")?)),
            "-I" => {
                let v = value(args, &mut i, "-I")?;
                opts.item_size_max = v.parse().map_err(|_| format!("invalid -I value {v}"))?;
            }
            "-d" => opts.daemonize = true,
            "-b" => {
                let v = value(args, &mut i, "-b")?;
                opts.nbuckets = v.parse().map_err(|_| format!("invalid -b value {v}"))?;
            }
            "-t" => opts.token = PathBuf::from(value(args, &mut i, "-t")?),
            "-u" => {
                let v = value(args, &mut i, "-u")?;
                opts.mode = u32::from_str_radix(v, 8)
                    .map_err(|_| format!("invalid -u value {v}"))?;
            }
            "-c" => opts.default_counter = 1,
            "-l" => opts.use_flock = 1,
            "-a" => opts.new_map = true,
            "-h" => {
                usage(None);
                process::exit(0);
            }
            other => return Err(format!("unknown option {other}")),
        }
        i += 1;
    }

    Ok(opts)
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(e) => {
            usage(Some(&e));
            process::exit(1);
        }
    };

    if opts.item_size_max < 1024 || opts.item_size_max > 128 * 1024 * 1024 {
        usage(Some("invalid -I parameter"));
        process::exit(1);
    }

    let attr = Attr {
        mem_limit: opts.mem_limit,
        item_size_min: opts.item_size_min,
        item_size_max: opts.item_size_max,
        nbuckets: opts.nbuckets,
        mode: opts.mode,
        item_size_factor: opts.item_size_factor,
        evict_to_free: opts.evict_to_free,
        default_counter: opts.default_counter,
        use_flock: opts.use_flock,
        ..Attr::default()
    };

    if opts.daemonize {
        let rc = unsafe { libc::daemon(1, 1) };
        if rc < 0 {
            eprintln!(
                "can't daemonize: {}",
                std::io::Error::last_os_error()
            );
            process::exit(1);
        }
    }

    if let Some(pidfile) = &opts.pidfile {
        if let Err(e) = fs::write(pidfile, process::id().to_string()) {
            eprintln!("can't write pidfile {}: {e}", pidfile.display());
        }
    }

    if opts.new_map {
        let _ = fs::remove_file(&opts.token);
    }

    let shmc = match ShmCache::create(&opts.token, &attr) {
        Ok(shmc) => shmc,
        Err(e) => {
            eprintln!("can't init cache at {}: {e}", opts.token.display());
            process::exit(1);
        }
    };

    let mut server = match Server::new(shmc, opts.port, opts.interface) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("can't start netshell: {e}");
            process::exit(1);
        }
    };

    let _ = STOP.set(server.stop_flag());
    unsafe {
        let handler = on_signal as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    if let Err(e) = server.run() {
        eprintln!("event loop failed: {e}");
    }

    server.into_inner().destroy();

    if let Some(pidfile) = &opts.pidfile {
        let _ = fs::remove_file(pidfile);
    }
}
