//! TCP echo server on a `DualServerTaskPool`
//!
//! One listener loop accepts with a `poll(2)` timeout so it never blocks
//! past a stop request; a fixed fleet of handler loops echoes each
//! connection until the peer closes, goes idle, or the server stops.
//!
//! Usage:
//!     ./target/release/taskpool-echo [port] [seconds]
//!
//! `seconds` = 0 runs until killed. Pool sizes come from the
//! `TASKPOOL_*` environment variables.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use taskpool::{
    tp_error, tp_info, DualServerTaskPool, ServerHandler, ServerTaskPool, ServerTaskPoolOptions,
};

const ACCEPT_POLL_MS: u16 = 100;
const READ_TIMEOUT: Duration = Duration::from_millis(200);
const IDLE_LIMIT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    active: AtomicU64,
    errors: AtomicU64,
}

struct Echo {
    listener: TcpListener,
    stopping: AtomicBool,
    stats: Stats,
}

impl Echo {
    fn serve(&self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut buf = [0u8; 4096];
        let mut last_data = Instant::now();

        loop {
            if self.stopping.load(Ordering::Relaxed) || last_data.elapsed() > IDLE_LIMIT {
                return Ok(());
            }
            match stream.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    last_data = Instant::now();
                    self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                    stream.write_all(&buf[..n])?;
                    self.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl ServerHandler<TcpStream> for Echo {
    fn get_context(&self) -> Option<TcpStream> {
        let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ACCEPT_POLL_MS)) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                tp_error!("echo: poll failed: {}", e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        match self.listener.accept() {
            Ok((stream, _addr)) => {
                self.stats.accepts.fetch_add(1, Ordering::Relaxed);
                // Accepted sockets inherit non-blocking mode from the listener
                if let Err(e) = stream.set_nonblocking(false) {
                    tp_error!("echo: set_nonblocking failed: {}", e);
                }
                Some(stream)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                tp_error!("echo: accept failed: {}", e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn handle(&self, stream: TcpStream) {
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.serve(stream) {
            tp_error!("echo: connection error: {}", e);
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

fn main() {
    taskpool::init_logging();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9998);
    let seconds: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    if let Err(e) = run(port, seconds) {
        eprintln!("taskpool-echo: {}", e);
        std::process::exit(1);
    }
}

fn run(port: u16, seconds: u64) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;

    let echo = Arc::new(Echo {
        listener,
        stopping: AtomicBool::new(false),
        stats: Stats::default(),
    });

    let options = ServerTaskPoolOptions::from_env().name("echo");
    eprintln!(
        "taskpool-echo: listening on 0.0.0.0:{} ({} listener, {} handlers)",
        port, options.max_active_listener_workers, options.max_active_handler_workers
    );

    let server = DualServerTaskPool::from_handler(Arc::clone(&echo), options)?;
    server.start()?;

    let start = Instant::now();
    loop {
        std::thread::sleep(Duration::from_secs(5));
        let s = &echo.stats;
        eprintln!(
            "[{:.1}s] active={} accepts={} bytes_in={} bytes_out={} err={} queued={}",
            start.elapsed().as_secs_f64(),
            s.active.load(Ordering::Relaxed),
            s.accepts.load(Ordering::Relaxed),
            s.bytes_in.load(Ordering::Relaxed),
            s.bytes_out.load(Ordering::Relaxed),
            s.errors.load(Ordering::Relaxed),
            server.handoff().len(),
        );
        if seconds > 0 && start.elapsed().as_secs() >= seconds {
            break;
        }
    }

    echo.stopping.store(true, Ordering::Relaxed);
    server.stop()?;
    tp_info!("echo: {:?}", server.stats());
    eprintln!("taskpool-echo: stopped after {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}
