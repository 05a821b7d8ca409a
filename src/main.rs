//! Entry point: CLI parsing, daemonization, the handful of signals this
//! daemon actually traps (`SIGUSR1` debug-log toggle, the two real-time VT
//! handshake signals), and the single calloop `EventLoop` that everything
//! else in this crate is generic over. Grounded on `main.c`'s `main()`.

mod bus;
mod config;
mod database;
mod device;
mod error;
mod eventlog;
mod idle;
mod inhibit;
mod manager;
mod pidfile;
mod pipeline;
mod process_group;
mod runtime_dir;
mod seat;
mod session;
mod sysdeps;
mod vt_monitor;

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, Mode as IoMode, PostAction};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

use bus::Bus;
use inhibit::{InhibitHandler, InhibitManager, LockMode};
use manager::{Manager, ManagerHandler};
use pidfile::PidFile;
use vt_monitor::{VtMonitor, VtMonitorHandler};

const RUNDIR: &str = "/var/run";
const SEAT_CONFIG_DIR: &str = "/etc/ConsoleKit/seats.d";
const SCRIPTS_DIR: &str = "/usr/libexec/ConsoleKit/scripts";
const CONSOLE_DEVICE: &str = "/dev/tty0";
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(30);
const TIMED_EXIT_DELAY: Duration = Duration::from_secs(30);

type LogReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Console kit daemon (spec §1): a session, seat and power-management
/// broker for multi-user Unix hosts.
#[derive(Parser, Debug)]
#[command(name = "consoled", about = "Console kit daemon")]
struct Cli {
    /// Enable debugging code
    #[arg(long)]
    debug: bool,
    /// Don't become a daemon
    #[arg(long = "no-daemon")]
    no_daemon: bool,
    /// Exit after a time — for debugging
    #[arg(long = "timed-exit")]
    timed_exit: bool,
}

/// The single event-loop state type every generic component in this crate
/// is instantiated over (`Manager<Daemon>`, `InhibitManager<Daemon>`,
/// `VtMonitor<Daemon>`).
struct Daemon {
    manager: Manager<Daemon>,
    vt_monitor: Option<VtMonitor<Daemon>>,
    bus: Bus,
    log_reload: LogReloadHandle,
    debug_on: bool,
}

impl Daemon {
    fn toggle_debug_logging(&mut self) {
        self.debug_on = !self.debug_on;
        let directive = if self.debug_on { "debug" } else { "info" };
        if self.log_reload.reload(EnvFilter::new(directive)).is_err() {
            warn!("failed to reload log filter");
        } else {
            info!(debug = self.debug_on, "toggled debug logging");
        }
    }
}

impl ManagerHandler for Daemon {
    fn manager_mut(&mut self) -> &mut Manager<Daemon> {
        &mut self.manager
    }

    fn flush_manager_events(&mut self) {
        let bus = self.bus.clone();
        bus.flush_events(self);
    }
}

impl InhibitHandler for Daemon {
    fn inhibit_manager(&mut self) -> &mut InhibitManager<Daemon> {
        self.manager.inhibit_manager()
    }

    fn inhibit_changed(&mut self, mode: LockMode, event_index: usize, enabled: bool) {
        let bus = self.bus.clone();
        bus.emit_inhibitor_changed(mode, event_index, enabled);
        // The last DELAY inhibitor for the in-flight action just released:
        // fast-forward rather than waiting out the rest of the grace period
        // (spec §4.1.2 step 5).
        if mode == LockMode::Delay && !enabled {
            self.manager.maybe_fast_forward_action();
        }
        bus.flush_events(self);
    }
}

impl VtMonitorHandler for Daemon {
    fn vt_monitor_mut(&mut self) -> &mut VtMonitor<Daemon> {
        self.vt_monitor.as_mut().expect("poll timer only runs once a VtMonitor has been installed")
    }

    fn vt_active_changed(&mut self, vt: i32) {
        self.manager.elect_active_session_on_vt(vt);
        let bus = self.bus.clone();
        bus.resolve_pending_activate_success(vt);
        bus.flush_events(self);
    }

    fn vt_activate_timed_out(&mut self, requested_vt: i32) {
        debug!(vt = requested_vt, "VT activate request pre-empted before landing");
        self.bus.clone().resolve_pending_activate_timeout(requested_vt);
    }
}

fn main() {
    let cli = Cli::parse();

    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("You must be root to run this program");
        std::process::exit(1);
    }

    if !cli.no_daemon {
        if let Err(err) = nix::unistd::daemon(false, false) {
            eprintln!("Could not daemonize: {err}");
            std::process::exit(1);
        }
    }

    let log_reload = setup_logging(cli.debug);

    info!("initializing consoled");

    let bus = match Bus::connect() {
        Ok(bus) => bus,
        Err(err) => {
            eprintln!("Could not acquire org.freedesktop.ConsoleKit on the system bus: {err}");
            std::process::exit(1);
        }
    };

    let mut event_loop: EventLoop<'static, Daemon> = EventLoop::try_new().expect("failed to create event loop");
    let loop_handle = event_loop.handle();

    let inhibit_dir = PathBuf::from(RUNDIR).join("ConsoleKit/inhibit");
    let inhibit = InhibitManager::new(inhibit_dir, loop_handle.clone()).expect("failed to set up inhibit directory");

    let seats = config::load_seats_from_dir(Path::new(SEAT_CONFIG_DIR));
    let mut manager = Manager::new(loop_handle.clone(), inhibit, RUNDIR, PathBuf::from(SCRIPTS_DIR), seats);

    let vt_monitor = match VtMonitor::new(CONSOLE_DEVICE, loop_handle.clone()) {
        Ok((mut vtm, current)) => {
            vtm.start_polling();
            debug!(vt = current, "VT monitor watching");
            Some(vtm)
        }
        Err(err) => {
            warn!(%err, device = CONSOLE_DEVICE, "no VT monitor available, seat switching is disabled");
            None
        }
    };

    // Stale state from a previous, uncleanly stopped instance: cleaned at
    // startup rather than on every shutdown (spec §6 filesystem surface),
    // mirroring `delete_console_tags` — the inhibit directory's own
    // leftovers are cleaned by `InhibitManager::new` above.
    cleanup_console_tags(&PathBuf::from(RUNDIR).join("console"));

    let relsig = libc::SIGRTMIN();
    let acqsig = relsig + 1;
    let sigfd = match block_and_watch_signals(relsig, acqsig) {
        Ok(fd) => fd,
        Err(err) => {
            eprintln!("Could not set up signal handling: {err}");
            std::process::exit(1);
        }
    };

    let bus_source = Generic::new(bus.raw_fd(), Interest::READ, IoMode::Level);
    loop_handle
        .insert_source(bus_source, |_, _, daemon: &mut Daemon| {
            let bus = daemon.bus.clone();
            bus.dispatch(daemon);
            Ok(PostAction::Continue)
        })
        .expect("failed to register bus fd with the event loop");

    let sig_source = Generic::new(sigfd.as_raw_fd(), Interest::READ, IoMode::Level);
    loop_handle
        .insert_source(sig_source, move |_, _, daemon: &mut Daemon| {
            while let Some(signo) = read_one_signal(sigfd.as_raw_fd()) {
                handle_signal(daemon, signo, relsig, acqsig);
            }
            Ok(PostAction::Continue)
        })
        .expect("failed to register signalfd with the event loop");

    loop_handle
        .insert_source(Timer::from_duration(IDLE_POLL_INTERVAL), |_, _, daemon: &mut Daemon| {
            daemon.manager.poll_idle();
            let bus = daemon.bus.clone();
            bus.flush_events(daemon);
            TimeoutAction::ToDuration(IDLE_POLL_INTERVAL)
        })
        .expect("failed to arm idle poll timer");

    if cli.timed_exit {
        let signal = event_loop.get_signal();
        loop_handle
            .insert_source(Timer::from_duration(TIMED_EXIT_DELAY), move |_, _, _: &mut Daemon| {
                signal.stop();
                TimeoutAction::Drop
            })
            .expect("failed to arm timed-exit timer");
    }

    // `PidFile::create` matches `create_pid_file`'s unlink-then-O_EXCL
    // sequence; its `Drop` runs `delete_pid` on a clean exit the same way
    // `atexit(cleanup)` does. On an unhandled termination signal neither
    // this daemon nor the original runs cleanup — the stale pid file and
    // tag directories are swept up at the next clean startup instead.
    let _pidfile = PidFile::create(PathBuf::from(RUNDIR).join("ConsoleKit/pid"));

    let mut daemon = Daemon {
        manager,
        vt_monitor,
        bus,
        log_reload,
        debug_on: cli.debug,
    };

    info!("event loop starting");
    if let Err(err) = event_loop.run(None, &mut daemon, |_| {}) {
        warn!(%err, "event loop exited with an error");
    }
    info!("consoled shutting down");
}

fn setup_logging(debug: bool) -> LogReloadHandle {
    let initial = if debug { "debug" } else { "info" };
    let (filter, handle) = reload::Layer::new(EnvFilter::new(initial));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
    handle
}

/// `delete_console_tags`: sweeps leftover per-tty tag files from a previous
/// run. Nothing in this daemon writes new ones yet — spec §6 only commits
/// to the cleanup contract, not to a functional consumer of the tags.
fn cleanup_console_tags(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        debug!(dir = %dir.display(), "no console tag directory to clean up");
        return;
    };
    for entry in entries.flatten() {
        if std::fs::remove_file(entry.path()).is_err() {
            warn!(path = ?entry.path(), "couldn't delete stale console tag file");
        }
    }
}

/// Blocks `SIGUSR1` plus the two VT-handshake real-time signals in this
/// process's signal mask and returns a `signalfd` watching all three.
/// Termination signals (`SIGTERM`/`SIGQUIT`/`SIGINT`/`SIGHUP`) are left at
/// `SIG_DFL`, same as `setup_termination_signals`: this daemon doesn't try
/// to shut down gracefully on them, it just dies, and the next clean
/// startup sweeps up whatever state it left behind.
fn block_and_watch_signals(relsig: i32, acqsig: i32) -> io::Result<OwnedFd> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        libc::sigaddset(&mut set, relsig);
        libc::sigaddset(&mut set, acqsig);
        if libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = libc::signalfd(-1, &set, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

/// Reads one `signalfd_siginfo` off `fd`, if one is queued.
fn read_one_signal(fd: std::os::unix::io::RawFd) -> Option<i32> {
    let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
    let buf = unsafe { std::slice::from_raw_parts_mut(&mut info as *mut _ as *mut u8, std::mem::size_of::<libc::signalfd_siginfo>()) };
    match nix::unistd::read(fd, buf) {
        Ok(n) if n == buf.len() => Some(info.ssi_signo as i32),
        _ => None,
    }
}

fn handle_signal(daemon: &mut Daemon, signo: i32, relsig: i32, acqsig: i32) {
    if signo == libc::SIGUSR1 {
        daemon.toggle_debug_logging();
        return;
    }
    if signo == relsig {
        // Kernel asks the VT owner to release it (spec §4.2): pause the
        // owning session's devices, then ack the kernel's release request.
        if let Some(tty_fd) = daemon.manager.handle_vt_release_request() {
            let _ = sysdeps::vt::ack_reldisp(tty_fd, 1);
        }
        let bus = daemon.bus.clone();
        bus.flush_events(daemon);
        return;
    }
    if signo == acqsig {
        // Kernel granted the VT back; ack the acquisition. The actual
        // active-session promotion comes from the VT monitor's own poll,
        // not from this signal.
        if let Some(tty_fd) = daemon.manager.vt_handshake_tty() {
            let _ = sysdeps::vt::ack_reldisp(tty_fd, sysdeps::vt::VT_ACKACQ);
        }
    }
}
