//! The driver (spec.md §10): a thin binary that checks prerequisites,
//! parses the record/replay mode and its flags, and dispatches into the
//! recorder or replayer engine. Grounded on `original_source/src/main.c`'s
//! `main`/`start`/`check_prerequisites` shape, expressed with `structopt`
//! the way the teacher's own CLI surface is built, instead of the
//! original's hand-rolled `strncmp` argument scanning.

use revtrace::error::{RdError, RdResult};
use revtrace::flags::Flags;
use revtrace::log;
use revtrace::log::LogLevel::{LogInfo, LogWarn};
use revtrace::trace::TraceDir;
use revtrace::{commands, session};
use std::path::PathBuf;
use structopt::StructOpt;

/// The binary accepts exactly one mode flag, `--record` or `--replay`,
/// followed by optional flags and then either the executable and its
/// arguments (record) or the trace directory (replay) — spec.md §6's
/// external interface, verbatim.
#[derive(StructOpt)]
#[structopt(
    name = "rd",
    about = "Deterministic record-and-replay debugger for native Linux user-space programs."
)]
struct Cli {
    #[structopt(long)]
    record: bool,
    #[structopt(long)]
    replay: bool,
    #[structopt(long)]
    redirect_output: bool,
    #[structopt(long)]
    dump_memory: Option<u64>,
    #[structopt(subcommand)]
    command: Option<Command>,
    /// The executable and its arguments (`--record`) or the trace
    /// directory (`--replay`).
    target: Vec<String>,
}

#[derive(StructOpt)]
enum Command {
    /// Print a trace's header and per-tid event counts without replaying.
    TraceInfo {
        #[structopt(parse(from_os_str))]
        trace_dir: PathBuf,
    },
}

/// Reads a well-known kernel tunable and parses it as an integer,
/// treating a missing file as a prerequisite failure rather than a silent
/// pass (spec.md §6: "probed by reading two well-known kernel tunables").
fn read_kernel_tunable(path: &str) -> RdResult<i64> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| RdError::Prerequisite(format!("cannot read {}: {}", path, e)))?;
    contents
        .trim()
        .parse::<i64>()
        .map_err(|e| RdError::Prerequisite(format!("cannot parse {}: {}", path, e)))
}

fn check_prerequisites() -> RdResult<()> {
    let aslr = read_kernel_tunable("/proc/sys/kernel/randomize_va_space")?;
    if aslr != 0 {
        return Err(RdError::Prerequisite(
            "ASLR is not disabled (randomize_va_space != 0)".into(),
        ));
    }
    // A missing yama file means ptrace_scope restrictions don't apply on
    // this kernel at all, which is permissive enough to proceed.
    if let Ok(scope) = read_kernel_tunable("/proc/sys/kernel/yama/ptrace_scope") {
        if scope != 0 {
            return Err(RdError::Prerequisite(format!(
                "ptrace_scope is {} (must be 0 to attach to descendants)",
                scope
            )));
        }
    }
    Ok(())
}

/// Installs a handler that forwards `SIGINT` to the primary tracee as
/// `SIGQUIT`, then re-raises it against the supervisor itself, so the
/// tracee never outlives the supervisor (spec.md §6).
fn install_interrupt_forwarder(primary_tracee: libc::pid_t) {
    use std::sync::atomic::{AtomicI32, Ordering};
    static PRIMARY_TRACEE: AtomicI32 = AtomicI32::new(0);
    PRIMARY_TRACEE.store(primary_tracee, Ordering::SeqCst);

    extern "C" fn handler(_sig: libc::c_int) {
        let tracee = PRIMARY_TRACEE.load(std::sync::atomic::Ordering::SeqCst);
        unsafe {
            if tracee != 0 {
                libc::kill(tracee, libc::SIGQUIT);
            }
            libc::raise(libc::SIGQUIT);
        }
    }
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

fn next_trace_dir() -> PathBuf {
    let base = PathBuf::from(".rd-trace");
    for n in 0.. {
        let candidate = base.join(n.to_string());
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

fn run() -> RdResult<i32> {
    let cli = Cli::from_args();

    if let Some(Command::TraceInfo { trace_dir }) = cli.command {
        commands::trace_info::run(&trace_dir)?;
        return Ok(0);
    }

    check_prerequisites()?;

    if cli.record == cli.replay {
        return Err(RdError::Prerequisite(
            "exactly one of --record or --replay must be given".into(),
        ));
    }

    let flags = Flags {
        redirect_output: cli.redirect_output,
        dump_memory_at_event: cli.dump_memory,
        ..Flags::default()
    };

    if cli.record {
        let exe_str = cli
            .target
            .get(0)
            .cloned()
            .ok_or_else(|| RdError::Prerequisite("--record requires an executable".into()))?;
        if !is_executable(&exe_str) {
            return Err(RdError::Prerequisite(format!(
                "'{}' does not exist or is not executable",
                exe_str
            )));
        }
        let argv = cli.target.clone();
        let envp: Vec<String> = std::env::vars().map(|(k, v)| format!("{}={}", k, v)).collect();
        let dir = TraceDir::new(next_trace_dir());
        log!(LogInfo, "recording '{}' into {:?}", exe_str, dir.root());
        session::record_session::record(dir, &exe_str, &argv, &envp, flags)
    } else {
        let trace_dir = cli
            .target
            .get(0)
            .cloned()
            .ok_or_else(|| RdError::Prerequisite("--replay requires a trace directory".into()))?;
        log!(LogInfo, "replaying {}", trace_dir);
        session::replay_session::replay(TraceDir::new(PathBuf::from(trace_dir)))
    }
}

fn is_executable(path: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn main() {
    install_interrupt_forwarder(0);
    match run() {
        Ok(0) => std::process::exit(0),
        Ok(status) => std::process::exit(status),
        Err(e) => {
            log!(LogWarn, "{}", e);
            std::process::exit(e.exit_code());
        }
    }
}
