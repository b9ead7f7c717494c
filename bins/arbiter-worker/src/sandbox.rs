// Process-level sandbox: spawn one untrusted command in its own session with
// rlimits, optional mount / network namespaces and uid drop, a wall-clock
// limit, a resident-memory watchdog and capped output capture.

use crate::languages::{CommandSpec, MemoryRlimit};
use anyhow::{Context, Result};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;
/// How long to wait for pipe readers once the process group is gone
const DRAIN_GRACE: Duration = Duration::from_secs(1);
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
const ROOT: &[u8] = b"/\0";
const SETGROUPS: &[u8] = b"/proc/self/setgroups\0";
const UID_MAP: &[u8] = b"/proc/self/uid_map\0";
const GID_MAP: &[u8] = b"/proc/self/gid_map\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLimits {
    /// Resident-memory ceiling for the whole session, in bytes
    pub memory_bytes: Option<u64>,
    /// Rlimit that also carries `memory_bytes`
    pub memory_rlimit: Option<MemoryRlimit>,
    pub cpu_seconds: u64,
    pub file_size_bytes: u64,
    pub max_processes: Option<u64>,
}

/// Everything applied between fork and exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSetup {
    pub limits: ChildLimits,
    pub isolate_network: bool,
    /// Mount namespace in which only the working directory stays writable
    pub isolate_filesystem: bool,
    /// uid / gid to switch to
    pub user: Option<(u32, u32)>,
}

pub struct Invocation<'a> {
    pub command: &'a CommandSpec,
    pub dir: &'a Path,
    pub base_env: &'a [(String, String)],
    pub stdin: Vec<u8>,
    pub wall_limit: Duration,
    pub output_limit: usize,
    pub setup: ChildSetup,
    /// Removed only once the leader is reaped, even if the run is cancelled
    pub scratch: Option<TempDir>,
}

#[derive(Debug)]
pub struct Finished {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub status: ExitStatus,
    /// The wall-clock limit expired and the group was killed by us
    pub timed_out: bool,
    /// The memory watchdog killed the group
    pub memory_killed: bool,
    /// Largest resident size observed, sampled or from rusage
    pub peak_memory_bytes: u64,
    /// User plus system time of the leader and the children it reaped
    pub cpu_time: Duration,
    pub duration: Duration,
    pub limits: ChildLimits,
}

impl Finished {
    pub fn signal(&self) -> Option<i32> {
        self.status.signal()
    }

    /// CPU time reached the RLIMIT_CPU soft limit.
    pub fn cpu_exhausted(&self) -> bool {
        self.cpu_time >= Duration::from_secs(self.limits.cpu_seconds)
    }

    /// Peak resident size reached the memory ceiling.
    pub fn over_memory(&self) -> bool {
        self.limits
            .memory_bytes
            .is_some_and(|limit| self.peak_memory_bytes >= limit)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> io::Result<()> {
    set_rlimit_pair(resource, value, value)
}

fn set_rlimit_pair(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn retry_eintr(mut call: impl FnMut() -> libc::c_int) -> io::Result<libc::c_int> {
    loop {
        let rc = call();
        if rc != -1 {
            return Ok(rc);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Writable mount points from a mountinfo table, each with the flags a
/// read-only bind remount has to keep (locked in a user namespace).
fn writable_mounts(mountinfo: &str) -> Vec<(Vec<u8>, libc::c_ulong)> {
    mountinfo
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(' ');
            let mount_point = fields.nth(4)?;
            let options = fields.next()?;
            let mut flags = 0;
            for option in options.split(',') {
                match option {
                    "ro" => return None,
                    "nosuid" => flags |= libc::MS_NOSUID,
                    "nodev" => flags |= libc::MS_NODEV,
                    "noexec" => flags |= libc::MS_NOEXEC,
                    _ => {}
                }
            }
            Some((unescape_mount_path(mount_point), flags))
        })
        .collect()
}

/// Undo the `\ooo` octal escapes mountinfo uses for spaces, tabs and newlines.
fn unescape_mount_path(raw: &str) -> Vec<u8> {
    let bytes = raw.as_bytes();
    let mut path = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'\\')
            .then(|| bytes.get(i + 1..i + 4))
            .flatten()
            .and_then(|digits| std::str::from_utf8(digits).ok())
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match escaped {
            Some(byte) => {
                path.push(byte);
                i += 4;
            }
            None => {
                path.push(bytes[i]);
                i += 1;
            }
        }
    }
    path
}

fn c_path(bytes: Vec<u8>) -> Result<CString> {
    CString::new(bytes).context("Path contains a NUL byte")
}

/// Mount changes made in the child so that only `work_dir` is writable.
/// Prepared in the parent; the child only issues syscalls.
struct MountPlan {
    work_dir: CString,
    read_only: Vec<(CString, libc::c_ulong)>,
}

impl MountPlan {
    fn for_dir(dir: &Path) -> Result<Self> {
        let mountinfo = fs::read_to_string("/proc/self/mountinfo").context("Failed to read the mount table")?;
        let read_only = writable_mounts(&mountinfo)
            .into_iter()
            .map(|(path, flags)| Ok((c_path(path)?, flags)))
            .collect::<Result<_>>()?;
        Ok(Self {
            work_dir: c_path(dir.as_os_str().as_bytes().to_vec())?,
            read_only,
        })
    }

    fn apply(&self) -> io::Result<()> {
        // Nothing below propagates back to the worker's namespace
        check(unsafe {
            libc::mount(
                ptr::null(),
                ROOT.as_ptr().cast(),
                ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                ptr::null(),
            )
        })?;

        let dir = self.work_dir.as_ptr();
        check(unsafe { libc::mount(dir, dir, ptr::null(), libc::MS_BIND, ptr::null()) })?;

        for (path, flags) in &self.read_only {
            let rc = unsafe {
                libc::mount(
                    ptr::null(),
                    path.as_ptr(),
                    ptr::null(),
                    libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | flags,
                    ptr::null(),
                )
            };
            if rc == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    // Shadowed or untraversable mount points are unreachable anyway
                    Some(libc::ENOENT) | Some(libc::EACCES) | Some(libc::EINVAL) => {}
                    _ => return Err(err),
                }
            }
        }

        // The inherited cwd is the directory underneath the bind mount
        check(unsafe { libc::chdir(dir) })
    }
}

/// Map the worker's own ids into a fresh user namespace.
struct IdentityMap {
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl IdentityMap {
    fn current() -> Self {
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        Self {
            uid_map: format!("{0} {0} 1\n", uid).into_bytes(),
            gid_map: format!("{0} {0} 1\n", gid).into_bytes(),
        }
    }

    fn apply(&self) -> io::Result<()> {
        write_proc_file(SETGROUPS, b"deny")?;
        write_proc_file(UID_MAP, &self.uid_map)?;
        write_proc_file(GID_MAP, &self.gid_map)
    }
}

fn write_proc_file(path: &[u8], contents: &[u8]) -> io::Result<()> {
    let fd = unsafe { libc::open(path.as_ptr().cast(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    let written = unsafe { libc::write(fd, contents.as_ptr().cast(), contents.len()) };
    let result = if written < 0 {
        Err(io::Error::last_os_error())
    } else if written as usize != contents.len() {
        Err(io::Error::from_raw_os_error(libc::EIO))
    } else {
        Ok(())
    };
    unsafe { libc::close(fd) };
    result
}

/// Everything the forked child needs, built before the fork.
struct ChildPlan {
    setup: ChildSetup,
    namespaces: libc::c_int,
    identity: Option<IdentityMap>,
    mounts: Option<MountPlan>,
}

impl ChildPlan {
    fn new(setup: ChildSetup, dir: &Path) -> Result<Self> {
        let mut namespaces = 0;
        if setup.isolate_network {
            namespaces |= libc::CLONE_NEWNET;
        }
        if setup.isolate_filesystem {
            namespaces |= libc::CLONE_NEWNS;
        }
        // Without root the other namespaces need a user namespace around them
        let identity = if namespaces != 0 && unsafe { libc::geteuid() } != 0 {
            namespaces |= libc::CLONE_NEWUSER;
            Some(IdentityMap::current())
        } else {
            None
        };
        let mounts = if setup.isolate_filesystem {
            Some(MountPlan::for_dir(dir)?)
        } else {
            None
        };
        Ok(Self {
            setup,
            namespaces,
            identity,
            mounts,
        })
    }
}

/// Runs in the forked child before exec. Only async-signal-safe calls.
///
/// Order: new session, rlimits, namespaces (user namespace first when not
/// root), write confinement, then the credential drop.
fn apply_child_setup(plan: &ChildPlan) -> io::Result<()> {
    check(unsafe { libc::setsid() })?;

    let limits = &plan.setup.limits;
    if let (Some(kind), Some(bytes)) = (limits.memory_rlimit, limits.memory_bytes) {
        let resource = match kind {
            MemoryRlimit::AddressSpace => libc::RLIMIT_AS,
            MemoryRlimit::Data => libc::RLIMIT_DATA,
        };
        set_rlimit(resource, bytes)?;
    }
    // SIGXCPU at the soft limit, SIGKILL a second later
    set_rlimit_pair(libc::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds + 1)?;
    set_rlimit(libc::RLIMIT_FSIZE, limits.file_size_bytes)?;
    set_rlimit(libc::RLIMIT_CORE, 0)?;
    if let Some(max) = limits.max_processes {
        set_rlimit(libc::RLIMIT_NPROC, max)?;
    }

    if plan.namespaces != 0 {
        check(unsafe { libc::unshare(plan.namespaces) })?;
    }
    if let Some(identity) = &plan.identity {
        identity.apply()?;
    }
    if let Some(mounts) = &plan.mounts {
        mounts.apply()?;
    }

    if let Some((uid, gid)) = plan.setup.user {
        check(unsafe { libc::setgroups(0, ptr::null()) })?;
        check(unsafe { libc::setgid(gid) })?;
        check(unsafe { libc::setuid(uid) })?;
    }
    Ok(())
}

#[derive(Default)]
struct GroupState {
    reaped: bool,
    memory_killed: bool,
}

/// A sandboxed session leader and its process group.
///
/// The group may only be signalled while the leader is unreaped: until then
/// its pid, and with it the group id, cannot be handed to another process.
struct ProcessGroup {
    pid: u32,
    state: Mutex<GroupState>,
    peak_resident: AtomicU64,
}

impl ProcessGroup {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            state: Mutex::new(GroupState::default()),
            peak_resident: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_kill(&self, over_memory: bool) -> bool {
        let mut state = self.state();
        if state.reaped {
            return false;
        }
        state.memory_killed |= over_memory;
        unsafe {
            libc::killpg(self.pid as libc::pid_t, libc::SIGKILL);
        }
        true
    }

    /// SIGKILL the group unless the leader is already reaped.
    fn kill(&self) -> bool {
        self.signal_kill(false)
    }

    fn kill_over_memory(&self) -> bool {
        self.signal_kill(true)
    }

    fn is_reaped(&self) -> bool {
        self.state().reaped
    }

    fn memory_killed(&self) -> bool {
        self.state().memory_killed
    }

    /// Block until the leader exits, kill whatever is left of its group while
    /// the leader is still a zombie, then reap it.
    fn wait(&self) -> io::Result<(ExitStatus, libc::rusage)> {
        let pid = self.pid as libc::pid_t;
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        retry_eintr(|| unsafe { libc::waitid(libc::P_PID, self.pid as libc::id_t, &mut info, libc::WEXITED | libc::WNOWAIT) })?;

        let mut state = self.state();
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
        let mut status: libc::c_int = 0;
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        retry_eintr(|| unsafe { libc::wait4(pid, &mut status, 0, &mut usage) })?;
        state.reaped = true;
        Ok((ExitStatus::from_raw(status), usage))
    }
}

/// Kills the group if the run future is dropped before the leader is reaped
struct GroupGuard(Arc<ProcessGroup>);

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.0.kill();
    }
}

fn page_size() -> u64 {
    u64::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap_or(4096)
}

/// Session id and resident pages from a `/proc/<pid>/stat` line.
fn parse_stat(stat: &str) -> Option<(u32, u64)> {
    // comm may itself contain spaces and parentheses
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some((fields.get(3)?.parse().ok()?, fields.get(21)?.parse().ok()?))
}

/// Resident pages of every process in session `sid`.
fn session_resident_pages(sid: u32) -> u64 {
    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().as_bytes().iter().all(u8::is_ascii_digit))
        .filter_map(|entry| fs::read_to_string(entry.path().join("stat")).ok())
        .filter_map(|stat| parse_stat(&stat))
        .filter(|(session, _)| *session == sid)
        .map(|(_, pages)| pages)
        .sum()
}

/// Sample the session's resident size until the leader is reaped; kill the
/// group the first time it goes over `limit`.
fn watch_memory(group: &ProcessGroup, limit: u64) {
    let page = page_size();
    while !group.is_reaped() {
        let resident = session_resident_pages(group.pid) * page;
        group.peak_resident.fetch_max(resident, Ordering::Relaxed);
        if resident > limit {
            if group.kill_over_memory() {
                debug!(pid = group.pid, resident, limit, "Memory limit exceeded");
            }
            return;
        }
        std::thread::sleep(MEMORY_SAMPLE_INTERVAL);
    }
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Read a stream to the end, keeping at most `limit` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(buffer.len());
        if n > room {
            buffer.extend_from_slice(&chunk[..room]);
            truncated = true;
        } else {
            buffer.extend_from_slice(&chunk[..n]);
        }
    }
    Ok((buffer, truncated))
}

async fn join_reader(handle: tokio::task::JoinHandle<io::Result<(Vec<u8>, bool)>>) -> (Vec<u8>, bool) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Failed to read sandbox output");
            (Vec::new(), false)
        }
        Ok(Err(_)) => (Vec::new(), false),
        Err(_) => {
            // An escaped descendant still holds the pipe open
            abort.abort();
            (Vec::new(), false)
        }
    }
}

/// Spawn, feed, wait and collect.
///
/// Errors are infrastructure faults (spawn failure, isolation that could not
/// be set up, broken pipes to our own child); anything the program itself
/// does is reported through `Finished`.
pub async fn run(invocation: Invocation<'_>) -> Result<Finished> {
    let spec = invocation.command;
    let setup = invocation.setup;
    // The child resolves paths after its chdir
    let dir = fs::canonicalize(invocation.dir)
        .with_context(|| format!("Failed to resolve sandbox directory {}", invocation.dir.display()))?;
    let program = match spec.program.strip_prefix("./") {
        Some(local) => dir.join(local).into_os_string(),
        None => spec.program.clone().into(),
    };
    let plan = ChildPlan::new(setup, &dir)?;

    let mut command = Command::new(&program);
    command
        .args(&spec.args)
        .current_dir(&dir)
        .env_clear()
        .envs(invocation.base_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    unsafe {
        command.pre_exec(move || apply_child_setup(&plan));
    }

    let started = Instant::now();
    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn sandboxed process '{}'", spec.program))?;
    let group = Arc::new(ProcessGroup::new(child.id()));
    let _guard = GroupGuard(group.clone());
    debug!(pid = group.pid, program = %spec.program, "Spawned sandboxed process");

    // Reaping belongs to the group from here on, never to `child`
    let mut reaper = {
        let group = group.clone();
        let scratch = invocation.scratch;
        tokio::task::spawn_blocking(move || {
            let waited = group.wait();
            drop(scratch);
            waited
        })
    };
    if let Some(limit) = setup.limits.memory_bytes {
        let group = group.clone();
        tokio::task::spawn_blocking(move || watch_memory(&group, limit));
    }

    let stdin = ChildStdin::from_std(child.stdin.take().context("Sandbox stdin not captured")?)
        .context("Failed to register sandbox stdin")?;
    let stdout = ChildStdout::from_std(child.stdout.take().context("Sandbox stdout not captured")?)
        .context("Failed to register sandbox stdout")?;
    let stderr = ChildStderr::from_std(child.stderr.take().context("Sandbox stderr not captured")?)
        .context("Failed to register sandbox stderr")?;
    drop(child);

    let input = invocation.stdin;
    let writer = tokio::spawn(async move {
        let mut stdin = stdin;
        // The program may exit without reading its input
        let _ = stdin.write_all(&input).await;
        let _ = stdin.shutdown().await;
    });
    let limit = invocation.output_limit;
    let stdout_reader = tokio::spawn(read_capped(stdout, limit));
    let stderr_reader = tokio::spawn(read_capped(stderr, limit));

    let (waited, timed_out) = match tokio::time::timeout(invocation.wall_limit, &mut reaper).await {
        Ok(waited) => (waited, false),
        Err(_) => {
            let killed = group.kill();
            (reaper.await, killed)
        }
    };
    let (status, usage) = waited
        .context("Sandbox reaper task failed")?
        .context("Failed to wait for sandboxed process")?;
    let duration = started.elapsed();
    writer.abort();

    let (stdout, stdout_truncated) = join_reader(stdout_reader).await;
    let (stderr, _) = join_reader(stderr_reader).await;

    let max_rss = u64::try_from(usage.ru_maxrss).unwrap_or(0) * 1024;
    Ok(Finished {
        stdout,
        stderr,
        stdout_truncated,
        status,
        timed_out,
        memory_killed: group.memory_killed(),
        peak_memory_bytes: group.peak_resident.load(Ordering::Relaxed).max(max_rss),
        cpu_time: timeval(usage.ru_utime) + timeval(usage.ru_stime),
        duration,
        limits: setup.limits,
    })
}

pub fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGBUS => "SIGBUS",
        libc::SIGKILL => "SIGKILL",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGSYS => "SIGSYS",
        other => return format!("signal {}", other),
    };
    name.to_string()
}
