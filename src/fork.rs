//! Structured fork: a `fork()` wrapper that replaces ad hoc fd juggling
//! around the syscall with an explicit pre-fork/post-fork protocol.
//!
//! [`fork_process_child`] is the single primitive: it runs a pre-fork
//! hook that gets to adjust which fds the child keeps (whitelist) and
//! which the parent drops (blacklist) once the child is confirmed
//! running, forks, and synchronizes the two sides over a
//! [`ForkChannel`] (a [`BellPair`] ready-signal plus a [`Pipe`] carrying
//! a structured `{return_code, errno}` result) so the child has
//! finished its own fd cleanup and post-fork hook, and the parent knows
//! whether that succeeded, before the parent acts on its blacklist.
//! [`fork_process_daemon`] builds a detached daemon out of two of these:
//! an intermediate "guardian" that stops the real daemon with `SIGSTOP`
//! until it has been reparented (so it is guaranteed to receive
//! `SIGHUP` then `SIGCONT` per POSIX orphaned-process-group rules), then
//! exits so the daemon is adopted by the nearest subreaper.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::time::Duration as StdDuration;

use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult};

use crate::bell::BellPair;
use crate::clock::{monotonic_sleep, Duration};
use crate::error::RuntimeError;
use crate::fdset::{FdRange, FdRangeSet};
use crate::pid::{Pgid, Pid};
use crate::pipe::Pipe;
use crate::socket::SocketPair;

pub enum ForkGroup {
    /// The child stays in the caller's process group.
    Inherit,
    /// The child (and the parent, forcibly, to avoid a race against the
    /// child setting its own) is placed into `Pgid`, or into a fresh
    /// group named after the child's own pid if `Pgid` is zero.
    SetProcessGroup(Pgid),
}

pub enum ChildFdPolicy {
    /// Close every fd not in the whitelist once the child has run its
    /// post-fork hook.
    CloseUnlisted,
    /// Leave every fd as inherited from the parent. Used for the inner
    /// fork in [`fork_process_daemon`], which exists purely to manage
    /// process groups and signals and must not disturb fds the eventual
    /// daemon body still needs.
    KeepAll,
}

/// The fork channel: a [`BellPair`] ready-signal plus a [`Pipe`] the
/// child uses to ship a structured `{return_code, errno}` result back
/// to the parent, so a setup failure on the child side surfaces as
/// [`RuntimeError::ChildFailed`] instead of silently degrading to a
/// parent-side timeout.
struct ForkChannel {
    bell: BellPair,
    result: Pipe,
}

impl ForkChannel {
    fn new() -> Result<Self, RuntimeError> {
        Ok(Self {
            bell: BellPair::new()?,
            result: Pipe::new()?,
        })
    }

    /// Every fd this channel owns, whitelisted before `fork()` so the
    /// child's own `close_unlisted_fds` pass (and the parent's
    /// blacklist pass) never tear it down mid-handshake. All four fds
    /// are `O_CLOEXEC`/`SOCK_CLOEXEC`, so nothing leaks past the
    /// eventual `exec`.
    fn raw_fds(&self) -> [i32; 4] {
        [
            self.bell.parent_fd(),
            self.bell.child_fd(),
            self.result.read.as_raw_fd(),
            self.result.write.as_raw_fd(),
        ]
    }

    fn send_result(&mut self, return_code: i32, errno: i32) -> Result<(), RuntimeError> {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&return_code.to_ne_bytes());
        buf[4..8].copy_from_slice(&errno.to_ne_bytes());
        self.result.write.write_all(&buf)?;
        Ok(())
    }

    fn recv_result(&mut self) -> Result<(i32, i32), RuntimeError> {
        let mut buf = [0u8; 8];
        self.result.read.read_exact(&mut buf)?;
        let return_code = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let errno = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
        Ok((return_code, errno))
    }
}

/// Closes every open fd not covered by `whitelist`. The candidate fds
/// are snapshotted into a `Vec` before any `close` call: closing fds
/// while `/proc/self/fd`'s own `ReadDir` is still open would risk
/// closing that directory fd mid-iteration (it isn't whitelisted),
/// truncating the scan and leaving later fds open.
fn close_unlisted_fds(whitelist: &FdRangeSet) -> Result<(), RuntimeError> {
    let fds: Vec<i32> = std::fs::read_dir("/proc/self/fd")?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
        .collect();

    for fd in fds {
        if !whitelist.contains(fd) {
            unsafe {
                libc::close(fd);
            }
        }
    }
    Ok(())
}

/// Adds `fd` to `whitelist` unless it is already covered. A bare
/// `insert` rejects an already-present range, but the pre-fork hook
/// only ever wants "make sure this fd survives", not a strict
/// first-insertion.
fn ensure_whitelisted(whitelist: &mut FdRangeSet, fd: i32) {
    if !whitelist.contains(fd) {
        whitelist
            .insert(FdRange::single(fd))
            .expect("fd just checked absent cannot already overlap");
    }
}

fn close_listed_fds(blacklist: &FdRangeSet) {
    blacklist.visit(|range| {
        for fd in range.lo..=range.hi {
            unsafe {
                libc::close(fd);
            }
        }
        0
    });
}

/// Sleeps long enough that two forks in quick succession cannot produce
/// pids whose `/proc/<pid>/stat` start-time field — measured in
/// `_SC_CLK_TCK` ticks — would alias (see [`crate::pid::PidSignature`]).
fn rate_limit_for_pid_reuse() {
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as u64;
    monotonic_sleep(Duration(Duration::from_secs(1).as_nanos() / ticks_per_sec * 5 / 4));
}

const FORK_CHANNEL_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// Forks a child process with explicit control over which fds it keeps
/// open, synchronized against the parent's own post-fork bookkeeping.
/// `body` never returns: it either `exec`s or calls
/// `std::process::exit`.
pub fn fork_process_child(
    group: ForkGroup,
    fd_policy: ChildFdPolicy,
    pre_fork: impl FnOnce(&mut FdRangeSet, &mut FdRangeSet) -> Result<(), RuntimeError>,
    post_fork_child: impl FnOnce() -> Result<(), RuntimeError>,
    post_fork_parent: impl FnOnce(Pid) -> Result<(), RuntimeError>,
    body: impl FnOnce() -> !,
) -> Result<Pid, RuntimeError> {
    let mut whitelist = FdRangeSet::new();
    let mut blacklist = FdRangeSet::new();

    for fd in [0, 1, 2] {
        ensure_whitelisted(&mut whitelist, fd);
        let _ = blacklist.remove(FdRange::single(fd));
    }

    pre_fork(&mut whitelist, &mut blacklist)?;

    let mut channel = ForkChannel::new()?;
    for fd in channel.raw_fds() {
        ensure_whitelisted(&mut whitelist, fd);
        let _ = blacklist.remove(FdRange::single(fd));
    }

    rate_limit_for_pid_reuse();

    match unsafe { unistd::fork() }? {
        ForkResult::Parent { child } => {
            let child_pid = Pid(child.as_raw());

            if let ForkGroup::SetProcessGroup(pgid) = group {
                let target = if pgid.as_raw() != 0 { pgid } else { child_pid };
                if unistd::setpgid(child, target.to_nix_pid()).is_err() {
                    let _ = waitpid(child, None);
                    return Err(RuntimeError::Other("failed to set child process group".into()));
                }
            }

            match run_parent_side(&mut channel, child_pid, post_fork_parent, &blacklist) {
                Ok(()) => Ok(child_pid),
                Err(e) => {
                    let _ = waitpid(child, None);
                    Err(e)
                }
            }
        }

        ForkResult::Child => {
            run_child_side(&mut channel, &fd_policy, &whitelist, post_fork_child);
            body()
        }
    }
}

fn run_parent_side(
    channel: &mut ForkChannel,
    child_pid: Pid,
    post_fork_parent: impl FnOnce(Pid) -> Result<(), RuntimeError>,
    blacklist: &FdRangeSet,
) -> Result<(), RuntimeError> {
    channel.bell.wait_parent(Some(FORK_CHANNEL_TIMEOUT))?;

    let (return_code, child_errno) = channel.recv_result()?;
    if return_code != 0 {
        return Err(RuntimeError::ChildFailed(child_errno));
    }

    post_fork_parent(child_pid)?;
    close_listed_fds(blacklist);
    channel.bell.ring_parent()?;
    Ok(())
}

fn run_child_side(
    channel: &mut ForkChannel,
    fd_policy: &ChildFdPolicy,
    whitelist: &FdRangeSet,
    post_fork_child: impl FnOnce() -> Result<(), RuntimeError>,
) {
    if matches!(fd_policy, ChildFdPolicy::CloseUnlisted) {
        if let Err(e) = close_unlisted_fds(whitelist) {
            terminate_child_with_result(channel, e.errno(), &format!("failed to close non-whitelisted fds: {e}"));
        }
    }

    if let Err(e) = post_fork_child() {
        terminate_child_with_result(channel, e.errno(), &format!("post-fork child hook failed: {e}"));
    }

    if let Err(e) = channel.send_result(0, 0) {
        terminate_child(&format!("failed to report fork channel result: {e}"));
    }

    if let Err(e) = channel.bell.ring_child() {
        terminate_child(&format!("failed to signal fork channel: {e}"));
    }

    if let Err(e) = channel.bell.wait_child(Some(FORK_CHANNEL_TIMEOUT)) {
        terminate_child(&format!("fork channel handshake failed: {e}"));
    }
}

/// Ships `{return_code=-1, errno}` to the parent before exiting, so a
/// setup failure on the child side surfaces to the parent as
/// [`RuntimeError::ChildFailed`] instead of a 5-second timeout. Best
/// effort: if the channel itself is what's broken, the write is simply
/// dropped and the parent falls back to timing out.
fn terminate_child_with_result(channel: &mut ForkChannel, errno: i32, message: &str) -> ! {
    let _ = channel.send_result(-1, errno);
    let _ = channel.bell.ring_child();
    terminate_child(message);
}

fn terminate_child(message: &str) -> ! {
    eprintln!("fork child aborting: {message}");
    std::process::exit(127);
}

/// Forks a fully detached daemon process: an intermediate guardian
/// forks the real daemon,
/// holds it stopped with `SIGSTOP` until `waitpid` confirms the stop,
/// then exits — orphaning the daemon, which POSIX guarantees delivers
/// `SIGHUP` then `SIGCONT` to it. The daemon waits for that `SIGHUP`
/// before running `body`, so `body` never executes before the process
/// has actually been reparented away from the caller.
pub fn fork_process_daemon(
    pre_fork: impl FnOnce(&mut FdRangeSet, &mut FdRangeSet) -> Result<(), RuntimeError>,
    post_fork_child: impl FnOnce() -> Result<(), RuntimeError> + 'static,
    post_fork_parent: impl FnOnce(Pid) -> Result<(), RuntimeError>,
    body: impl FnOnce() -> ! + 'static,
) -> Result<Pid, RuntimeError> {
    // SIGHUP is blocked here, before the fork, so the mask carries
    // across both forks below and the eventual daemon can never miss
    // the orphaning SIGHUP by losing a race against its own `sigwait`
    // setup. The launcher's own mask is restored right after forking —
    // the block has already been inherited by then, and the launcher
    // itself has no reason to keep ignoring SIGHUP.
    let mut sighup_mask = nix::sys::signal::SigSet::empty();
    sighup_mask.add(Signal::SIGHUP);
    let mut old_mask = nix::sys::signal::SigSet::empty();
    nix::sys::signal::pthread_sigmask(nix::sys::signal::SigmaskHow::SIG_BLOCK, Some(&sighup_mask), Some(&mut old_mask))?;

    let handoff = SocketPair::new()?;

    // The guardian only needs its own end of the handoff socket to hand
    // the daemon's pid back; it never touches the parent end. A clone
    // is taken (rather than reusing `handoff.child` directly) purely so
    // its fd number is known for the whitelist below — the original
    // `handoff.parent`/`handoff.child` survive the fork too (every open
    // fd does), but are never referenced by a live value in the
    // guardian process, so `close_unlisted_fds` reclaiming them carries
    // no double-close risk.
    let handoff_child_clone = handoff.child.try_clone()?;
    let handoff_child_clone_fd = handoff_child_clone.as_raw_fd();

    let guardian_pre_fork = move |whitelist: &mut FdRangeSet, blacklist: &mut FdRangeSet| -> Result<(), RuntimeError> {
        pre_fork(whitelist, blacklist)?;
        ensure_whitelisted(whitelist, handoff_child_clone_fd);
        let _ = blacklist.remove(FdRange::single(handoff_child_clone_fd));
        Ok(())
    };

    let guardian_child_hook =
        move || -> Result<(), RuntimeError> { run_guardian(handoff_child_clone, post_fork_child, body) };

    // The daemon only writes its pid to the handoff socket once it
    // observes the SIGHUP that orphaning delivers, and the guardian
    // only exits (which is what triggers that orphaning) once this
    // fork's own bell handshake — `channel.ring_parent()` inside
    // `run_parent_side` — has completed. Reading the handoff from
    // inside this fork's `post_fork_parent` hook would therefore
    // deadlock: that hook runs *before* `ring_parent`, so the guardian
    // could never exit to produce the SIGHUP the read is waiting for.
    // This fork's own parent hook is a no-op instead, and the handoff
    // read happens only after `fork_process_child` has returned, by
    // which point the guardian has already rung in and is exiting.
    fork_process_child(
        ForkGroup::Inherit,
        ChildFdPolicy::CloseUnlisted,
        guardian_pre_fork,
        guardian_child_hook,
        |_guardian_pid| Ok(()),
        || std::process::exit(0),
    )?;

    nix::sys::signal::pthread_sigmask(nix::sys::signal::SigmaskHow::SIG_SETMASK, Some(&old_mask), None)?;

    let mut handoff_parent = handoff.parent;
    let mut pid_bytes = [0u8; 4];
    handoff_parent.read_exact(&mut pid_bytes)?;
    let daemon_pid = Pid(i32::from_ne_bytes(pid_bytes));
    handoff_parent.write_all(&[0u8])?;

    post_fork_parent(daemon_pid)?;

    Ok(daemon_pid)
}

fn run_guardian(
    handoff_child: std::os::unix::net::UnixStream,
    daemon_post_fork_child: impl FnOnce() -> Result<(), RuntimeError> + 'static,
    body: impl FnOnce() -> ! + 'static,
) -> Result<(), RuntimeError> {
    let daemon_pid = fork_process_child(
        ForkGroup::SetProcessGroup(Pgid(0)),
        ChildFdPolicy::KeepAll,
        |_whitelist, _blacklist| Ok(()),
        daemon_post_fork_child,
        |_daemon_pid| Ok(()),
        move || run_daemon(handoff_child, body),
    )?;

    nix::sys::signal::kill(daemon_pid.to_nix_pid(), Signal::SIGSTOP)
        .map_err(|_| RuntimeError::Other("failed to stop daemon for orphaning".into()))?;

    // Blocks until the stop is confirmed, so the guardian never exits
    // (and thus never orphans the daemon) before the daemon is actually
    // stopped and ready to receive the SIGHUP/SIGCONT pair that
    // reparenting delivers.
    loop {
        match waitpid(daemon_pid.to_nix_pid(), Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Stopped(_, _)) => break,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

fn run_daemon(
    mut handoff_child: std::os::unix::net::UnixStream,
    body: impl FnOnce() -> !,
) -> ! {
    let mut wait_set = nix::sys::signal::SigSet::empty();
    wait_set.add(Signal::SIGHUP);

    // Blocks until the guardian's exit orphans this process and POSIX
    // delivers the promised SIGHUP.
    let _ = wait_set.wait();

    let own_pid = unistd::getpid().as_raw();
    if handoff_child.write_all(&own_pid.to_ne_bytes()).is_err() {
        terminate_child("failed to hand off daemon pid to launcher");
    }

    let mut ack = [0u8; 1];
    let _ = handoff_child.read_exact(&mut ack);
    drop(handoff_child);

    body()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::FromRawFd;

    fn fd_is_open(fd: i32) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1
    }

    #[test]
    fn body_return_code_becomes_exit_status() {
        let child = fork_process_child(
            ForkGroup::Inherit,
            ChildFdPolicy::CloseUnlisted,
            |_whitelist, _blacklist| Ok(()),
            || Ok(()),
            |_pid| Ok(()),
            || std::process::exit(42),
        )
        .unwrap();

        let status = waitpid(child.to_nix_pid(), None).unwrap();
        assert_eq!(status, WaitStatus::Exited(child.to_nix_pid(), 42));
    }

    /// A child whose post-fork hook fails ships its errno back over the
    /// fork channel's result pipe instead of leaving the parent to
    /// time out.
    #[test]
    fn child_hook_failure_surfaces_as_child_failed() {
        let result = fork_process_child(
            ForkGroup::Inherit,
            ChildFdPolicy::CloseUnlisted,
            |_whitelist, _blacklist| Ok(()),
            || Err(RuntimeError::Failed { errno: libc::EPERM }),
            |_pid| Ok(()),
            || std::process::exit(1),
        );

        match result {
            Err(RuntimeError::ChildFailed(errno)) => assert_eq!(errno, libc::EPERM),
            other => panic!("expected ChildFailed(EPERM), got {other:?}"),
        }
    }

    /// The parent opens four extra fds, whitelists stderr plus two of
    /// them, forks, and the child closes everything not whitelisted.
    #[test]
    fn close_except_whitelist_scenario() {
        let extra: Vec<File> = (0..4).map(|_| File::open("/dev/null").unwrap()).collect();
        let extra_fds: Vec<i32> = extra.iter().map(File::as_raw_fd).collect();
        let (p0, p1, p2, p3) = (extra_fds[0], extra_fds[1], extra_fds[2], extra_fds[3]);

        let mut report_pipe = crate::pipe::Pipe::new().unwrap();
        let write_fd = report_pipe.write.as_raw_fd();

        let child = fork_process_child(
            ForkGroup::Inherit,
            ChildFdPolicy::CloseUnlisted,
            move |whitelist, _blacklist| {
                whitelist.insert(FdRange::single(p1))?;
                whitelist.insert(FdRange::single(p2))?;
                whitelist.insert(FdRange::single(write_fd))?;
                Ok(())
            },
            || Ok(()),
            |_pid| Ok(()),
            move || {
                let report = [
                    fd_is_open(p0) as u8,
                    fd_is_open(p1) as u8,
                    fd_is_open(p2) as u8,
                    fd_is_open(p3) as u8,
                    fd_is_open(2) as u8,
                ];
                let mut out = unsafe { File::from_raw_fd(write_fd) };
                let _ = out.write_all(&report);
                std::process::exit(0);
            },
        )
        .unwrap();

        drop(extra);

        let mut reported = [0u8; 5];
        report_pipe.read.read_exact(&mut reported).unwrap();

        waitpid(child.to_nix_pid(), None).unwrap();

        assert_eq!(reported[0], 0, "p0 should have been closed in the child");
        assert_eq!(reported[1], 1, "p1 was whitelisted");
        assert_eq!(reported[2], 1, "p2 was whitelisted");
        assert_eq!(reported[3], 0, "p3 should have been closed in the child");
        assert_eq!(reported[4], 1, "stderr is always kept");
    }

    /// End-to-end exercise of the double-fork daemon dance: the daemon
    /// body runs (proving the guardian/orphaning handshake completed)
    /// and the pid handed back to the caller is the one the body itself
    /// observes, proving the handoff isn't read before the guardian has
    /// actually exited.
    #[test]
    fn fork_process_daemon_hands_off_the_real_daemon_pid() {
        let mut report_pipe = crate::pipe::Pipe::new().unwrap();
        let write_fd = report_pipe.write.as_raw_fd();

        let daemon_pid = fork_process_daemon(
            move |whitelist, _blacklist| {
                whitelist.insert(FdRange::single(write_fd))?;
                Ok(())
            },
            || Ok(()),
            |_pid| Ok(()),
            move || {
                let own_pid = unistd::getpid().as_raw();
                let mut out = unsafe { File::from_raw_fd(write_fd) };
                let _ = out.write_all(&own_pid.to_ne_bytes());
                std::process::exit(0);
            },
        )
        .unwrap();

        let mut reported_pid_bytes = [0u8; 4];
        report_pipe.read.read_exact(&mut reported_pid_bytes).unwrap();
        let reported_pid = i32::from_ne_bytes(reported_pid_bytes);

        assert_eq!(reported_pid, daemon_pid.as_raw());

        let _ = nix::sys::signal::kill(daemon_pid.to_nix_pid(), Signal::SIGKILL);
    }
}
