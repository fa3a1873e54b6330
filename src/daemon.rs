//! Detach from the controlling terminal.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;

/// Double-fork into a session-less background process.
///
/// Parents exit with success. The surviving grandchild runs from `/` with
/// stdin, stdout and stderr pointed at `/dev/null`. Must be called before any
/// thread (including the tokio runtime) is started.
pub fn daemonize() -> io::Result<()> {
    fork_and_exit_parent()?;

    // SAFETY: plain syscall, no memory is shared with the caller.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    fork_and_exit_parent()?;

    std::env::set_current_dir("/")?;
    redirect_stdio()
}

fn fork_and_exit_parent() -> io::Result<()> {
    // SAFETY: the process is still single-threaded here.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}

fn redirect_stdio() -> io::Result<()> {
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = null.as_raw_fd();

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
