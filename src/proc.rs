//! Child process helpers shared by the supervisors.

use std::process::Child;
use std::thread;
use std::time::Duration;

/// Ask the child to exit with SIGTERM, escalate to SIGKILL after a
/// bounded wait, then reap it. Safe to call on an already-dead child.
pub fn terminate(child: &mut Child) {
    let pid = child.id();

    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    sigterm(pid);

    // Bounded wait before the hard kill.
    for _ in 0..10 {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// Deliver SIGTERM without reaping.
pub fn sigterm(pid: u32) {
    // Child pids fit in i32 on every platform we run on.
    if let Ok(pid) = i32::try_from(pid) {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

/// Immediate SIGKILL without reaping.
pub fn sigkill(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}
