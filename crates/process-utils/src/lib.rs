//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for an external tool.
///
/// The child is killed when its handle is dropped, so an abandoned attempt
/// never leaves an orphaned encoder or downloader behind.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Returns true when every needle matches the end of at least one argument.
///
/// Suffix matching keeps `twitch.tv/foo` from matching `twitch.tv/foobar`.
pub fn command_line_matches<S: AsRef<str>>(args: &[S], needles: &[&str]) -> bool {
    if needles.is_empty() {
        return false;
    }
    needles.iter().all(|needle| {
        let needle = needle.to_lowercase();
        args.iter()
            .any(|arg| arg.as_ref().to_lowercase().ends_with(&needle))
    })
}

/// Kill every process (other than the current one) whose command line
/// matches all of `needles`. Returns the number of processes signalled.
#[cfg(feature = "sysinfo")]
pub fn kill_matching(needles: &[&str]) -> usize {
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );

    let own_pid = sysinfo::get_current_pid().ok();
    let mut killed = 0;
    for (pid, process) in system.processes() {
        if Some(*pid) == own_pid {
            continue;
        }
        let args: Vec<String> = process
            .cmd()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        if command_line_matches(&args, needles) && process.kill() {
            killed += 1;
        }
    }
    killed
}

/// Ask a process to stop the way Ctrl-C would, so it can flush its output.
///
/// Returns false if the process is gone or the platform has no such signal.
#[cfg(feature = "sysinfo")]
pub fn interrupt(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        false,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(pid)
        .and_then(|process| process.kill_with(Signal::Interrupt))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_all_needles_case_insensitive() {
        let args = ["chat_downloader", "https://www.twitch.tv/SomeChannel", "--output", "/tmp/x.json"];
        assert!(command_line_matches(&args, &["chat_downloader", "twitch.tv/somechannel"]));
        assert!(!command_line_matches(&args, &["chat_downloader", "twitch.tv/other"]));
        assert!(!command_line_matches(&args, &["chat_downloader", "twitch.tv/some"]));
    }

    #[test]
    fn empty_needles_never_match() {
        let args = ["anything"];
        assert!(!command_line_matches(&args, &[]));
    }

    #[cfg(all(unix, feature = "sysinfo"))]
    #[test]
    fn interrupt_stops_a_running_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        assert!(interrupt(child.id()));
        assert!(!child.wait().unwrap().success());
    }
}
