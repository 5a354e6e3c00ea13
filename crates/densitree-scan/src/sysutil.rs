//! Small helpers for running external commands synchronously.
//!
//! These are for the short, synchronous probes (is a package manager
//! installed? which package owns this file?). The long-running per-package
//! file-list commands go through the [`ProcessPool`](crate::ProcessPool)
//! instead.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use regex::Regex;
use tracing::debug;

use densitree_core::ScanError;

/// Check if `path` exists and is executable.
pub fn have_command(path: &str) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Run a command with `LANG=C` and capture its stdout.
///
/// Returns the exit code and the output; a process killed by a signal
/// reports exit code -1.
pub fn run_command(program: &str, args: &[&str]) -> Result<(i32, String), ScanError> {
    debug!("Running {program} {args:?}");

    let output = Command::new(program)
        .args(args)
        .env("LANG", "C")
        .output()
        .map_err(|e| ScanError::sys_call("exec", program, e))?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    Ok((exit_code, stdout))
}

/// Run a command and check its output against an expected pattern.
///
/// Any failure, including a bad pattern, counts as a mismatch.
pub fn try_run_command(program: &str, args: &[&str], expected_pattern: &str) -> bool {
    let Ok(expected) = Regex::new(expected_pattern) else {
        debug!("Bad probe pattern \"{expected_pattern}\"");
        return false;
    };
    match run_command(program, args) {
        Ok((0, output)) => expected.is_match(output.trim()),
        Ok((code, _)) => {
            debug!("{program} exited with {code}");
            false
        }
        Err(e) => {
            debug!("{program} did not run: {e}");
            false
        }
    }
}

/// Check if `path` allows the mount-table style prefix match.
pub(crate) fn path_is_prefix_of(prefix: &Path, path: &Path) -> bool {
    path.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_have_command() {
        assert!(have_command("/bin/sh"));
        assert!(!have_command("/no/such/binary"));
    }

    #[test]
    fn test_run_command_captures_stdout() {
        let (code, output) = run_command("/bin/sh", &["-c", "echo hello"]).unwrap();
        assert_eq!(code, 0);
        assert_eq!(output.trim(), "hello");
    }

    #[test]
    fn test_run_command_exit_code() {
        let (code, _) = run_command("/bin/sh", &["-c", "exit 3"]).unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_try_run_command() {
        assert!(try_run_command("/bin/sh", &["-c", "echo hello"], "^hel+o$"));
        assert!(!try_run_command("/bin/sh", &["-c", "echo goodbye"], "^hel+o$"));
        assert!(!try_run_command("/no/such/binary", &[], "^x$"));
        assert!(!try_run_command("/bin/sh", &["-c", "echo hello"], "("));
    }

}
