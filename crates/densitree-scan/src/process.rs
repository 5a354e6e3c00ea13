//! Bounded pool of external processes.
//!
//! The pool launches at most `max_parallel` processes at a time. Each
//! launched process gets a detached reaper thread that waits for it and
//! reports its exit over a channel; draining an exit event frees the
//! slot and launches the next pending process. The engine itself never
//! blocks on a child.

use std::collections::VecDeque;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::job::JobId;

/// A process to run: program, arguments, extra environment.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl ProcessSpec {
    /// Split a command string on whitespace: first token the program,
    /// the rest the arguments. `LANG=C` keeps tool output untranslated.
    pub fn from_command(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next()?.to_string();
        Some(Self {
            program,
            args: parts.map(str::to_string).collect(),
            envs: vec![("LANG".to_string(), "C".to_string())],
        })
    }
}

/// How a pooled process ended.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Exited normally with the given code; `output` is the captured
    /// stdout followed by stderr.
    Exited { code: i32, output: String },
    /// The process could not be spawned, or was killed by a signal.
    Failed { message: String },
}

impl ProcessOutcome {
    /// Normal completion: exited with code 0.
    pub fn success(&self) -> bool {
        matches!(self, ProcessOutcome::Exited { code: 0, .. })
    }
}

/// A process completion, tagged with the job waiting for it.
#[derive(Debug, Clone)]
pub struct ProcessEvent {
    pub job: JobId,
    pub outcome: ProcessOutcome,
}

/// Bounded launcher for external processes.
#[derive(Debug)]
pub struct ProcessPool {
    max_parallel: usize,
    pending: VecDeque<(JobId, ProcessSpec)>,
    active: usize,
    started: bool,
    tx: Sender<ProcessEvent>,
    rx: Receiver<ProcessEvent>,
    ready: Vec<ProcessEvent>,
}

impl ProcessPool {
    /// Create a pool with the given concurrency cap.
    pub fn new(max_parallel: usize) -> Self {
        let (tx, rx) = unbounded();
        Self {
            max_parallel: max_parallel.max(1),
            pending: VecDeque::new(),
            active: 0,
            started: false,
            tx,
            rx,
            ready: Vec::new(),
        }
    }

    /// Change the concurrency cap.
    pub fn set_max_parallel(&mut self, max_parallel: usize) {
        self.max_parallel = max_parallel.max(1);
    }

    /// The concurrency cap.
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Stage a process. Launched immediately when the pool is live and a
    /// slot is free, otherwise when a slot opens up.
    pub fn add(&mut self, job: JobId, spec: ProcessSpec) {
        self.pending.push_back((job, spec));
        if self.started {
            self.launch_next();
        }
    }

    /// Go live: launch staged processes up to the cap.
    pub fn start(&mut self) {
        self.started = true;
        self.launch_next();
    }

    /// Processes currently running.
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Processes staged but not yet launched.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if the pool can still produce events.
    pub fn has_work(&self) -> bool {
        self.active > 0 || !self.ready.is_empty() || (self.started && !self.pending.is_empty())
    }

    /// Drain all completion events that have arrived, freeing their
    /// slots and launching pending processes.
    pub fn poll(&mut self) -> Vec<ProcessEvent> {
        let mut events = std::mem::take(&mut self.ready);
        for event in self.rx.try_iter() {
            self.active = self.active.saturating_sub(1);
            events.push(event);
        }
        if !events.is_empty() {
            self.launch_next();
        }
        events
    }

    /// Park until a completion event arrives or the timeout expires.
    /// The event is buffered for the next `poll()`. Returns whether an
    /// event arrived.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.active = self.active.saturating_sub(1);
                self.launch_next();
                self.ready.push(event);
                true
            }
            Err(_) => false,
        }
    }

    fn launch_next(&mut self) {
        while self.started && self.active < self.max_parallel {
            let Some((job, spec)) = self.pending.pop_front() else {
                return;
            };
            self.spawn(job, spec);
        }
    }

    fn spawn(&mut self, job: JobId, spec: ProcessSpec) {
        debug!("Starting {} {:?}", spec.program, spec.args);

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Cannot start {}: {e}", spec.program);
                // Never occupied a slot, so it must not release one:
                // deliver the failure directly.
                self.ready.push(ProcessEvent {
                    job,
                    outcome: ProcessOutcome::Failed {
                        message: format!("{}: {e}", spec.program),
                    },
                });
                return;
            }
        };

        self.active += 1;
        let tx = self.tx.clone();
        let program = spec.program.clone();

        thread::spawn(move || {
            let outcome = match child.wait_with_output() {
                Ok(output) => match output.status.code() {
                    Some(code) => {
                        let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
                        merged.push_str(&String::from_utf8_lossy(&output.stderr));
                        ProcessOutcome::Exited {
                            code,
                            output: merged,
                        }
                    }
                    None => ProcessOutcome::Failed {
                        message: format!("{program} killed by a signal"),
                    },
                },
                Err(e) => ProcessOutcome::Failed {
                    message: format!("wait on {program} failed: {e}"),
                },
            };
            // The pool may be gone already; nothing to do then.
            let _ = tx.send(ProcessEvent { job, outcome });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            envs: vec![("LANG".to_string(), "C".to_string())],
        }
    }

    fn drain(pool: &mut ProcessPool, expected: usize) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while events.len() < expected {
            assert!(pool.wait(Duration::from_secs(10)), "pool timed out");
            events.extend(pool.poll());
        }
        events
    }

    #[test]
    fn test_from_command_splits_whitespace() {
        let spec = ProcessSpec::from_command("/usr/bin/dpkg-query --listfiles  coreutils").unwrap();
        assert_eq!(spec.program, "/usr/bin/dpkg-query");
        assert_eq!(spec.args, vec!["--listfiles", "coreutils"]);
        assert!(spec.envs.contains(&("LANG".to_string(), "C".to_string())));
        assert!(ProcessSpec::from_command("   ").is_none());
    }

    #[test]
    fn test_staged_until_start() {
        let mut pool = ProcessPool::new(2);
        pool.add(JobId(1), sh("true"));
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.pending_count(), 1);

        pool.start();
        let events = drain(&mut pool, 1);
        assert!(events[0].outcome.success());
    }

    #[test]
    fn test_cap_limits_concurrency() {
        let mut pool = ProcessPool::new(2);
        for i in 0..3 {
            pool.add(JobId(i), sh("sleep 2"));
        }
        pool.start();

        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.pending_count(), 1);
    }

    #[test]
    fn test_slot_released_on_exit() {
        let mut pool = ProcessPool::new(1);
        pool.add(JobId(1), sh("echo one"));
        pool.add(JobId(2), sh("echo two"));
        pool.start();
        assert_eq!(pool.pending_count(), 1);

        let events = drain(&mut pool, 2);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.outcome.success()));
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.pending_count(), 0);
        assert!(!pool.has_work());
    }

    #[test]
    fn test_nonzero_exit_reported() {
        let mut pool = ProcessPool::new(1);
        pool.add(JobId(1), sh("exit 2"));
        pool.start();

        let events = drain(&mut pool, 1);
        match &events[0].outcome {
            ProcessOutcome::Exited { code, .. } => assert_eq!(*code, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!events[0].outcome.success());
    }

    #[test]
    fn test_spawn_failure_is_an_event() {
        let mut pool = ProcessPool::new(1);
        pool.add(JobId(1), ProcessSpec::from_command("/no/such/binary --flag").unwrap());
        pool.start();

        let events = pool.poll();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].outcome, ProcessOutcome::Failed { .. }));
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn test_output_merges_stdout_and_stderr() {
        let mut pool = ProcessPool::new(1);
        pool.add(JobId(1), sh("echo out; echo err >&2"));
        pool.start();

        let events = drain(&mut pool, 1);
        match &events[0].outcome {
            ProcessOutcome::Exited { output, .. } => {
                assert!(output.contains("out"));
                assert!(output.contains("err"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
