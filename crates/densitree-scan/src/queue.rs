//! The time-sliced read-job queue.
//!
//! One queue drives one tree. Jobs are dispatched one `run()` per
//! `tick()`; a host event loop calls `tick()` while the queue reports
//! itself active, or uses [`JobQueue::run_to_completion`] outright.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use densitree_core::{
    ExcludeRules, NodeId, ScanError, ScanOptions, Tree, TreeEvent,
};

use crate::cache::{CacheReadJob, CacheReader};
use crate::job::{JobId, JobKind, JobOutcome, ReadJob};
use crate::local::{node_from_metadata, LocalDirJob};
use crate::mounts::MountTable;
use crate::process::{ProcessPool, ProcessSpec};

/// How long `run_to_completion` parks on the process channel per round.
const PROCESS_WAIT_SLICE: Duration = Duration::from_millis(500);

/// What a `tick()` left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Runnable jobs remain; keep ticking.
    Active,
    /// Nothing runnable, but jobs are blocked on external processes.
    Blocked,
    /// Both job sets are empty.
    Idle,
}

/// FIFO of runnable jobs plus a pool of blocked jobs.
///
/// The queue owns its jobs and the process pool serving them. Exclude
/// rules and the mount table are injected at construction and shared
/// with every job the queue runs.
#[derive(Debug)]
pub struct JobQueue {
    runnable: VecDeque<ReadJob>,
    blocked: Vec<ReadJob>,
    pool: ProcessPool,
    options: ScanOptions,
    rules: Arc<ExcludeRules>,
    mounts: Arc<MountTable>,
    next_job_id: u64,
    armed: bool,
}

impl JobQueue {
    /// Create a queue with the given options, rules, and mount table.
    pub fn new(options: ScanOptions, rules: Arc<ExcludeRules>, mounts: Arc<MountTable>) -> Self {
        Self {
            runnable: VecDeque::new(),
            blocked: Vec::new(),
            pool: ProcessPool::new(densitree_core::DEFAULT_MAX_PARALLEL_PROCESSES),
            options,
            rules,
            mounts,
            next_job_id: 0,
            armed: false,
        }
    }

    /// Per-scan options.
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// The injected exclude rules.
    pub fn rules(&self) -> &Arc<ExcludeRules> {
        &self.rules
    }

    /// The injected mount table.
    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    /// The process pool serving blocked jobs.
    pub fn process_pool(&self) -> &ProcessPool {
        &self.pool
    }

    pub(crate) fn process_pool_mut(&mut self) -> &mut ProcessPool {
        &mut self.pool
    }

    /// Number of runnable jobs.
    pub fn runnable_count(&self) -> usize {
        self.runnable.len()
    }

    /// Number of jobs blocked on external processes.
    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    /// Check if any job remains, runnable or blocked.
    pub fn is_busy(&self) -> bool {
        !self.runnable.is_empty() || !self.blocked.is_empty()
    }

    /// Seed a local directory scan of `path`.
    ///
    /// Creates the top-level node (named with the full path) and
    /// enqueues its read job. Returns the top-level node id.
    pub fn open_dir(&mut self, tree: &mut Tree, path: &Path) -> Result<NodeId, ScanError> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| ScanError::io(path, e))?;
        if !meta.is_dir() {
            return Err(ScanError::NotADirectory {
                path: path.to_path_buf(),
            });
        }

        use std::os::unix::fs::MetadataExt;
        let device_name = self.mounts.device_for(path).map(str::to_string);
        tree.set_root_location(path.to_path_buf(), meta.dev(), device_name);

        let top = tree.insert_child(
            tree.root(),
            node_from_metadata(path.to_string_lossy().as_ref(), &meta),
        );
        let job = LocalDirJob::new(tree, top, false);
        self.enqueue_kind(tree, JobKind::Local(job));
        Ok(top)
    }

    /// Seed a scan from a cache file: the tree is cleared and rebuilt
    /// from the snapshot.
    pub fn read_cache(&mut self, tree: &mut Tree, cache_path: &Path) -> Result<(), ScanError> {
        let reader = CacheReader::open(cache_path)?;
        tree.clear();
        let root = tree.root();
        let job = CacheReadJob::new(tree, root, reader);
        self.enqueue_kind(tree, JobKind::Cache(job));
        Ok(())
    }

    pub(crate) fn take_job_id(&mut self) -> JobId {
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;
        id
    }

    /// Append a job to the runnable FIFO. Arms the queue, emitting
    /// `StartingReading` on the idle-to-armed transition.
    pub(crate) fn enqueue(&mut self, tree: &mut Tree, job: ReadJob) {
        self.runnable.push_back(job);
        if !self.armed {
            self.armed = true;
            tree.emit(TreeEvent::StartingReading);
        }
    }

    pub(crate) fn enqueue_kind(&mut self, tree: &mut Tree, kind: JobKind) -> JobId {
        let id = self.take_job_id();
        self.enqueue(tree, ReadJob { id, kind });
        id
    }

    /// Park a job in the blocked set and register its process with the
    /// pool. Blocking never arms the queue.
    pub(crate) fn block_with_process(&mut self, kind: JobKind, spec: ProcessSpec) -> JobId {
        let id = self.take_job_id();
        self.blocked.push(ReadJob { id, kind });
        self.pool.add(id, spec);
        id
    }

    /// Launch the staged package processes.
    pub fn start_processes(&mut self) {
        self.pool.start();
    }

    /// Dispatch one tick: drain process events, then run the head job
    /// exactly once.
    pub fn tick(&mut self, tree: &mut Tree) -> QueueState {
        self.drain_process_events(tree);

        if let Some(mut job) = self.runnable.pop_front() {
            // The job is detached while it runs: kill_all from inside
            // run() cannot free the running job.
            match job.run(self, tree) {
                JobOutcome::Yield => self.runnable.push_front(job),
                JobOutcome::Finished => self.finish_notify(tree, job),
                JobOutcome::Preempted => drop(job),
            }
        }

        self.state()
    }

    fn state(&self) -> QueueState {
        if !self.runnable.is_empty() {
            QueueState::Active
        } else if !self.blocked.is_empty() {
            QueueState::Blocked
        } else {
            QueueState::Idle
        }
    }

    /// Tick until every job, runnable or blocked, is gone.
    ///
    /// While only blocked jobs remain, parks on the process pool's
    /// event channel instead of spinning.
    pub fn run_to_completion(&mut self, tree: &mut Tree) {
        loop {
            match self.tick(tree) {
                QueueState::Active => {}
                QueueState::Blocked => {
                    if !self.pool.has_work() {
                        error!(
                            "{} blocked jobs but no live process; dropping them",
                            self.blocked.len()
                        );
                        self.abort(tree);
                        return;
                    }
                    self.pool.wait(PROCESS_WAIT_SLICE);
                }
                QueueState::Idle => return,
            }
        }
    }

    /// Package phase A: react to finished file-list processes.
    fn drain_process_events(&mut self, tree: &mut Tree) {
        let events = self.pool.poll();
        for event in events {
            let Some(pos) = self.blocked.iter().position(|j| j.id == event.job) else {
                // The job was killed while its process was still running.
                debug!("No blocked job for process event {:?}", event.job);
                continue;
            };
            let mut job = self.blocked.swap_remove(pos);

            let unblock = match &mut job.kind {
                JobKind::Pkg(pkg_job) => pkg_job.on_process_exit(tree, &event.outcome),
                _ => {
                    warn!("Process event for a non-package job");
                    false
                }
            };

            if unblock {
                self.enqueue(tree, job);
            } else {
                // The job already marked its package and told
                // subscribers; it just needs disposing.
                self.finish_notify(tree, job);
            }
        }
    }

    /// Dispose a finished job; emit `Finished` when it was the last one.
    fn finish_notify(&mut self, tree: &mut Tree, job: ReadJob) {
        self.dispose(tree, job);

        if self.runnable.is_empty() {
            self.armed = false;
            if self.blocked.is_empty() {
                tree.emit(TreeEvent::Finished);
            }
        }
    }

    /// Settle a job's pending-count accounting and drop it.
    fn dispose(&mut self, tree: &mut Tree, job: ReadJob) {
        tree.read_job_finished(job.dir());
    }

    /// Kill every job bound inside `subtree`.
    ///
    /// Safe to call from inside a running job: the running job is
    /// detached from the queue and can never kill itself.
    pub fn kill_all(&mut self, tree: &mut Tree, subtree: NodeId) {
        let mut killed = 0;

        let mut keep = VecDeque::with_capacity(self.runnable.len());
        while let Some(job) = self.runnable.pop_front() {
            if tree.is_in_subtree(job.dir(), subtree) {
                killed += 1;
                self.dispose(tree, job);
            } else {
                keep.push_back(job);
            }
        }
        self.runnable = keep;

        let mut index = 0;
        while index < self.blocked.len() {
            if tree.is_in_subtree(self.blocked[index].dir(), subtree) {
                let job = self.blocked.swap_remove(index);
                killed += 1;
                self.dispose(tree, job);
            } else {
                index += 1;
            }
        }

        debug!("Killed {killed} read jobs for {}", tree.url_of(subtree).display());
    }

    /// Kill the jobs inside `dir`, then delete its subtree, so no job
    /// outlives its target.
    pub fn delete_subtree(&mut self, tree: &mut Tree, dir: NodeId) {
        self.kill_all(tree, dir);
        tree.delete_subtree(dir);
    }

    /// Dispose every job without touching read states. Used when the
    /// whole tree is about to be replaced.
    pub(crate) fn clear_jobs(&mut self, tree: &mut Tree) {
        while let Some(job) = self.runnable.pop_front() {
            self.dispose(tree, job);
        }
        while let Some(job) = self.blocked.pop() {
            self.dispose(tree, job);
        }
    }

    /// Bulk cancellation: mark every bound directory (and its ancestors)
    /// `Aborted`, drop all jobs, emit `Aborted`.
    pub fn abort(&mut self, tree: &mut Tree) {
        let dirs: Vec<NodeId> = self
            .runnable
            .iter()
            .chain(self.blocked.iter())
            .map(ReadJob::dir)
            .collect();
        for dir in dirs {
            tree.read_job_aborted(dir);
        }

        self.clear_jobs(tree);
        self.armed = false;
        tree.emit(TreeEvent::Aborted);
    }
}
