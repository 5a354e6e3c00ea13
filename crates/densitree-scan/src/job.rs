//! Read-job lifecycle shared by the three job variants.

use densitree_core::{NodeId, ReadState, Tree};

use crate::cache::CacheReadJob;
use crate::local::LocalDirJob;
use crate::pkg::PkgJob;
use crate::queue::JobQueue;

/// Identifier of a job within its queue.
///
/// Used to pair blocked jobs with their external processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub(crate) u64);

/// What a job's `run()` did with its tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    /// Not done yet; keep the job at the head and run it again next tick.
    Yield,
    /// Complete; the queue disposes the job, decrementing the pending-job
    /// chain of its bound directory.
    Finished,
    /// The job replaced itself with a cache job and settled its own
    /// accounting; its bound directory may already be deleted. The queue
    /// drops it without further bookkeeping.
    Preempted,
}

/// One of the three job variants.
#[derive(Debug)]
pub(crate) enum JobKind {
    Local(LocalDirJob),
    Cache(CacheReadJob),
    Pkg(PkgJob),
}

/// A unit of work producing part of the tree.
///
/// Owned by the [`JobQueue`]; holds only a `NodeId` into the tree it
/// populates, never a reference.
#[derive(Debug)]
pub(crate) struct ReadJob {
    pub(crate) id: JobId,
    pub(crate) kind: JobKind,
}

impl ReadJob {
    /// The directory this job populates.
    pub(crate) fn dir(&self) -> NodeId {
        match &self.kind {
            JobKind::Local(job) => job.dir(),
            JobKind::Cache(job) => job.dir(),
            JobKind::Pkg(job) => job.dir(),
        }
    }

    /// Dispatch one tick of work.
    pub(crate) fn run(&mut self, queue: &mut JobQueue, tree: &mut Tree) -> JobOutcome {
        match &mut self.kind {
            JobKind::Local(job) => job.run(queue, tree),
            JobKind::Cache(job) => job.run(tree),
            JobKind::Pkg(job) => job.run(tree),
        }
    }
}

/// Move a directory to its terminal read state and tell subscribers.
///
/// `FinalizeLocal` must go out before the state flips, `ReadJobFinished`
/// after.
pub(crate) fn finish_reading(tree: &mut Tree, dir: NodeId, state: ReadState) {
    tree.send_finalize_local(dir);
    tree.set_read_state(dir, state);
    tree.send_read_job_finished(dir);
}
