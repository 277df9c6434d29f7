//! # Submission Queues
//!
//! A queue is an ordered channel of jobs bound to one address space.
//!
//! Jobs carry a strictly increasing sequence number. They are dispatched
//! head-first (a job never starts before an older job on the same queue)
//! and retired strictly in sequence order, which is what makes signal
//! points on one queue complete in submission order.
//!
//! ```text
//!            enqueue                dispatch               retire
//!  Submit ──────────▶ Pending ─────────────────▶ Running ──────────▶ Done ─▶ signal
//!                        │ waits unmet: stay         │ fault               + unpin
//!                        │ dependency lost ──────────┴──▶ Done(fault)
//!                        └─ earlier fault ──────────────▶ Done(Killed)
//! ```

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use spin::Mutex;
use tessera_core::{Error, ExecFault, GpuAddr, Result, SyncObject, SyncPoint};
use tessera_mem::{BufferPin, VmHandle};

use crate::backend::JobDescriptor;
use crate::command::{Command, CommandType};

/// Lowest-urgency priority class
pub const MAX_PRIORITY: u8 = 3;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// QUEUE ATTRIBUTES
// =============================================================================

/// Kind of work a queue accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueKind {
    /// Render and blit
    Render = 0,
    /// Compute
    Compute = 1,
}

impl QueueKind {
    /// Decode a wire queue type
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Render),
            1 => Ok(Self::Compute),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Check if `ty` may be submitted to this kind of queue
    pub fn accepts(self, ty: CommandType) -> bool {
        matches!(
            (self, ty),
            (Self::Render, CommandType::Render)
                | (Self::Render, CommandType::Blit)
                | (Self::Compute, CommandType::Compute)
        )
    }
}

/// Priority class, 0 highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    /// Validate a raw priority
    pub fn new(raw: u32) -> Result<Self> {
        if raw > MAX_PRIORITY as u32 {
            return Err(Error::InvalidPriority);
        }
        Ok(Self(raw as u8))
    }

    /// Raw value
    pub fn get(self) -> u8 {
        self.0
    }
}

/// Queue lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting work
    Active,
    /// A job faulted; submissions are refused until reset
    Faulted,
    /// Owner is gone; remaining jobs drain
    Closed,
}

/// Asynchronous failure of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// Sequence number of the failed job
    pub seq: u64,
    /// What went wrong
    pub fault: ExecFault,
}

// =============================================================================
// SUBMISSIONS & JOBS
// =============================================================================

/// A validated submission ready to enqueue
#[derive(Debug)]
pub struct Submission {
    /// Command payload
    pub command: Command,
    /// Sync objects and points to wait for; point 0 means "everything
    /// scheduled so far"
    pub waits: Vec<(Weak<SyncObject>, SyncPoint)>,
    /// Sync object to signal on completion
    pub signal: Option<Weak<SyncObject>>,
    /// In-flight references on every buffer the payload points into
    pub pins: Vec<BufferPin>,
    /// First payload address with no binding behind it
    pub unresolved: Option<GpuAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Pending,
    Running,
    Done(Option<ExecFault>),
}

#[derive(Debug)]
struct Job {
    seq: u64,
    command: Arc<Command>,
    waits: Vec<(Weak<SyncObject>, SyncPoint)>,
    signal: Option<(Weak<SyncObject>, SyncPoint)>,
    pins: Vec<BufferPin>,
    unresolved: Option<GpuAddr>,
    state: JobState,
}

/// Result of asking a pending job whether it can start
enum Readiness {
    Ready,
    Blocked,
    Failed(ExecFault),
}

impl Job {
    fn readiness(&self) -> Readiness {
        for (sync, point) in &self.waits {
            match sync.upgrade() {
                Some(sync) if sync.is_signaled(*point) => {}
                Some(_) => return Readiness::Blocked,
                None => return Readiness::Failed(ExecFault::DependencyLost),
            }
        }
        match self.unresolved {
            Some(addr) => Readiness::Failed(ExecFault::MmuFault { addr: addr.raw() }),
            None => Readiness::Ready,
        }
    }
}

/// A retired job's remaining effects, applied outside the queue lock
#[derive(Debug)]
pub struct Retired {
    /// Sequence number
    pub seq: u64,
    /// Fault, if any
    pub fault: Option<ExecFault>,
    signal: Option<(Weak<SyncObject>, SyncPoint)>,
    pins: Vec<BufferPin>,
}

impl Retired {
    /// Signal completion and release buffer references
    ///
    /// No table or queue lock may be held by the caller.
    pub fn finish(self) {
        if let Some((sync, point)) = self.signal {
            if let Some(sync) = sync.upgrade() {
                sync.complete(point);
            }
        }
        drop(self.pins);
    }
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Debug)]
struct QueueInner {
    state: QueueState,
    next_seq: u64,
    jobs: VecDeque<Job>,
    faults: VecDeque<FaultRecord>,
}

impl QueueInner {
    /// Cancel every job that has not started
    ///
    /// Dispatch is head-first, so all pending jobs are younger than any
    /// job that already ran or failed.
    fn kill_pending(&mut self) {
        for job in self.jobs.iter_mut() {
            if job.state == JobState::Pending {
                job.state = JobState::Done(Some(ExecFault::Killed));
            }
        }
    }
}

/// Submission queue
pub struct Queue {
    id: u64,
    file_id: u64,
    vm: VmHandle,
    context_id: u64,
    kind: QueueKind,
    priority: Priority,
    max_inflight: usize,
    inner: Mutex<QueueInner>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("vm", &self.vm)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Create a queue on an address space
    pub fn new(
        file_id: u64,
        vm: VmHandle,
        context_id: u64,
        kind: QueueKind,
        priority: Priority,
        max_inflight: usize,
    ) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            file_id,
            vm,
            context_id,
            kind,
            priority,
            max_inflight,
            inner: Mutex::new(QueueInner {
                state: QueueState::Active,
                next_seq: 1,
                jobs: VecDeque::new(),
                faults: VecDeque::new(),
            }),
        }
    }

    /// Device-unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owning address space
    pub fn vm(&self) -> VmHandle {
        self.vm
    }

    /// Work kind
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Priority class
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Lifecycle state
    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    /// Accepted jobs not yet retired
    pub fn inflight(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Check a command against the queue before anything is reserved
    pub fn check(&self, command: &Command) -> Result<()> {
        match self.state() {
            QueueState::Active => {}
            QueueState::Faulted => return Err(Error::ExecutionFault),
            QueueState::Closed => return Err(Error::InvalidHandle),
        }
        if !self.kind.accepts(command.command_type()) {
            return Err(Error::TypeMismatch);
        }
        command.validate()
    }

    /// Accept a submission, returning its sequence number
    ///
    /// The signal point is reserved under the queue lock so reservation
    /// order on the sync object matches sequence order.
    pub fn enqueue(&self, sub: Submission) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.state {
            QueueState::Active => {}
            QueueState::Faulted => return Err(Error::ExecutionFault),
            QueueState::Closed => return Err(Error::InvalidHandle),
        }
        if inner.jobs.len() >= self.max_inflight {
            return Err(Error::OutOfResources);
        }

        let mut waits = Vec::with_capacity(sub.waits.len());
        for (weak, point) in sub.waits {
            let sync = weak.upgrade().ok_or(Error::InvalidSyncObject)?;
            let point = if point == 0 { sync.last_reserved() } else { point };
            waits.push((weak, point));
        }
        let signal = match sub.signal {
            Some(weak) => {
                let sync = weak.upgrade().ok_or(Error::InvalidSyncObject)?;
                Some((weak, sync.reserve()))
            }
            None => None,
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.push_back(Job {
            seq,
            command: Arc::new(sub.command),
            waits,
            signal,
            pins: sub.pins,
            unresolved: sub.unresolved,
            state: JobState::Pending,
        });
        log::trace!(
            "[File {} Queue {}]: job {} enqueued ({} in flight)",
            self.file_id,
            self.id,
            seq,
            inner.jobs.len()
        );
        Ok(seq)
    }

    /// Next job that may start, or `None`
    ///
    /// A pending job that cannot ever run (lost dependency, unresolved
    /// pointer) is marked done with its fault instead, every job behind it
    /// is killed and the search stops. Nothing starts behind a failed job
    /// that has not retired yet.
    pub fn next_dispatch(&self) -> Option<JobDescriptor> {
        let mut inner = self.inner.lock();
        let mut jobs = inner.jobs.iter_mut();
        let job = loop {
            let job = jobs.next()?;
            match job.state {
                JobState::Pending => break job,
                JobState::Done(Some(fault)) if fault != ExecFault::Killed => return None,
                _ => {}
            }
        };
        match job.readiness() {
            Readiness::Blocked => None,
            Readiness::Failed(fault) => {
                job.state = JobState::Done(Some(fault));
                inner.kill_pending();
                None
            }
            Readiness::Ready => {
                job.state = JobState::Running;
                Some(JobDescriptor {
                    queue_id: self.id,
                    kind: self.kind,
                    priority: self.priority.get(),
                    context_id: self.context_id,
                    seq: job.seq,
                    command: Arc::clone(&job.command),
                })
            }
        }
    }

    /// Record that a running job finished
    pub fn complete(&self, seq: u64, fault: Option<ExecFault>) {
        let mut inner = self.inner.lock();
        let Some(job) = inner
            .jobs
            .iter_mut()
            .find(|j| j.seq == seq && j.state == JobState::Running)
        else {
            log::error!(
                "[File {} Queue {}]: completion for job {} not running",
                self.file_id,
                self.id,
                seq
            );
            return;
        };
        job.state = JobState::Done(fault);
        if matches!(fault, Some(f) if f != ExecFault::Killed) {
            inner.kill_pending();
        }
    }

    /// Pop finished jobs from the head, in sequence order
    ///
    /// The first fault moves the queue to `Faulted` and kills every job that
    /// has not started.
    pub fn retire(&self) -> Vec<Retired> {
        let mut inner = self.inner.lock();
        let mut retired = Vec::new();

        while let Some(JobState::Done(fault)) = inner.jobs.front().map(|j| j.state) {
            let Some(job) = inner.jobs.pop_front() else {
                break;
            };
            if let Some(fault) = fault {
                inner.faults.push_back(FaultRecord { seq: job.seq, fault });
                if fault != ExecFault::Killed {
                    log::warn!(
                        "[File {} Queue {}]: job {} faulted: {}",
                        self.file_id,
                        self.id,
                        job.seq,
                        fault
                    );
                    if inner.state == QueueState::Active {
                        inner.state = QueueState::Faulted;
                    }
                    inner.kill_pending();
                }
            }
            retired.push(Retired {
                seq: job.seq,
                fault,
                signal: job.signal,
                pins: job.pins,
            });
        }
        retired
    }

    /// Drain the fault channel
    pub fn take_faults(&self) -> Vec<FaultRecord> {
        self.inner.lock().faults.drain(..).collect()
    }

    /// Oldest unread fault
    pub fn pop_fault(&self) -> Option<FaultRecord> {
        self.inner.lock().faults.pop_front()
    }

    /// Return a faulted queue to service
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            QueueState::Faulted => {
                inner.state = QueueState::Active;
                log::debug!("[File {} Queue {}]: reset", self.file_id, self.id);
                Ok(())
            }
            QueueState::Active => Ok(()),
            QueueState::Closed => Err(Error::InvalidHandle),
        }
    }

    /// Stop accepting work; queued jobs still drain
    pub fn close(&self) {
        self.inner.lock().state = QueueState::Closed;
    }

    /// Close only if nothing is in flight
    ///
    /// The check and the state change happen under one lock, so no
    /// submission can slip in between.
    pub fn try_close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.jobs.is_empty() {
            return Err(Error::ResourceBusy);
        }
        inner.state = QueueState::Closed;
        Ok(())
    }

    /// Check if closed with nothing left to run
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == QueueState::Closed && inner.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BlitCommand, ComputeCommand};
    use crate::render::RenderCommand;
    use tessera_core::HandleTable;

    fn vm() -> VmHandle {
        let mut table = HandleTable::new(1);
        let h = table.insert(()).unwrap();
        VmHandle::from_raw(h.to_raw()).unwrap()
    }

    fn queue(kind: QueueKind) -> Queue {
        Queue::new(1, vm(), 1, kind, Priority::new(0).unwrap(), 4)
    }

    fn blit() -> Command {
        Command::Blit(BlitCommand {
            encoder_ptr: GpuAddr::new(0x20_0000_0000),
            encoder_end: GpuAddr::new(0x20_0000_0100),
            ..Default::default()
        })
    }

    fn submission(signal: Option<&Arc<SyncObject>>) -> Submission {
        Submission {
            command: blit(),
            waits: Vec::new(),
            signal: signal.map(Arc::downgrade),
            pins: Vec::new(),
            unresolved: None,
        }
    }

    fn run_head(q: &Queue, fault: Option<ExecFault>) -> Vec<Retired> {
        let job = q.next_dispatch().unwrap();
        q.complete(job.seq, fault);
        q.retire()
    }

    #[test]
    fn test_priority_bounds() {
        assert!(Priority::new(3).is_ok());
        assert_eq!(Priority::new(4), Err(Error::InvalidPriority));
    }

    #[test]
    fn test_kind_accepts() {
        assert!(QueueKind::Render.accepts(CommandType::Render));
        assert!(QueueKind::Render.accepts(CommandType::Blit));
        assert!(!QueueKind::Render.accepts(CommandType::Compute));
        assert!(QueueKind::Compute.accepts(CommandType::Compute));
        assert!(!QueueKind::Compute.accepts(CommandType::Blit));
    }

    #[test]
    fn test_check_type_mismatch() {
        let q = queue(QueueKind::Compute);
        assert_eq!(q.check(&blit()), Err(Error::TypeMismatch));
        let compute = Command::Compute(ComputeCommand {
            encoder_ptr: GpuAddr::new(0x20_0000_0000),
            encoder_end: GpuAddr::new(0x20_0000_0100),
            ..Default::default()
        });
        assert_eq!(q.check(&compute), Ok(()));
    }

    #[test]
    fn test_check_validates_render() {
        let q = queue(QueueKind::Render);
        let bad = RenderCommand::new(GpuAddr::new(0x20_0000_0000), 0, 0);
        assert_eq!(
            q.check(&Command::Render(Box::new(bad))),
            Err(Error::InvalidCommand)
        );
    }

    #[test]
    fn test_sequence_and_signal_order() {
        let q = queue(QueueKind::Render);
        let syncs: Vec<_> = (0..3).map(|_| Arc::new(SyncObject::new())).collect();
        for s in &syncs {
            q.enqueue(submission(Some(s))).unwrap();
        }
        assert_eq!(q.inflight(), 3);
        let a = q.next_dispatch().unwrap();
        let b = q.next_dispatch().unwrap();
        assert_eq!((a.seq, b.seq), (1, 2));

        // Second finishes first; nothing retires until the head is done.
        q.complete(b.seq, None);
        assert!(q.retire().is_empty());
        q.complete(a.seq, None);
        let retired = q.retire();
        assert_eq!(retired.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2]);
        for r in retired {
            r.finish();
        }
        assert!(syncs[0].is_signaled(1));
        assert!(syncs[1].is_signaled(1));
        assert!(!syncs[2].is_signaled(1));
    }

    #[test]
    fn test_inflight_limit() {
        let q = queue(QueueKind::Render);
        for _ in 0..4 {
            q.enqueue(submission(None)).unwrap();
        }
        assert_eq!(q.enqueue(submission(None)), Err(Error::OutOfResources));
    }

    #[test]
    fn test_wait_blocks_dispatch() {
        let q = queue(QueueKind::Render);
        let dep = Arc::new(SyncObject::new());
        let mut sub = submission(None);
        sub.waits.push((Arc::downgrade(&dep), 1));
        q.enqueue(sub).unwrap();
        assert!(q.next_dispatch().is_none());
        dep.signal(1).unwrap();
        assert!(q.next_dispatch().is_some());
    }

    #[test]
    fn test_wait_point_zero_uses_last_reserved() {
        let q = queue(QueueKind::Render);
        let dep = Arc::new(SyncObject::new());
        dep.reserve();
        dep.reserve();
        let mut sub = submission(None);
        sub.waits.push((Arc::downgrade(&dep), 0));
        q.enqueue(sub).unwrap();
        dep.complete(1);
        assert!(q.next_dispatch().is_none());
        dep.complete(2);
        assert!(q.next_dispatch().is_some());
    }

    #[test]
    fn test_lost_dependency_faults() {
        let q = queue(QueueKind::Render);
        let dep = Arc::new(SyncObject::new());
        let mut sub = submission(None);
        sub.waits.push((Arc::downgrade(&dep), 1));
        q.enqueue(sub).unwrap();
        drop(dep);
        assert!(q.next_dispatch().is_none());
        let retired = q.retire();
        assert_eq!(retired[0].fault, Some(ExecFault::DependencyLost));
        assert_eq!(q.state(), QueueState::Faulted);
    }

    #[test]
    fn test_fault_kills_pending_and_rejects() {
        let q = queue(QueueKind::Render);
        let later = Arc::new(SyncObject::new());
        q.enqueue(submission(None)).unwrap();
        q.enqueue(submission(Some(&later))).unwrap();

        let retired = run_head(&q, Some(ExecFault::Timeout));
        assert_eq!(retired.len(), 2);
        assert_eq!(retired[1].fault, Some(ExecFault::Killed));
        for r in retired {
            r.finish();
        }
        // Killed jobs still signal so waiters elsewhere make progress.
        assert!(later.is_signaled(1));

        assert_eq!(q.state(), QueueState::Faulted);
        assert_eq!(q.enqueue(submission(None)), Err(Error::ExecutionFault));
        assert_eq!(q.check(&blit()), Err(Error::ExecutionFault));
        let faults = q.take_faults();
        assert_eq!(
            faults,
            vec![
                FaultRecord {
                    seq: 1,
                    fault: ExecFault::Timeout
                },
                FaultRecord {
                    seq: 2,
                    fault: ExecFault::Killed
                },
            ]
        );
        assert!(q.take_faults().is_empty());

        q.reset().unwrap();
        assert_eq!(q.state(), QueueState::Active);
        assert_eq!(q.enqueue(submission(None)), Ok(3));
    }

    #[test]
    fn test_unresolved_pointer_faults() {
        let q = queue(QueueKind::Render);
        let mut sub = submission(None);
        sub.unresolved = Some(GpuAddr::new(0x30_0000_0000));
        q.enqueue(sub).unwrap();
        assert!(q.next_dispatch().is_none());
        assert_eq!(
            q.retire()[0].fault,
            Some(ExecFault::MmuFault {
                addr: 0x30_0000_0000
            })
        );
    }

    #[test]
    fn test_failed_dispatch_kills_younger_jobs() {
        let q = queue(QueueKind::Render);
        let last = Arc::new(SyncObject::new());
        q.enqueue(submission(None)).unwrap();
        let mut bad = submission(None);
        bad.unresolved = Some(GpuAddr::new(0x30_0000_0000));
        q.enqueue(bad).unwrap();
        q.enqueue(submission(Some(&last))).unwrap();

        let head = q.next_dispatch().unwrap();
        assert_eq!(head.seq, 1);
        assert!(q.next_dispatch().is_none());
        assert!(q.next_dispatch().is_none());

        q.complete(head.seq, None);
        let retired = q.retire();
        assert_eq!(
            retired.iter().map(|r| r.fault).collect::<Vec<_>>(),
            vec![
                None,
                Some(ExecFault::MmuFault {
                    addr: 0x30_0000_0000
                }),
                Some(ExecFault::Killed),
            ]
        );
        for r in retired {
            r.finish();
        }
        assert!(last.is_signaled(1));
        assert_eq!(q.state(), QueueState::Faulted);
    }

    #[test]
    fn test_nothing_starts_behind_unretired_fault() {
        let q = queue(QueueKind::Render);
        q.enqueue(submission(None)).unwrap();
        q.enqueue(submission(None)).unwrap();
        let head = q.next_dispatch().unwrap();
        q.complete(head.seq, Some(ExecFault::Timeout));

        // Accepted before retire noticed the fault; must not run.
        q.enqueue(submission(None)).unwrap();
        assert!(q.next_dispatch().is_none());
        let faults: Vec<_> = q.retire().iter().map(|r| r.fault).collect();
        assert_eq!(
            faults,
            vec![
                Some(ExecFault::Timeout),
                Some(ExecFault::Killed),
                Some(ExecFault::Killed),
            ]
        );
    }

    #[test]
    fn test_try_close_busy() {
        let q = queue(QueueKind::Render);
        q.enqueue(submission(None)).unwrap();
        assert_eq!(q.try_close(), Err(Error::ResourceBusy));
        run_head(&q, None);
        assert_eq!(q.try_close(), Ok(()));
        assert_eq!(q.state(), QueueState::Closed);
    }

    #[test]
    fn test_pop_fault() {
        let q = queue(QueueKind::Render);
        q.enqueue(submission(None)).unwrap();
        run_head(&q, Some(ExecFault::Unknown));
        assert_eq!(
            q.pop_fault(),
            Some(FaultRecord {
                seq: 1,
                fault: ExecFault::Unknown
            })
        );
        assert_eq!(q.pop_fault(), None);
    }

    #[test]
    fn test_close_drains() {
        let q = queue(QueueKind::Render);
        q.enqueue(submission(None)).unwrap();
        q.close();
        assert_eq!(q.enqueue(submission(None)), Err(Error::InvalidHandle));
        assert!(!q.is_drained());
        run_head(&q, None);
        assert!(q.is_drained());
    }
}
