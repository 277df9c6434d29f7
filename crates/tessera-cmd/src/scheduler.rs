//! # Job Scheduler
//!
//! Moves jobs between queues and the execution backend.
//!
//! One pass of the pump:
//! 1. drain backend completions into their queues,
//! 2. dispatch ready jobs, queues visited in priority order (0 first),
//! 3. retire finished jobs head-first, signalling and unpinning.
//!
//! Passes repeat while anything changed, so a signal produced in step 3 can
//! release a dependent job on another queue within the same call. Any thread
//! may kick the pump; if another thread is already pumping, the kick is
//! folded into that thread's next pass.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::Mutex;
use tessera_core::ExecFault;

use crate::backend::ExecutionBackend;
use crate::queue::Queue;

/// Priority-ordered dispatcher over every live queue of a device
#[derive(Debug)]
pub struct Scheduler {
    backend: Arc<dyn ExecutionBackend>,
    queues: Mutex<Vec<Arc<Queue>>>,
    pump: Mutex<()>,
    rerun: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler driving `backend`
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            queues: Mutex::new(Vec::new()),
            pump: Mutex::new(()),
            rerun: AtomicBool::new(false),
        }
    }

    /// Start scheduling a queue
    pub fn register(&self, queue: Arc<Queue>) {
        let mut queues = self.queues.lock();
        queues.push(queue);
        queues.sort_by_key(|q| (q.priority(), q.id()));
    }

    /// Stop scheduling a queue
    pub fn unregister(&self, queue_id: u64) {
        self.queues.lock().retain(|q| q.id() != queue_id);
    }

    /// Number of scheduled queues
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Run the pump until nothing changes
    pub fn kick(&self) {
        self.rerun.store(true, Ordering::Release);
        loop {
            let Some(guard) = self.pump.try_lock() else {
                return;
            };
            while self.rerun.swap(false, Ordering::AcqRel) {
                while self.pass() {}
            }
            drop(guard);
            if !self.rerun.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<Queue>> {
        self.queues.lock().clone()
    }

    /// One pump pass; returns whether anything changed
    fn pass(&self) -> bool {
        let queues = self.snapshot();
        let mut progress = false;

        for done in self.backend.poll_completions() {
            match queues.iter().find(|q| q.id() == done.queue_id) {
                Some(queue) => queue.complete(done.seq, done.fault),
                None => log::error!(
                    "completion for unknown queue {} (job {})",
                    done.queue_id,
                    done.seq
                ),
            }
            progress = true;
        }

        for queue in &queues {
            while let Some(job) = queue.next_dispatch() {
                log::trace!("dispatch queue {} job {}", job.queue_id, job.seq);
                if let Err(e) = self.backend.execute(&job) {
                    log::warn!(
                        "backend refused queue {} job {}: {}",
                        job.queue_id,
                        job.seq,
                        e
                    );
                    queue.complete(job.seq, Some(ExecFault::Unknown));
                }
                progress = true;
            }
        }

        // Dispatch may have marked jobs failed; retire them in this pass.
        for queue in &queues {
            for retired in queue.retire() {
                retired.finish();
                progress = true;
            }
        }

        let drained: Vec<u64> = queues
            .iter()
            .filter(|q| q.is_drained())
            .map(|q| q.id())
            .collect();
        if !drained.is_empty() {
            self.queues.lock().retain(|q| !drained.contains(&q.id()));
        }

        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ImmediateBackend, ManualBackend, NullBackend};
    use crate::command::{BlitCommand, Command};
    use crate::queue::{Priority, QueueKind, QueueState, Submission};
    use std::sync::Weak;
    use tessera_core::{GpuAddr, HandleTable, SyncObject};
    use tessera_mem::VmHandle;

    fn queue(priority: u32) -> Arc<Queue> {
        let mut table = HandleTable::new(1);
        let vm = VmHandle::from_raw(table.insert(()).unwrap().to_raw()).unwrap();
        Arc::new(Queue::new(
            1,
            vm,
            1,
            QueueKind::Render,
            Priority::new(priority).unwrap(),
            64,
        ))
    }

    fn submission(waits: Vec<(Weak<SyncObject>, u64)>, signal: &Arc<SyncObject>) -> Submission {
        Submission {
            command: Command::Blit(BlitCommand {
                encoder_ptr: GpuAddr::new(0x20_0000_0000),
                encoder_end: GpuAddr::new(0x20_0000_0100),
                ..Default::default()
            }),
            waits,
            signal: Some(Arc::downgrade(signal)),
            pins: Vec::new(),
            unresolved: None,
        }
    }

    #[test]
    fn test_immediate_runs_everything() {
        let sched = Scheduler::new(Arc::new(ImmediateBackend::new()));
        let q = queue(0);
        sched.register(q.clone());
        let sync = Arc::new(SyncObject::new());
        for _ in 0..3 {
            q.enqueue(submission(Vec::new(), &sync)).unwrap();
        }
        sched.kick();
        assert_eq!(sync.current(), 3);
        assert_eq!(q.inflight(), 0);
    }

    #[test]
    fn test_null_backend_never_signals() {
        let sched = Scheduler::new(Arc::new(NullBackend::new()));
        let q = queue(0);
        sched.register(q.clone());
        let sync = Arc::new(SyncObject::new());
        q.enqueue(submission(Vec::new(), &sync)).unwrap();
        sched.kick();
        assert_eq!(sync.current(), 0);
        assert_eq!(q.inflight(), 1);
    }

    #[test]
    fn test_priority_order() {
        let backend = Arc::new(ManualBackend::new());
        let sched = Scheduler::new(backend.clone());
        let low = queue(3);
        let high = queue(0);
        sched.register(low.clone());
        sched.register(high.clone());
        let sync = Arc::new(SyncObject::new());
        low.enqueue(submission(Vec::new(), &sync)).unwrap();
        high.enqueue(submission(Vec::new(), &sync)).unwrap();
        sched.kick();
        let order: Vec<u64> = backend.running().iter().map(|(q, _)| *q).collect();
        assert_eq!(order, vec![high.id(), low.id()]);
    }

    #[test]
    fn test_cross_queue_dependency() {
        let backend = Arc::new(ManualBackend::new());
        let sched = Scheduler::new(backend.clone());
        let producer = queue(1);
        let consumer = queue(1);
        sched.register(producer.clone());
        sched.register(consumer.clone());

        let produced = Arc::new(SyncObject::new());
        let consumed = Arc::new(SyncObject::new());
        producer.enqueue(submission(Vec::new(), &produced)).unwrap();
        consumer
            .enqueue(submission(vec![(Arc::downgrade(&produced), 0)], &consumed))
            .unwrap();
        sched.kick();
        assert_eq!(backend.running(), vec![(producer.id(), 1)]);

        backend.finish(producer.id(), 1, None);
        sched.kick();
        assert_eq!(produced.current(), 1);
        assert_eq!(backend.running(), vec![(consumer.id(), 1)]);

        backend.finish_all();
        sched.kick();
        assert_eq!(consumed.current(), 1);
    }

    #[test]
    fn test_fault_isolated_to_queue() {
        let backend = Arc::new(ManualBackend::new());
        let sched = Scheduler::new(backend.clone());
        let bad = queue(0);
        let good = queue(0);
        sched.register(bad.clone());
        sched.register(good.clone());
        let sync = Arc::new(SyncObject::new());
        bad.enqueue(submission(Vec::new(), &sync)).unwrap();
        good.enqueue(submission(Vec::new(), &sync)).unwrap();
        sched.kick();

        backend.finish(bad.id(), 1, Some(ExecFault::MmuFault { addr: 0x1000 }));
        backend.finish(good.id(), 1, None);
        sched.kick();
        assert_eq!(bad.state(), QueueState::Faulted);
        assert_eq!(good.state(), QueueState::Active);
        assert_eq!(sync.current(), 2);
        assert_eq!(bad.take_faults().len(), 1);
    }

    #[test]
    fn test_drained_queue_leaves() {
        let sched = Scheduler::new(Arc::new(ImmediateBackend::new()));
        let q = queue(2);
        sched.register(q.clone());
        let sync = Arc::new(SyncObject::new());
        q.enqueue(submission(Vec::new(), &sync)).unwrap();
        q.close();
        sched.kick();
        assert_eq!(sync.current(), 1);
        assert_eq!(sched.queue_count(), 0);
    }
}
