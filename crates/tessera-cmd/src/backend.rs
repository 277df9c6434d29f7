//! # Execution Backends
//!
//! Boundary between the scheduler and whatever actually runs jobs: firmware
//! rings on hardware, or a stand-in for headless use.
//!
//! A backend receives dispatched jobs through [`ExecutionBackend::execute`]
//! and reports finished ones through [`ExecutionBackend::poll_completions`].
//! Every accepted job must eventually complete, faulted or not, or the
//! sync objects it signals never advance.

use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex;
use tessera_core::{ExecFault, Result};

use crate::command::Command;
use crate::queue::QueueKind;

/// A job handed to the backend
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Device-unique queue id
    pub queue_id: u64,
    /// Queue kind
    pub kind: QueueKind,
    /// Queue priority
    pub priority: u8,
    /// MMU context of the queue's address space
    pub context_id: u64,
    /// Sequence number within the queue
    pub seq: u64,
    /// Command payload
    pub command: Arc<Command>,
}

/// A finished job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Queue id
    pub queue_id: u64,
    /// Sequence number
    pub seq: u64,
    /// Failure, if the job did not run cleanly
    pub fault: Option<ExecFault>,
}

// =============================================================================
// BACKEND TRAIT
// =============================================================================

/// Job execution collaborator
pub trait ExecutionBackend: Send + Sync + fmt::Debug {
    /// Start executing `job`
    ///
    /// `Err` means the job could not be started; the scheduler then faults it.
    fn execute(&self, job: &JobDescriptor) -> Result<()>;

    /// Drain completions reported since the last poll
    fn poll_completions(&self) -> Vec<Completion>;
}

// =============================================================================
// NULL BACKEND
// =============================================================================

/// Accepts jobs and never completes them
#[derive(Debug, Default)]
pub struct NullBackend;

impl NullBackend {
    /// Create a null backend
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionBackend for NullBackend {
    fn execute(&self, _job: &JobDescriptor) -> Result<()> {
        Ok(())
    }

    fn poll_completions(&self) -> Vec<Completion> {
        Vec::new()
    }
}

// =============================================================================
// IMMEDIATE BACKEND
// =============================================================================

/// Completes every job as soon as it is dispatched
#[derive(Debug, Default)]
pub struct ImmediateBackend {
    completed: Mutex<VecDeque<Completion>>,
}

impl ImmediateBackend {
    /// Create an immediate backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionBackend for ImmediateBackend {
    fn execute(&self, job: &JobDescriptor) -> Result<()> {
        self.completed.lock().push_back(Completion {
            queue_id: job.queue_id,
            seq: job.seq,
            fault: None,
        });
        Ok(())
    }

    fn poll_completions(&self) -> Vec<Completion> {
        self.completed.lock().drain(..).collect()
    }
}

// =============================================================================
// MANUAL BACKEND
// =============================================================================

/// Holds dispatched jobs until told to complete or fault them
///
/// Used to drive execution step by step from a harness.
#[derive(Debug, Default)]
pub struct ManualBackend {
    running: Mutex<Vec<JobDescriptor>>,
    completed: Mutex<VecDeque<Completion>>,
}

impl ManualBackend {
    /// Create a manual backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs dispatched and not yet finished, in dispatch order
    pub fn running(&self) -> Vec<(u64, u64)> {
        self.running
            .lock()
            .iter()
            .map(|j| (j.queue_id, j.seq))
            .collect()
    }

    /// Finish a running job
    ///
    /// Returns `false` if no such job is running.
    pub fn finish(&self, queue_id: u64, seq: u64, fault: Option<ExecFault>) -> bool {
        let mut running = self.running.lock();
        let Some(pos) = running
            .iter()
            .position(|j| j.queue_id == queue_id && j.seq == seq)
        else {
            return false;
        };
        running.remove(pos);
        drop(running);
        self.completed.lock().push_back(Completion {
            queue_id,
            seq,
            fault,
        });
        true
    }

    /// Finish every running job cleanly
    pub fn finish_all(&self) -> usize {
        let jobs: Vec<JobDescriptor> = self.running.lock().drain(..).collect();
        let mut completed = self.completed.lock();
        for job in &jobs {
            completed.push_back(Completion {
                queue_id: job.queue_id,
                seq: job.seq,
                fault: None,
            });
        }
        jobs.len()
    }
}

impl ExecutionBackend for ManualBackend {
    fn execute(&self, job: &JobDescriptor) -> Result<()> {
        self.running.lock().push(job.clone());
        Ok(())
    }

    fn poll_completions(&self) -> Vec<Completion> {
        self.completed.lock().drain(..).collect()
    }
}
