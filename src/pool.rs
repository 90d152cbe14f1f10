//! Bounded pool of mutually exclusive project replicas.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use tracing::{error, warn};

use crate::project::BuildProject;

/// One working copy of the project, exclusive-write while checked out.
pub struct Replica {
    /// The buildable working copy.
    pub project: Box<dyn BuildProject>,
    /// Whether this replica may still run only the tests relevant to a
    /// change. Degrades to `false` on the first test-infrastructure failure
    /// and never upgrades back within a job.
    pub relevant_tests_only: bool,
}

impl Replica {
    fn new(project: Box<dyn BuildProject>) -> Self {
        Self {
            project,
            relevant_tests_only: true,
        }
    }

    /// One-way transition out of relevant-tests-only mode.
    pub fn degrade_to_full_suite(&mut self) {
        if self.relevant_tests_only {
            warn!(
                repo = %self.project.working_dir().display(),
                "selective test execution failed; falling back to full suite for this replica"
            );
            self.relevant_tests_only = false;
        }
    }
}

/// Exclusive handle on one replica; releasing is the guard drop, so release
/// happens on every exit path.
pub struct ReplicaGuard<'a> {
    guard: MutexGuard<'a, Replica>,
}

impl Deref for ReplicaGuard<'_> {
    type Target = Replica;

    fn deref(&self) -> &Replica {
        &self.guard
    }
}

impl DerefMut for ReplicaGuard<'_> {
    fn deref_mut(&mut self) -> &mut Replica {
        &mut self.guard
    }
}

/// Fixed set of replicas, slot 0 being the base project.
pub struct ReplicaPool {
    slots: Vec<Mutex<Replica>>,
}

fn slot_mut(slot: &mut Mutex<Replica>) -> &mut Replica {
    // A poisoned slot still owns a usable working copy.
    match slot.get_mut() {
        Ok(replica) => replica,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ReplicaPool {
    /// Seed the pool with the base project.
    pub fn new(base: Box<dyn BuildProject>) -> Self {
        Self {
            slots: vec![Mutex::new(Replica::new(base))],
        }
    }

    /// Number of replicas, base included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the pool holds no replica at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Replicate the base project until `target` slots exist. One failed
    /// replication stops further creation: the pool simply ends up smaller
    /// and achievable parallelism degrades to whatever succeeded.
    pub fn grow_to(&mut self, target: usize) -> usize {
        while self.slots.len() < target {
            let index = self.slots.len();
            let replica = slot_mut(&mut self.slots[0]).project.replicate(index);
            match replica {
                Ok(project) => self.slots.push(Mutex::new(Replica::new(project))),
                Err(err) => {
                    error!(%err, index, "could not create project replica");
                    break;
                }
            }
        }
        self.slots.len()
    }

    /// Single non-blocking scan for a free replica. No fairness, no queueing;
    /// the caller decides whether to spin or idle. Mutual exclusion is
    /// guaranteed by the per-slot mutex.
    pub fn acquire_any(&self) -> Option<ReplicaGuard<'_>> {
        for slot in &self.slots {
            match slot.try_lock() {
                Ok(guard) => return Some(ReplicaGuard { guard }),
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(poisoned)) => {
                    return Some(ReplicaGuard {
                        guard: poisoned.into_inner(),
                    });
                }
            }
        }
        None
    }

    /// Busy retry with a brief sleep until a replica is free.
    pub fn acquire_any_spin(&self) -> ReplicaGuard<'_> {
        loop {
            if let Some(guard) = self.acquire_any() {
                return guard;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Remove every replica's working directory, keeping the base project's
    /// when asked.
    pub fn dispose_all(&mut self, keep_base: bool) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if index == 0 && keep_base {
                continue;
            }
            let replica = slot_mut(slot);
            if let Err(err) = replica.project.remove() {
                warn!(%err, "failed to remove replica working directory");
            }
        }
    }
}
