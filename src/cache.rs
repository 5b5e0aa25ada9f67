// Single-flight memoization of generated artifacts. The cache maps a UnitId to a slot
// holding one of four states: Unresolved, InProgress, Ready or Failed. The first caller to
// find a slot Unresolved claims it (the transition to InProgress happens while the map
// lock is held), releases every lock and runs the generator. Everyone else who arrives
// while the slot is InProgress parks on the slot's Condvar until the claimant publishes a
// terminal state, then clones that result. Ready and Failed are permanent: a failed unit
// is not retried, and every later caller sees the same error.
//
// Locking: the map Mutex is held only to find or insert a slot and to make the claim; the
// slot Mutex guards the state. Lock order is always map then slot. Generators for
// different units never contend on anything but the brief map lookup.
//
// If a generator panics, a drop guard in the claimant marks the slot
// Failed(GeneratorPanicked) and wakes the waiters before the panic continues to unwind.

//! Single-flight artifact cache.

use crate::codegen::CodeArtifact;
use crate::core::{CompilationUnit, GenerationError, UnitId};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("gave up after {waited:?} waiting for {unit}")]
    Timeout { unit: UnitId, waited: Duration },
}

/// Snapshot of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    Unresolved,
    InProgress,
    Ready,
    Failed(GenerationError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Generator invocations.
    pub generations: u64,
    /// Requests answered from a terminal entry without waiting.
    pub hits: u64,
    /// Requests that parked behind an in-flight generation.
    pub waits: u64,
    pub failures: u64,
}

enum SlotState {
    Unresolved,
    InProgress,
    Ready(CodeArtifact),
    Failed(GenerationError),
}

impl SlotState {
    fn terminal(&self) -> Option<Result<CodeArtifact, GenerationError>> {
        match self {
            SlotState::Ready(artifact) => Some(Ok(artifact.clone())),
            SlotState::Failed(err) => Some(Err(err.clone())),
            SlotState::Unresolved | SlotState::InProgress => None,
        }
    }
}

struct Slot {
    state: Mutex<SlotState>,
    settled: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Unresolved),
            settled: Condvar::new(),
        }
    }

    fn publish(&self, result: Result<CodeArtifact, GenerationError>) {
        let mut state = lock(&self.state);
        *state = match result {
            Ok(artifact) => SlotState::Ready(artifact),
            Err(err) => SlotState::Failed(err),
        };
        drop(state);
        self.settled.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Counters {
    generations: AtomicU64,
    hits: AtomicU64,
    waits: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marks the claimed slot failed if the generator unwinds.
struct ClaimGuard<'a> {
    slot: &'a Slot,
    unit: &'a UnitId,
    counters: &'a Counters,
    published: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.published {
            log::error!("generator for {} panicked; marking it failed", self.unit);
            Counters::bump(&self.counters.failures);
            self.slot.publish(Err(GenerationError::GeneratorPanicked {
                unit: self.unit.clone(),
            }));
        }
    }
}

enum Acquired {
    Done(Result<CodeArtifact, GenerationError>),
    Claimed(Arc<Slot>),
    Waiting(Arc<Slot>),
}

#[derive(Default)]
pub struct ArtifactCache {
    slots: Mutex<HashMap<UnitId, Arc<Slot>>>,
    counters: Counters,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized artifact for `unit`, running `generate` at most once
    /// per identity. Concurrent callers wait for the single in-flight run.
    pub fn get_or_generate<F>(
        &self,
        unit: &CompilationUnit,
        generate: F,
    ) -> Result<CodeArtifact, GenerationError>
    where
        F: FnOnce(&CompilationUnit) -> Result<CodeArtifact, GenerationError>,
    {
        let slot = match self.acquire(unit.id()) {
            Acquired::Done(result) => return result,
            Acquired::Claimed(slot) => return self.run_claimed(&slot, unit, generate),
            Acquired::Waiting(slot) => slot,
        };

        let mut state = lock(&slot.state);
        loop {
            if let Some(result) = state.terminal() {
                return result;
            }
            state = slot
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`get_or_generate`](Self::get_or_generate), but a caller that has
    /// to wait for someone else's generation gives up after `timeout`. The
    /// in-flight generation is not affected.
    pub fn get_or_generate_timeout<F>(
        &self,
        unit: &CompilationUnit,
        generate: F,
        timeout: Duration,
    ) -> Result<CodeArtifact, CacheError>
    where
        F: FnOnce(&CompilationUnit) -> Result<CodeArtifact, GenerationError>,
    {
        let slot = match self.acquire(unit.id()) {
            Acquired::Done(result) => return Ok(result?),
            Acquired::Claimed(slot) => return Ok(self.run_claimed(&slot, unit, generate)?),
            Acquired::Waiting(slot) => slot,
        };

        let mut state = lock(&slot.state);
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            loop {
                if let Some(result) = state.terminal() {
                    return Ok(result?);
                }
                state = slot
                    .settled
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        loop {
            if let Some(result) = state.terminal() {
                return Ok(result?);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!("timed out after {:?} waiting for {}", timeout, unit.id());
                return Err(CacheError::Timeout {
                    unit: unit.id().clone(),
                    waited: timeout,
                });
            }
            let (guard, _) = slot
                .settled
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Find or create the slot and decide who generates.
    fn acquire(&self, id: &UnitId) -> Acquired {
        let mut slots = lock(&self.slots);
        let slot = slots
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();

        let mut state = lock(&slot.state);
        if let Some(result) = state.terminal() {
            Counters::bump(&self.counters.hits);
            return Acquired::Done(result);
        }
        let claimed = matches!(*state, SlotState::Unresolved);
        if claimed {
            *state = SlotState::InProgress;
        } else {
            Counters::bump(&self.counters.waits);
            log::trace!("waiting for in-flight generation of {}", id);
        }
        drop(state);
        drop(slots);

        if claimed {
            Acquired::Claimed(slot)
        } else {
            Acquired::Waiting(slot)
        }
    }

    fn run_claimed<F>(
        &self,
        slot: &Slot,
        unit: &CompilationUnit,
        generate: F,
    ) -> Result<CodeArtifact, GenerationError>
    where
        F: FnOnce(&CompilationUnit) -> Result<CodeArtifact, GenerationError>,
    {
        Counters::bump(&self.counters.generations);
        log::debug!("generating {}", unit.id());

        let mut guard = ClaimGuard {
            slot,
            unit: unit.id(),
            counters: &self.counters,
            published: false,
        };
        let result = generate(unit);
        if result.is_err() {
            Counters::bump(&self.counters.failures);
        }
        slot.publish(result.clone());
        guard.published = true;
        result
    }

    pub fn state(&self, id: &UnitId) -> CacheState {
        let slot = match lock(&self.slots).get(id) {
            Some(slot) => slot.clone(),
            None => return CacheState::Unresolved,
        };
        let state = lock(&slot.state);
        match &*state {
            SlotState::Unresolved => CacheState::Unresolved,
            SlotState::InProgress => CacheState::InProgress,
            SlotState::Ready(_) => CacheState::Ready,
            SlotState::Failed(err) => CacheState::Failed(err.clone()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            generations: self.counters.generations.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Number of identities ever requested.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{CodeGenerator, DynamicGenerator};

    fn unit(name: &str) -> CompilationUnit {
        CompilationUnit::from_source(name, "one() {\nentry:\n  %r = const 1\n  ret %r\n}\n").unwrap()
    }

    #[test]
    fn test_second_request_is_a_hit() {
        let cache = ArtifactCache::new();
        let unit = unit("Foo");
        assert_eq!(cache.state(unit.id()), CacheState::Unresolved);

        let first = cache
            .get_or_generate(&unit, |u| DynamicGenerator::new().generate(u))
            .unwrap();
        let second = cache
            .get_or_generate(&unit, |_| panic!("generator must not run twice"))
            .unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(cache.state(unit.id()), CacheState::Ready);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                generations: 1,
                hits: 1,
                waits: 0,
                failures: 0
            }
        );
    }

    #[test]
    fn test_failure_is_permanent() {
        let cache = ArtifactCache::new();
        let unit = unit("Foo");
        let err = GenerationError::MissingPrecompiledArtifact {
            unit: unit.id().clone(),
        };

        let first = cache.get_or_generate(&unit, |_| Err(err.clone()));
        let second = cache.get_or_generate(&unit, |u| DynamicGenerator::new().generate(u));
        assert_eq!(first.unwrap_err(), err);
        assert_eq!(second.unwrap_err(), err);
        assert_eq!(cache.state(unit.id()), CacheState::Failed(err));
        assert_eq!(cache.stats().failures, 1);
    }

    #[test]
    fn test_units_are_independent() {
        let cache = ArtifactCache::new();
        let a = unit("A");
        let b = unit("B");
        assert!(cache.get_or_generate(&a, |u| DynamicGenerator::new().generate(u)).is_ok());
        assert_eq!(cache.state(b.id()), CacheState::Unresolved);
        assert!(cache.get_or_generate(&b, |u| DynamicGenerator::new().generate(u)).is_ok());
        assert_eq!(cache.stats().generations, 2);
    }

    #[test]
    fn test_timeout_variant_for_claimant() {
        let cache = ArtifactCache::new();
        let unit = unit("Foo");
        let artifact = cache
            .get_or_generate_timeout(&unit, |u| DynamicGenerator::new().generate(u), Duration::ZERO)
            .unwrap();
        assert_eq!(artifact.unit(), unit.id());
    }
}
