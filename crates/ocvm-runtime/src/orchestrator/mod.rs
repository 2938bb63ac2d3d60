//! Compile orchestration
//!
//! Decides when bytecode gets compiled and applies the results to the code
//! cache. Both entry points share one state machine:
//!
//! - `get_descriptor_for_code` never blocks on a compile. A miss starts a
//!   compile (or queues one when every slot is busy) and reports `NotReady`.
//! - `get_descriptor_for_code_sync` blocks until the descriptor is cached
//!   or the compile has failed.
//!
//! At most one compile is outstanding per `CodeTuple`. Each compile runs on
//! its own job thread, which pushes the outcome into a completion queue
//! drained by a single reply thread; that thread owns every cache insert.
//!
//! Lock order: `state` before `cache`.

mod backend;

pub use backend::{CompileBackend, InProcessBackend, ProcessBackend};

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use ocvm_engine::{CodeDescriptor, CodeTuple, CompiledModule, ContentHash, WasmLimits};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cache::{CodeCache, Inserted};
use crate::error::{CacheError, OrchestratorError};
use crate::ipc::{CompileOutcome, CompileResult, EvictionNotice, Message};

/// Answer to a non-blocking descriptor request
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Cached; the handle pins the entry while held
    Ready(Arc<CodeDescriptor>),
    /// A compile is pending; ask again later
    NotReady,
    /// A previous compile failed; the code cannot be run natively
    Unavailable,
}

/// Counters since the orchestrator started
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Descriptor requests received
    pub requests: u64,
    /// Requests answered from the cache
    pub cache_hits: u64,
    /// Compiles handed to the backend
    pub compiles_started: u64,
    /// Compiles that ended up in the cache
    pub compiled: u64,
    /// Compiles that failed and were blacklisted
    pub failed: u64,
    /// Results discarded because the code was freed mid-compile
    pub poisoned: u64,
    /// Results that did not fit in the cache
    pub cache_too_full: u64,
    /// Compiles running now
    pub in_flight: usize,
    /// Compiles waiting for a slot
    pub queued: usize,
    /// Blacklisted tuples
    pub blacklisted: usize,
    /// Callers blocked in `get_descriptor_for_code_sync`
    pub waiting: usize,
}

#[derive(Debug, Default)]
struct InFlight {
    poisoned: bool,
}

#[derive(Default)]
struct State {
    in_flight: FxHashMap<CodeTuple, InFlight>,
    queue: VecDeque<(CodeTuple, Arc<[u8]>)>,
    queued: FxHashSet<CodeTuple>,
    blacklist: FxHashMap<CodeTuple, String>,
    /// Tuples whose latest compile did not fit in the cache
    too_full: FxHashSet<CodeTuple>,
    waiting: usize,
    stats: OrchestratorStats,
    stopped: bool,
}

struct Completion {
    tuple: CodeTuple,
    result: Result<CompiledModule, OrchestratorError>,
}

enum Event {
    Done(Completion),
    Shutdown,
}

struct Shared {
    cache: Arc<Mutex<CodeCache>>,
    backend: Arc<dyn CompileBackend>,
    limits: WasmLimits,
    max_in_flight: usize,
    state: Mutex<State>,
    /// Signalled after every completion and at shutdown
    settled: Condvar,
    events: Sender<Event>,
    subscribers: Mutex<Vec<Sender<Message>>>,
}

/// Schedules compiles and feeds the code cache
pub struct CompileOrchestrator {
    shared: Arc<Shared>,
    reply_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CompileOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileOrchestrator")
            .field("backend", &self.shared.backend.name())
            .field("max_in_flight", &self.shared.max_in_flight)
            .finish()
    }
}

impl CompileOrchestrator {
    /// Start the reply thread; at most `max_in_flight` compiles run at once
    pub fn new(
        cache: Arc<Mutex<CodeCache>>,
        backend: Arc<dyn CompileBackend>,
        max_in_flight: usize,
        limits: WasmLimits,
    ) -> Result<Self, OrchestratorError> {
        let (events, completions) = unbounded();
        let shared = Arc::new(Shared {
            cache,
            backend,
            limits,
            max_in_flight: max_in_flight.max(1),
            state: Mutex::new(State::default()),
            settled: Condvar::new(),
            events,
            subscribers: Mutex::new(Vec::new()),
        });

        let reply_shared = Arc::clone(&shared);
        let reply_thread = thread::Builder::new()
            .name("ocvm-compile-reply".to_string())
            .spawn(move || reply_loop(reply_shared, completions))
            .map_err(|e| OrchestratorError::Worker(format!("Failed to start reply thread: {}", e)))?;

        log::info!(
            "Compile orchestrator started ({} backend, {} slots)",
            shared.backend.name(),
            shared.max_in_flight
        );
        Ok(CompileOrchestrator { shared, reply_thread: Some(reply_thread) })
    }

    /// Descriptor for `tuple`, starting a compile of `bytecode` on a miss
    ///
    /// Requesting a tuple whose compile was poisoned by `free_code` revives
    /// it, so this caller still gets the fresh result.
    pub fn get_descriptor_for_code(&self, tuple: CodeTuple, bytecode: &[u8]) -> Result<Lookup, OrchestratorError> {
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            state.stats.requests += 1;
            if let Some(found) = shared.lookup(&mut state, &tuple)? {
                return Ok(found);
            }
        }

        verify_hash(tuple, bytecode)?;

        let mut state = shared.state.lock();
        if let Some(found) = shared.lookup(&mut state, &tuple)? {
            return Ok(found);
        }
        shared.submit(&mut state, tuple, bytecode)?;
        Ok(Lookup::NotReady)
    }

    /// Descriptor for `tuple`, compiling `bytecode` and waiting if needed
    pub fn get_descriptor_for_code_sync(
        &self,
        tuple: CodeTuple,
        bytecode: &[u8],
    ) -> Result<Arc<CodeDescriptor>, OrchestratorError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.stats.requests += 1;
        let mut submitted = false;
        let mut joined = false;
        let mut verified = false;

        loop {
            if state.stopped {
                return Err(OrchestratorError::ShutDown);
            }
            if let Some(message) = state.blacklist.get(&tuple) {
                return Err(if submitted || joined {
                    OrchestratorError::CompileFailed { tuple, message: message.clone() }
                } else {
                    OrchestratorError::Blacklisted(tuple)
                });
            }
            if let Some(descriptor) = shared.cache.lock().get(&tuple) {
                if !submitted {
                    state.stats.cache_hits += 1;
                }
                return Ok(descriptor);
            }
            if let Some(job) = state.in_flight.get_mut(&tuple) {
                job.poisoned = false;
                joined = true;
                shared.wait(&mut state);
                continue;
            }
            if state.queued.contains(&tuple) {
                joined = true;
                shared.wait(&mut state);
                continue;
            }
            // The compile this caller waited for did not fit
            if (submitted || joined) && state.too_full.contains(&tuple) {
                return Err(OrchestratorError::CacheTooFull(tuple));
            }
            if !verified {
                MutexGuard::unlocked(&mut state, || verify_hash(tuple, bytecode))?;
                verified = true;
                continue;
            }
            shared.submit(&mut state, tuple, bytecode)?;
            submitted = true;
        }
    }

    /// Drop everything known about `tuple`
    ///
    /// An in-flight compile is poisoned (its result is discarded unless the
    /// tuple is requested again first), a queued one is dropped, and a
    /// cached entry is evicted. Returns whether anything was affected.
    pub fn free_code(&self, tuple: &CodeTuple) -> bool {
        let shared = &self.shared;
        let mut affected = false;
        let evicted = {
            let mut state = shared.state.lock();
            if let Some(job) = state.in_flight.get_mut(tuple) {
                job.poisoned = true;
                affected = true;
                log::debug!("Poisoned in-flight compile of {}", tuple);
            }
            if state.queued.remove(tuple) {
                state.queue.retain(|(queued, _)| queued != tuple);
                affected = true;
            }
            shared.cache.lock().evict(tuple)
        };
        if evicted {
            shared.publish(vec![Message::EvictionNotice(EvictionNotice { tuples: vec![*tuple] })]);
        }
        affected || evicted
    }

    /// Forget a failed compile so the tuple may be compiled again
    pub fn clear_blacklist(&self, tuple: &CodeTuple) -> bool {
        self.shared.state.lock().blacklist.remove(tuple).is_some()
    }

    /// Receive every `CompileResult` and `EvictionNotice` from now on
    pub fn subscribe(&self) -> Receiver<Message> {
        let (sender, receiver) = unbounded();
        self.shared.subscribers.lock().push(sender);
        receiver
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> OrchestratorStats {
        let state = self.shared.state.lock();
        OrchestratorStats {
            in_flight: state.in_flight.len(),
            queued: state.queue.len(),
            blacklisted: state.blacklist.len(),
            waiting: state.waiting,
            ..state.stats.clone()
        }
    }

    /// Stop accepting requests, drop queued compiles, and wait for
    /// in-flight ones to be applied
    pub fn shutdown(&mut self) {
        let Some(reply_thread) = self.reply_thread.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.queue.clear();
            state.queued.clear();
        }
        self.shared.settled.notify_all();
        if self.shared.events.send(Event::Shutdown).is_err() {
            log::warn!("Compile reply thread already gone");
        }
        if reply_thread.join().is_err() {
            log::error!("Compile reply thread panicked");
        }
        log::info!("Compile orchestrator stopped");
    }
}

impl Drop for CompileOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Answer a request without compiling, if possible
    fn lookup(&self, state: &mut State, tuple: &CodeTuple) -> Result<Option<Lookup>, OrchestratorError> {
        if state.stopped {
            return Err(OrchestratorError::ShutDown);
        }
        if state.blacklist.contains_key(tuple) {
            return Ok(Some(Lookup::Unavailable));
        }
        if let Some(descriptor) = self.cache.lock().get(tuple) {
            state.stats.cache_hits += 1;
            return Ok(Some(Lookup::Ready(descriptor)));
        }
        if let Some(job) = state.in_flight.get_mut(tuple) {
            if job.poisoned {
                log::debug!("Reviving poisoned compile of {}", tuple);
                job.poisoned = false;
            }
            return Ok(Some(Lookup::NotReady));
        }
        if state.queued.contains(tuple) {
            return Ok(Some(Lookup::NotReady));
        }
        Ok(None)
    }

    /// Block until the next completion or shutdown
    fn wait(&self, state: &mut MutexGuard<'_, State>) {
        state.waiting += 1;
        self.settled.wait(state);
        state.waiting -= 1;
    }

    /// Start a compile now, or queue it if every slot is busy
    fn submit(&self, state: &mut State, tuple: CodeTuple, bytecode: &[u8]) -> Result<(), OrchestratorError> {
        state.too_full.remove(&tuple);
        let bytecode: Arc<[u8]> = Arc::from(bytecode);
        if state.in_flight.len() < self.max_in_flight {
            self.launch(state, tuple, bytecode)
        } else {
            log::debug!("Queueing compile of {} ({} waiting)", tuple, state.queue.len() + 1);
            state.queue.push_back((tuple, bytecode));
            state.queued.insert(tuple);
            Ok(())
        }
    }

    fn launch(&self, state: &mut State, tuple: CodeTuple, bytecode: Arc<[u8]>) -> Result<(), OrchestratorError> {
        let backend = Arc::clone(&self.backend);
        let limits = self.limits.clone();
        let events = self.events.clone();

        let spawned = thread::Builder::new()
            .name(format!("ocvm-compile-{}", &tuple.code_hash.to_hex()[..8]))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| backend.compile(tuple, &bytecode, &limits)))
                    .unwrap_or_else(|payload| Err(OrchestratorError::Worker(panic_message(payload.as_ref()))));
                if events.send(Event::Done(Completion { tuple, result })).is_err() {
                    log::warn!("Dropping compile result for {}: reply thread gone", tuple);
                }
            });
        if let Err(e) = spawned {
            return Err(OrchestratorError::Worker(format!("Failed to start compile job: {}", e)));
        }

        state.in_flight.insert(tuple, InFlight::default());
        state.stats.compiles_started += 1;
        log::debug!("Compiling {} ({} in flight)", tuple, state.in_flight.len());
        Ok(())
    }

    /// Apply one compile result, then start queued compiles
    fn complete(&self, completion: Completion) {
        let Completion { tuple, result } = completion;
        let mut notices = Vec::new();
        let mut state = self.state.lock();
        let poisoned = state.in_flight.remove(&tuple).is_some_and(|job| job.poisoned);

        if poisoned {
            state.stats.poisoned += 1;
            log::debug!("Discarding poisoned compile of {}", tuple);
        } else {
            match result {
                Ok(compiled) => self.insert(&mut state, tuple, &compiled, &mut notices),
                Err(e) => {
                    let free = self.cache.lock().free_bytes();
                    blacklist(&mut state, tuple, e.to_string());
                    notices.push(result_message(tuple, CompileOutcome::UnknownFailure, free));
                }
            }
        }

        while !state.stopped && state.in_flight.len() < self.max_in_flight {
            let Some((next, bytecode)) = state.queue.pop_front() else {
                break;
            };
            state.queued.remove(&next);
            if let Err(e) = self.launch(&mut state, next, bytecode) {
                blacklist(&mut state, next, e.to_string());
            }
        }

        drop(state);
        self.settled.notify_all();
        self.publish(notices);
    }

    fn insert(&self, state: &mut State, tuple: CodeTuple, compiled: &CompiledModule, notices: &mut Vec<Message>) {
        let mut cache = self.cache.lock();
        let inserted = cache.insert(tuple, compiled);
        let free = cache.free_bytes();
        let stranded = if inserted.is_err() { cache.take_evicted() } else { Vec::new() };
        drop(cache);

        match inserted {
            Ok(Inserted { descriptor, evicted }) => {
                state.stats.compiled += 1;
                state.too_full.remove(&tuple);
                log::info!("Compiled {} ({} bytes of code)", tuple, descriptor.code_size);
                if !evicted.is_empty() {
                    notices.push(Message::EvictionNotice(EvictionNotice { tuples: evicted }));
                }
                notices.push(result_message(tuple, CompileOutcome::Ready((*descriptor).clone()), free));
            }
            Err(CacheError::TooFull { size, capacity }) => {
                state.stats.cache_too_full += 1;
                state.too_full.insert(tuple);
                log::warn!("No cache room for {} ({} bytes, capacity {})", tuple, size, capacity);
                if !stranded.is_empty() {
                    notices.push(Message::EvictionNotice(EvictionNotice { tuples: stranded }));
                }
                notices.push(result_message(tuple, CompileOutcome::CacheTooFull, free));
            }
            Err(e) => {
                blacklist(state, tuple, e.to_string());
                if !stranded.is_empty() {
                    notices.push(Message::EvictionNotice(EvictionNotice { tuples: stranded }));
                }
                notices.push(result_message(tuple, CompileOutcome::UnknownFailure, free));
            }
        }
    }

    fn publish(&self, notices: Vec<Message>) {
        if notices.is_empty() {
            return;
        }
        self.subscribers
            .lock()
            .retain(|subscriber| notices.iter().all(|notice| subscriber.send(notice.clone()).is_ok()));
    }
}

fn reply_loop(shared: Arc<Shared>, completions: Receiver<Event>) {
    let mut stopping = false;
    loop {
        if stopping && shared.state.lock().in_flight.is_empty() {
            break;
        }
        let Ok(event) = completions.recv() else {
            break;
        };
        match event {
            Event::Done(completion) => shared.complete(completion),
            Event::Shutdown => stopping = true,
        }
    }
}

fn blacklist(state: &mut State, tuple: CodeTuple, message: String) {
    log::warn!("Blacklisting {}: {}", tuple, message);
    state.stats.failed += 1;
    state.blacklist.insert(tuple, message);
}

fn result_message(tuple: CodeTuple, result: CompileOutcome, cache_free_bytes: u64) -> Message {
    Message::CompileResult(CompileResult { tuple, result, cache_free_bytes })
}

fn verify_hash(tuple: CodeTuple, bytecode: &[u8]) -> Result<(), OrchestratorError> {
    if ContentHash::of(bytecode) != tuple.code_hash {
        return Err(OrchestratorError::HashMismatch(tuple));
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("compile panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("compile panicked: {}", s)
    } else {
        "compile panicked".to_string()
    }
}
