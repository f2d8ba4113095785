//! The dispatch loop.
//!
//! The executor owns the tasks, the live trace index and the code cache.
//! Each dispatch looks up `(PC, CodeVersion)`; a hit calls straight into
//! compiled code, a miss decodes on this thread, hands the batch to the
//! lifter pool and parks the task until the translation lands. Only the
//! final insertion into the live index happens on the dispatch thread, so
//! compiled code is immutable once any task can reach it.

use crate::code_cache::{CodeCache, IndexRecord};
use crate::coroutine::{Coroutine, DEFAULT_STACK_SIZE};
use crate::lifter::{LiftedFunction, Lifter, LifterPool, LiftResponse};
use crate::memory::AddressSpaceSharedPtr;
use crate::runtime::{coroutine_idle, intrinsic_symbols, Runtime};
use crate::task::{Task, TaskSharedPtr, TaskStatus};
use crate::trace::{decode_traces, LiveTraceId, TraceId};
use crate::workspace::Workspace;
use crate::guest_ptr::GuestPc;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::os::raw::c_void;
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

/// In-memory dispatch table: `(PC, CodeVersion) -> host function`.
pub struct LiveTraceIndex {
    map: HashMap<LiveTraceId, LiftedFunction>,
}

impl LiveTraceIndex {
    pub fn new() -> LiveTraceIndex {
        LiveTraceIndex {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: LiveTraceId, func: LiftedFunction) {
        debug!("live trace {}", id);
        self.map.insert(id, func);
    }

    pub fn get(&self, id: &LiveTraceId) -> Option<LiftedFunction> {
        self.map.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

struct InitialTask {
    state: Vec<u8>,
    pc: GuestPc,
    memory: AddressSpaceSharedPtr,
}

pub struct Executor {
    live_traces: LiveTraceIndex,
    cache: CodeCache,
    pool: LifterPool,
    lifter: Arc<dyn Lifter>,
    tasks: Vec<TaskSharedPtr>,
    initial_tasks: Vec<InitialTask>,
    /// Dispatch keys whose translation is in flight on the pool.
    pending: HashSet<LiveTraceId>,
    /// Tasks parked on a key that no completed lift satisfied; handed to the
    /// runtime's error intrinsic on the next pump.
    failed: Vec<TaskSharedPtr>,
    /// Index records already on disk, so re-installs do not duplicate lines.
    seen_records: HashSet<IndexRecord>,
    /// Live keys earlier runs recorded per trace; installed as aliases as
    /// soon as the trace is compiled once.
    persisted: HashMap<TraceId, Vec<LiveTraceId>>,
    lift_failed: bool,
}

impl Executor {
    pub fn new(workspace: &Workspace, lifter: Arc<dyn Lifter>) -> Executor {
        let cache = CodeCache::new(workspace, intrinsic_symbols());
        let mut seen_records = HashSet::new();
        let mut persisted: HashMap<TraceId, Vec<LiveTraceId>> = HashMap::new();
        for record in cache.load_index() {
            persisted.entry(record.trace).or_default().push(record.live);
            seen_records.insert(record);
        }
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Executor {
            live_traces: LiveTraceIndex::new(),
            cache,
            pool: LifterPool::new(lifter.clone(), workers),
            lifter,
            tasks: Vec::new(),
            initial_tasks: Vec::new(),
            pending: HashSet::new(),
            failed: Vec::new(),
            seen_records,
            persisted,
            lift_failed: false,
        }
    }

    pub fn add_initial_task(&mut self, state: Vec<u8>, pc: GuestPc, memory: AddressSpaceSharedPtr) {
        self.initial_tasks.push(InitialTask { state, pc, memory });
    }

    /// Drive the runtime lifecycle: init, create the initial tasks, resume
    /// until every task exits, fini. Returns the process exit code.
    pub fn run(&mut self, runtime: &mut dyn Runtime) -> i32 {
        runtime.init();
        let initial = mem::replace(&mut self.initial_tasks, Vec::new());
        for spec in initial {
            debug!("creating initial task at {}", spec.pc);
            let task = Rc::new(RefCell::new(Task::new(&spec.state, spec.pc, spec.memory)));
            match Coroutine::new(DEFAULT_STACK_SIZE, coroutine_idle, ptr::null_mut()) {
                Ok(coroutine) => task.borrow_mut().coroutine = Some(coroutine),
                Err(err) => warn!("could not allocate a coroutine stack: {}", err),
            }
            runtime.create_task(&task);
            self.tasks.push(task);
        }
        runtime.resume(self);
        runtime.fini();
        if self.lift_failed {
            1
        } else {
            0
        }
    }

    pub fn tasks(&self) -> &[TaskSharedPtr] {
        &self.tasks
    }

    pub fn runnable_tasks(&self) -> Vec<TaskSharedPtr> {
        self.tasks
            .iter()
            .filter(|t| t.borrow().is_runnable())
            .cloned()
            .collect()
    }

    pub fn has_pending_lifts(&self) -> bool {
        !self.pending.is_empty() || !self.failed.is_empty()
    }

    pub fn live_trace_count(&self) -> usize {
        self.live_traces.len()
    }

    /// The dispatch primitive. A hit returns the compiled function; a miss
    /// decodes from the task's PC, submits the batch for lifting, parks the
    /// task and returns `None`.
    pub fn find_lifted_function_for_task(&mut self, task: &TaskSharedPtr) -> Option<LiftedFunction> {
        let (pc, memory) = {
            let t = task.borrow();
            (t.pc, t.memory.clone())
        };
        let version = memory.borrow().compute_code_version(pc);
        let key = LiveTraceId { pc, version };

        if let Some(func) = self.live_traces.get(&key) {
            return Some(func);
        }
        if self.pending.contains(&key) {
            park(task, key);
            return None;
        }

        debug!("dispatch miss for {}", key);
        let traces = decode_traces(self.lifter.as_ref(), &memory.borrow(), pc);
        if traces.is_empty() {
            // The PC was already decoded under this version and no
            // translation materialised: nothing left to try.
            park(task, key);
            self.failed.push(task.clone());
            return None;
        }
        for trace in &traces {
            self.pending.insert(LiveTraceId {
                pc: trace.entry_pc,
                version: trace.version,
            });
        }
        self.pool.submit(traces);
        park(task, key);
        None
    }

    /// Call into compiled code. The function mutates the task's state blob
    /// and guest memory; afterwards the task's PC is re-read from the blob.
    /// A null memory return retires the task.
    pub fn dispatch(&mut self, task: &TaskSharedPtr, func: LiftedFunction) {
        let mut t = task.borrow_mut();
        let pc = t.pc;
        t.store_pc(pc);
        let memory_ptr = Rc::as_ptr(&t.memory) as *mut c_void;
        let state_ptr = t.state_ptr();
        let returned = unsafe { func(state_ptr, pc.as_u64(), memory_ptr) };
        if returned.is_null() {
            debug!("task at {} retired", pc);
            t.exit();
            return;
        }
        t.reload_pc();
    }

    /// Drain finished lift batches into the cache and the live index, wake
    /// tasks whose key landed, and collect tasks whose key never will.
    /// `block` waits for at least one batch; used when every live task is
    /// parked.
    pub fn pump_lift_results(&mut self, block: bool) -> Vec<TaskSharedPtr> {
        let mut responses = Vec::new();
        if block && self.failed.is_empty() {
            if let Some(response) = self.pool.collect() {
                responses.push(response);
            }
        }
        while let Some(response) = self.pool.try_collect() {
            responses.push(response);
        }
        for response in responses {
            self.integrate(response);
        }

        let mut failed = mem::replace(&mut self.failed, Vec::new());
        for task in &self.tasks {
            let mut t = task.borrow_mut();
            if t.status != TaskStatus::AwaitingTranslation {
                continue;
            }
            let key = match t.awaiting {
                Some(key) => key,
                None => continue,
            };
            if self.live_traces.get(&key).is_some() {
                t.status = TaskStatus::Runnable;
                t.awaiting = None;
            } else if !self.pending.contains(&key) {
                drop(t);
                failed.push(task.clone());
            }
        }
        failed
    }

    fn integrate(&mut self, response: LiftResponse) {
        let request_keys: Vec<LiveTraceId> = response
            .traces
            .iter()
            .map(|t| LiveTraceId {
                pc: t.entry_pc,
                version: t.version,
            })
            .collect();
        match response.result {
            Ok(module) => {
                self.cache.install_module(&module);
                let mut records = Vec::new();
                for lifted in &module.functions {
                    // The live key pairs the entry PC with the code version
                    // the trace bytes were decoded under. If the range was
                    // rewritten while the lift was in flight, this installs
                    // under the old version: valid for any address space
                    // still carrying it, unreachable for the new one.
                    let version = match response.traces.iter().find(|t| t.id == lifted.id) {
                        Some(trace) => trace.version,
                        None => continue,
                    };
                    let live = LiveTraceId {
                        pc: lifted.entry_pc,
                        version,
                    };
                    self.live_traces.insert(live, lifted.func);
                    if let Some(aliases) = self.persisted.get(&lifted.id) {
                        for alias in aliases {
                            self.live_traces.insert(*alias, lifted.func);
                        }
                    }
                    let record = IndexRecord {
                        trace: lifted.id,
                        live,
                    };
                    if self.seen_records.insert(record) {
                        records.push(record);
                    }
                }
                if let Err(err) = self.cache.append_index(&records) {
                    warn!("could not persist code cache index: {}", err);
                }
            }
            Err(_) => {
                self.lift_failed = true;
            }
        }
        for key in request_keys {
            self.pending.remove(&key);
        }
    }
}

fn park(task: &TaskSharedPtr, key: LiveTraceId) {
    let mut t = task.borrow_mut();
    t.status = TaskStatus::AwaitingTranslation;
    t.awaiting = Some(key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchName;
    use crate::lifter::testing::TestDecoder;
    use crate::lifter::{InstructionDecoder, LiftedModule, LiftedTraceFn, NullLifter};
    use crate::memory::{AddressSpace, PagePerms};
    use crate::runtime::CooperativeRuntime;
    use crate::task::StateHeader;
    use crate::trace::{DecodedInstruction, DecodedTrace};

    /// Lifts every trace to a host function that retires the task on its
    /// first dispatch.
    struct TestLifter;

    unsafe extern "C" fn retire(_state: *mut u8, _pc: u64, _memory: *mut c_void) -> *mut c_void {
        ptr::null_mut()
    }

    impl InstructionDecoder for TestLifter {
        fn decode(&self, pc: GuestPc, bytes: &[u8]) -> DecodedInstruction {
            TestDecoder.decode(pc, bytes)
        }
    }

    impl Lifter for TestLifter {
        fn lift(&self, traces: &[DecodedTrace]) -> Result<LiftedModule, String> {
            Ok(LiftedModule {
                functions: traces
                    .iter()
                    .map(|t| LiftedTraceFn {
                        id: t.id,
                        entry_pc: t.entry_pc,
                        func: retire,
                    })
                    .collect(),
            })
        }
    }

    /// Always fails, to exercise the unrecoverable-lift exit path.
    struct FailingLifter;

    impl InstructionDecoder for FailingLifter {
        fn decode(&self, pc: GuestPc, bytes: &[u8]) -> DecodedInstruction {
            TestDecoder.decode(pc, bytes)
        }
    }

    impl Lifter for FailingLifter {
        fn lift(&self, _traces: &[DecodedTrace]) -> Result<LiftedModule, String> {
            Err("backend exploded".to_owned())
        }
    }

    fn code_space(code: &[u8]) -> AddressSpaceSharedPtr {
        let mut space = AddressSpace::new(ArchName::Amd64);
        space.set_track_code_versions(true);
        space.add_map(0x4000, 0x1000, "code", 0);
        assert!(space.try_write_bytes(0x4000, code));
        space.set_permissions(0x4000, 0x1000, PagePerms::rx() | PagePerms::WRITE);
        space.into_shared()
    }

    fn executor(dir: &std::path::Path, lifter: Arc<dyn Lifter>) -> Executor {
        let workspace = Workspace::open(dir).unwrap();
        Executor::new(&workspace, lifter)
    }

    fn new_task(pc: u64, memory: &AddressSpaceSharedPtr) -> TaskSharedPtr {
        Rc::new(RefCell::new(Task::new(
            &[],
            GuestPc::new(pc),
            memory.clone(),
        )))
    }

    fn resolve(exec: &mut Executor, task: &TaskSharedPtr) -> Option<LiftedFunction> {
        for _ in 0..16 {
            if let Some(func) = exec.find_lifted_function_for_task(task) {
                return Some(func);
            }
            if !exec.pump_lift_results(true).is_empty() {
                return None;
            }
        }
        None
    }

    #[test]
    fn tasks_sharing_a_space_share_one_translation() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor(dir.path(), Arc::new(TestLifter));
        let space = code_space(&[0x90, 0x90, 0xC3]);
        let task1 = new_task(0x4000, &space);
        let task2 = new_task(0x4000, &space);
        exec.tasks.push(task1.clone());
        exec.tasks.push(task2.clone());

        let func1 = resolve(&mut exec, &task1).expect("translation for task1");
        let func2 = exec
            .find_lifted_function_for_task(&task2)
            .expect("task2 must hit the live index");
        assert_eq!(func1 as usize, func2 as usize);
        assert_eq!(exec.live_trace_count(), 1);
    }

    #[test]
    fn full_run_retires_every_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor(dir.path(), Arc::new(TestLifter));
        let space = code_space(&[0x90, 0x90, 0xC3]);
        exec.add_initial_task(Vec::new(), GuestPc::new(0x4000), space.clone());
        exec.add_initial_task(Vec::new(), GuestPc::new(0x4000), space);
        let code = exec.run(&mut CooperativeRuntime);
        assert_eq!(code, 0);
        assert!(exec
            .tasks()
            .iter()
            .all(|t| t.borrow().status == TaskStatus::Exited));
        assert_eq!(exec.live_trace_count(), 1);
    }

    #[test]
    fn rewritten_code_cannot_reach_the_stale_translation() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor(dir.path(), Arc::new(TestLifter));
        let space = code_space(&[0x90, 0x90, 0xC3]);
        let task = new_task(0x4000, &space);
        exec.tasks.push(task.clone());

        assert!(resolve(&mut exec, &task).is_some());
        let old_version = space.borrow().compute_code_version(GuestPc::new(0x4000));

        // Overwrite the first instruction; the range gets a fresh version.
        assert!(space.borrow_mut().try_write_val::<u8>(0x4000, 0xCC));
        let new_version = space.borrow().compute_code_version(GuestPc::new(0x4000));
        assert_ne!(old_version, new_version);

        // The new key misses even though the old translation is still live
        // for any space that kept the old version.
        task.borrow_mut().status = TaskStatus::Runnable;
        task.borrow_mut().awaiting = None;
        assert!(exec
            .live_traces
            .get(&LiveTraceId {
                pc: GuestPc::new(0x4000),
                version: new_version,
            })
            .is_none());
        assert!(exec.find_lifted_function_for_task(&task).is_none());
        assert!(resolve(&mut exec, &task).is_some());
        assert_eq!(exec.live_trace_count(), 2);
    }

    #[test]
    fn null_lifter_routes_tasks_to_the_error_intrinsic() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor(dir.path(), Arc::new(NullLifter));
        let space = code_space(&[0x90]);
        exec.add_initial_task(Vec::new(), GuestPc::new(0x4000), space);
        let code = exec.run(&mut CooperativeRuntime);
        assert_eq!(code, 0);
        assert!(exec
            .tasks()
            .iter()
            .all(|t| t.borrow().status == TaskStatus::Exited));
        assert_eq!(exec.live_trace_count(), 0);
    }

    #[test]
    fn lift_failure_is_an_unrecoverable_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor(dir.path(), Arc::new(FailingLifter));
        let space = code_space(&[0x90, 0xC3]);
        exec.add_initial_task(Vec::new(), GuestPc::new(0x4000), space);
        let code = exec.run(&mut CooperativeRuntime);
        assert_eq!(code, 1);
    }

    #[test]
    fn index_records_are_not_duplicated_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut exec = executor(dir.path(), Arc::new(TestLifter));
            let space = code_space(&[0x90, 0x90, 0xC3]);
            exec.add_initial_task(Vec::new(), GuestPc::new(0x4000), space);
            assert_eq!(exec.run(&mut CooperativeRuntime), 0);
        }
        let first = std::fs::read_to_string(dir.path().join("index")).unwrap();
        assert_eq!(first.lines().count(), 1);
        {
            // Fresh process, identical code bytes: same TraceId, same live
            // key, so the index must not grow.
            let mut exec = executor(dir.path(), Arc::new(TestLifter));
            let space = code_space(&[0x90, 0x90, 0xC3]);
            exec.add_initial_task(Vec::new(), GuestPc::new(0x4000), space);
            assert_eq!(exec.run(&mut CooperativeRuntime), 0);
        }
        let second = std::fs::read_to_string(dir.path().join("index")).unwrap();
        assert_eq!(second.lines().count(), 1);
    }

    #[test]
    fn dispatch_reloads_the_pc_from_the_state_blob() {
        unsafe extern "C" fn bump_pc(state: *mut u8, pc: u64, memory: *mut c_void) -> *mut c_void {
            let mut header = ptr::read_unaligned(state as *const StateHeader);
            header.pc = pc + 3;
            ptr::write_unaligned(state as *mut StateHeader, header);
            memory
        }
        let dir = tempfile::tempdir().unwrap();
        let mut exec = executor(dir.path(), Arc::new(TestLifter));
        let space = code_space(&[0x90, 0x90, 0xC3]);
        let task = new_task(0x4000, &space);
        exec.tasks.push(task.clone());
        exec.dispatch(&task, bump_pc);
        assert_eq!(task.borrow().pc, GuestPc::new(0x4003));
        assert!(task.borrow().is_runnable());
    }
}
