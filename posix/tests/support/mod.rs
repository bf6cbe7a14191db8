//! Simulated microkernel and collaborators for integration tests.
//!
//! `MockKernel` keeps a handle table of shared objects. Address spaces are
//! page maps; memory objects are plain (backed by a page map), the zero
//! object, or copy-on-write views that keep private copies of written pages
//! and read everything else through their source.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::executor::LocalPool;
use futures::task::{LocalSpawn, LocalSpawnExt};

use posix_subsystem::platform::{
    ExecRequest, ExecResult, File, KernelResult, Loader, ProcDirectory, Procfs, RegisterSet,
    ServiceEndpoint, ThreadStats, TransferDirection,
};
use posix_subsystem::signal::SignalAbi;
use posix_subsystem::signal::frame::NativeAbi;
use posix_subsystem::{
    Error, Generation, Handle, KernelError, LoadError, MapFlags, Microkernel, Pid, Process,
    ServerConfig, Subsystem, UniqueHandle, PAGE_SIZE,
};

#[cfg(target_arch = "aarch64")]
const PROGRAM_REGS: (usize, usize) = (
    posix_subsystem::signal::frame::Aarch64::REG_PC,
    posix_subsystem::signal::frame::Aarch64::REG_SP,
);
#[cfg(target_arch = "riscv64")]
const PROGRAM_REGS: (usize, usize) = (
    posix_subsystem::signal::frame::Riscv64::REG_PC,
    posix_subsystem::signal::frame::Riscv64::REG_SP,
);
#[cfg(not(any(target_arch = "aarch64", target_arch = "riscv64")))]
const PROGRAM_REGS: (usize, usize) = (
    posix_subsystem::signal::frame::X86_64::REG_RIP,
    posix_subsystem::signal::frame::X86_64::REG_RSP,
);

/// Size of the SIMD register image.
pub const SIMD_SIZE: usize = 64;

/// Entry point of every image the mock loader builds.
pub const ENTRY_IP: u64 = 0x40_1000;

/// Stack size of every image the mock loader builds.
pub const STACK_SIZE: u64 = 16 * PAGE_SIZE;

const ALLOCATION_BASE: u64 = 0x7000_0000_0000;

fn zero_page() -> Vec<u8> {
    vec![0u8; PAGE_SIZE as usize]
}

// ─── Memory objects ─────────────────────────────────────────────────

pub enum Memory {
    Plain(Mutex<BTreeMap<u64, Vec<u8>>>),
    Zero,
    Cow {
        source: Arc<Memory>,
        base: u64,
        private: Mutex<BTreeMap<u64, Vec<u8>>>,
    },
}

impl Memory {
    fn read_page(&self, offset: u64) -> Vec<u8> {
        match self {
            Memory::Plain(pages) => pages
                .lock()
                .unwrap()
                .get(&offset)
                .cloned()
                .unwrap_or_else(zero_page),
            Memory::Zero => zero_page(),
            Memory::Cow {
                source,
                base,
                private,
            } => {
                if let Some(page) = private.lock().unwrap().get(&offset) {
                    return page.clone();
                }
                source.read_page(base + offset)
            }
        }
    }

    fn write_page(&self, offset: u64, page: Vec<u8>) -> KernelResult<()> {
        match self {
            Memory::Plain(pages) => {
                pages.lock().unwrap().insert(offset, page);
                Ok(())
            }
            Memory::Zero => Err(KernelError::Fault),
            Memory::Cow { private, .. } => {
                private.lock().unwrap().insert(offset, page);
                Ok(())
            }
        }
    }

    /// Write `data` at byte `offset` of a plain object.
    pub fn fill(&self, offset: u64, data: &[u8]) {
        let mut cursor = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let page_offset = cursor & !(PAGE_SIZE - 1);
            let within = (cursor - page_offset) as usize;
            let chunk = rest.len().min(PAGE_SIZE as usize - within);
            let mut page = self.read_page(page_offset);
            page[within..within + chunk].copy_from_slice(&rest[..chunk]);
            self.write_page(page_offset, page).unwrap();
            cursor += chunk as u64;
            rest = &rest[chunk..];
        }
    }
}

// ─── Spaces and threads ─────────────────────────────────────────────

#[derive(Clone)]
struct Mapping {
    memory: Arc<Memory>,
    offset: u64,
    flags: MapFlags,
}

pub struct Space {
    pages: Mutex<BTreeMap<u64, Mapping>>,
    next: Mutex<u64>,
}

impl Space {
    fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            next: Mutex::new(ALLOCATION_BASE),
        }
    }

    fn allocate(&self, size: u64) -> u64 {
        let mut next = self.next.lock().unwrap();
        let address = *next;
        *next += size + PAGE_SIZE;
        address
    }

    fn read(&self, address: u64, length: usize) -> KernelResult<Vec<u8>> {
        let pages = self.pages.lock().unwrap();
        let mut out = Vec::with_capacity(length);
        let mut cursor = address;
        while out.len() < length {
            let page = cursor & !(PAGE_SIZE - 1);
            let mapping = pages.get(&page).ok_or(KernelError::Fault)?;
            let within = (cursor - page) as usize;
            let chunk = (length - out.len()).min(PAGE_SIZE as usize - within);
            let content = mapping.memory.read_page(mapping.offset);
            out.extend_from_slice(&content[within..within + chunk]);
            cursor += chunk as u64;
        }
        Ok(out)
    }

    fn write(&self, address: u64, data: &[u8]) -> KernelResult<()> {
        let pages = self.pages.lock().unwrap();
        let mut cursor = address;
        let mut rest = data;
        while !rest.is_empty() {
            let page = cursor & !(PAGE_SIZE - 1);
            let mapping = pages.get(&page).ok_or(KernelError::Fault)?;
            let within = (cursor - page) as usize;
            let chunk = rest.len().min(PAGE_SIZE as usize - within);
            let mut content = mapping.memory.read_page(mapping.offset);
            content[within..within + chunk].copy_from_slice(&rest[..chunk]);
            mapping.memory.write_page(mapping.offset, content)?;
            cursor += chunk as u64;
            rest = &rest[chunk..];
        }
        Ok(())
    }
}

pub struct MockThread {
    space: Arc<Space>,
    registers: Mutex<HashMap<RegisterSet, Vec<u8>>>,
    killed: AtomicBool,
    resumed: AtomicBool,
    user_time: Mutex<u64>,
}

impl MockThread {
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }

    pub fn set_user_time(&self, nanos: u64) {
        *self.user_time.lock().unwrap() = nanos;
    }

    fn signal_gregs(&self) -> Vec<u64> {
        let registers = self.registers.lock().unwrap();
        bytemuck::pod_collect_to_vec(&registers[&RegisterSet::Signal])
    }

    fn store_signal_gregs(&self, gregs: &[u64]) {
        self.registers
            .lock()
            .unwrap()
            .insert(RegisterSet::Signal, bytemuck::cast_slice(gregs).to_vec());
    }

    /// Current instruction and stack pointer.
    pub fn program(&self) -> (u64, u64) {
        let gregs = self.signal_gregs();
        (
            NativeAbi::instruction_pointer(&gregs),
            NativeAbi::stack_pointer(&gregs),
        )
    }

    pub fn set_program(&self, ip: u64, sp: u64) {
        let mut gregs = self.signal_gregs();
        gregs[PROGRAM_REGS.0] = ip;
        gregs[PROGRAM_REGS.1] = sp;
        self.store_signal_gregs(&gregs);
    }

    /// One general purpose register of the signal image.
    pub fn greg(&self, index: usize) -> u64 {
        self.signal_gregs()[index]
    }

    pub fn set_greg(&self, index: usize, value: u64) {
        let mut gregs = self.signal_gregs();
        gregs[index] = value;
        self.store_signal_gregs(&gregs);
    }

    pub fn simd(&self) -> Vec<u8> {
        self.registers.lock().unwrap()[&RegisterSet::Simd].clone()
    }
}

// ─── Kernel ─────────────────────────────────────────────────────────

#[derive(Clone)]
enum Object {
    Space(Arc<Space>),
    Memory(Arc<Memory>),
    Universe(u64),
    Thread(Arc<MockThread>),
}

#[derive(Default)]
struct KernelState {
    next_handle: u64,
    handles: HashMap<u64, Object>,
    /// Descriptors living in each universe.
    universes: HashMap<u64, BTreeSet<u64>>,
    threads: Vec<Arc<MockThread>>,
    fail_next_map: Option<KernelError>,
}

pub struct MockKernel {
    state: Mutex<KernelState>,
    zero: Handle,
}

impl MockKernel {
    pub fn new() -> Arc<Self> {
        let mut state = KernelState {
            next_handle: 1,
            ..KernelState::default()
        };
        let zero = Handle(state.next_handle);
        state.next_handle += 1;
        state.handles.insert(zero.0, Object::Memory(Arc::new(Memory::Zero)));
        Arc::new(Self {
            state: Mutex::new(state),
            zero,
        })
    }

    fn insert(&self, object: Object) -> Handle {
        let mut state = self.state.lock().unwrap();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, object);
        Handle(handle)
    }

    fn object(&self, handle: Handle) -> KernelResult<Object> {
        self.state
            .lock()
            .unwrap()
            .handles
            .get(&handle.0)
            .cloned()
            .ok_or(KernelError::BadDescriptor)
    }

    fn memory(&self, handle: Handle) -> KernelResult<Arc<Memory>> {
        match self.object(handle)? {
            Object::Memory(memory) => Ok(memory),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    fn space(&self, handle: Handle) -> KernelResult<Arc<Space>> {
        match self.object(handle)? {
            Object::Space(space) => Ok(space),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    fn universe(&self, handle: Handle) -> KernelResult<u64> {
        match self.object(handle)? {
            Object::Universe(id) => Ok(id),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    /// The live thread behind `handle`.
    pub fn thread(&self, handle: Handle) -> KernelResult<Arc<MockThread>> {
        match self.object(handle)? {
            Object::Thread(thread) => Ok(thread),
            _ => Err(KernelError::BadDescriptor),
        }
    }

    /// Every thread ever created, in creation order.
    pub fn threads(&self) -> Vec<Arc<MockThread>> {
        self.state.lock().unwrap().threads.clone()
    }

    /// Create a plain memory object and return a handle owned by the test.
    pub fn create_memory(&self, content: &[u8]) -> Handle {
        let memory = Memory::Plain(Mutex::new(BTreeMap::new()));
        memory.fill(0, content);
        self.insert(Object::Memory(Arc::new(memory)))
    }

    /// Page addresses mapped in `space`, ascending.
    pub fn mapped_pages(&self, space: Handle) -> Vec<u64> {
        let space = self.space(space).unwrap();
        let pages = space.pages.lock().unwrap();
        pages.keys().copied().collect()
    }

    pub fn page_flags(&self, space: Handle, address: u64) -> Option<MapFlags> {
        let space = self.space(space).unwrap();
        let pages = space.pages.lock().unwrap();
        pages.get(&(address & !(PAGE_SIZE - 1))).map(|m| m.flags)
    }

    pub fn read_space(&self, space: Handle, address: u64, length: usize) -> KernelResult<Vec<u8>> {
        self.space(space)?.read(address, length)
    }

    pub fn write_space(&self, space: Handle, address: u64, data: &[u8]) -> KernelResult<()> {
        self.space(space)?.write(address, data)
    }

    /// Number of descriptors currently living in `universe`.
    pub fn descriptor_count(&self, universe: Handle) -> usize {
        let id = self.universe(universe).unwrap();
        self.state.lock().unwrap().universes[&id].len()
    }

    /// Number of open handles (the zero memory object included).
    pub fn live_handles(&self) -> usize {
        self.state.lock().unwrap().handles.len()
    }

    /// Make the next `map_memory` call fail with `error`.
    pub fn fail_next_map(&self, error: KernelError) {
        self.state.lock().unwrap().fail_next_map = Some(error);
    }
}

#[async_trait(?Send)]
impl Microkernel for MockKernel {
    fn create_space(&self) -> KernelResult<Handle> {
        Ok(self.insert(Object::Space(Arc::new(Space::new()))))
    }

    fn create_universe(&self) -> KernelResult<Handle> {
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_handle;
            state.next_handle += 1;
            state.universes.insert(id, BTreeSet::new());
            id
        };
        Ok(self.insert(Object::Universe(id)))
    }

    fn allocate_memory(&self, _size: u64) -> KernelResult<Handle> {
        Ok(self.insert(Object::Memory(Arc::new(Memory::Plain(Mutex::new(
            BTreeMap::new(),
        ))))))
    }

    fn zero_memory(&self) -> Handle {
        self.zero
    }

    fn copy_on_write(&self, source: Handle, offset: u64, _size: u64) -> KernelResult<Handle> {
        let source = self.memory(source)?;
        Ok(self.insert(Object::Memory(Arc::new(Memory::Cow {
            source,
            base: offset,
            private: Mutex::new(BTreeMap::new()),
        }))))
    }

    fn fork_memory(&self, copy_view: Handle) -> KernelResult<Handle> {
        let memory = self.memory(copy_view)?;
        let Memory::Cow {
            source,
            base,
            private,
        } = &*memory
        else {
            return Err(KernelError::IllegalArguments);
        };
        let forked = Memory::Cow {
            source: source.clone(),
            base: *base,
            private: Mutex::new(private.lock().unwrap().clone()),
        };
        Ok(self.insert(Object::Memory(Arc::new(forked))))
    }

    fn map_memory(
        &self,
        view: Handle,
        space: Handle,
        hint: Option<u64>,
        offset: u64,
        size: u64,
        flags: MapFlags,
    ) -> KernelResult<u64> {
        if let Some(error) = self.state.lock().unwrap().fail_next_map.take() {
            return Err(error);
        }
        let memory = self.memory(view)?;
        let space = self.space(space)?;
        if size == 0 || size % PAGE_SIZE != 0 || offset % PAGE_SIZE != 0 {
            return Err(KernelError::IllegalArguments);
        }

        let address = if flags.intersects(MapFlags::PLACEMENT) {
            hint.ok_or(KernelError::IllegalArguments)?
        } else {
            space.allocate(size)
        };

        let mut pages = space.pages.lock().unwrap();
        if flags.contains(MapFlags::FIXED_NO_REPLACE)
            && pages.range(address..address + size).next().is_some()
        {
            return Err(KernelError::AlreadyExists);
        }
        for page in (0..size).step_by(PAGE_SIZE as usize) {
            pages.insert(
                address + page,
                Mapping {
                    memory: memory.clone(),
                    offset: offset + page,
                    flags: flags - MapFlags::PLACEMENT,
                },
            );
        }
        Ok(address)
    }

    fn unmap_memory(&self, space: Handle, address: u64, size: u64) -> KernelResult<()> {
        let space = self.space(space)?;
        let mut pages = space.pages.lock().unwrap();
        let inside: Vec<u64> = pages.range(address..address + size).map(|(&a, _)| a).collect();
        for page in inside {
            pages.remove(&page);
        }
        Ok(())
    }

    async fn protect_memory(
        &self,
        space: Handle,
        address: u64,
        size: u64,
        flags: MapFlags,
    ) -> KernelResult<()> {
        let space = self.space(space)?;
        let mut pages = space.pages.lock().unwrap();
        for (_, mapping) in pages.range_mut(address..address + size) {
            mapping.flags = (mapping.flags - MapFlags::PROTECTION) | (flags & MapFlags::PROTECTION);
        }
        Ok(())
    }

    fn duplicate(&self, handle: Handle) -> KernelResult<Handle> {
        let object = self.object(handle)?;
        Ok(self.insert(object))
    }

    fn close(&self, handle: Handle) -> KernelResult<()> {
        self.state
            .lock()
            .unwrap()
            .handles
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(KernelError::BadDescriptor)
    }

    fn transfer_descriptor(
        &self,
        _handle: Handle,
        universe: Handle,
        direction: TransferDirection,
    ) -> KernelResult<Handle> {
        assert_eq!(direction, TransferDirection::Out);
        let id = self.universe(universe)?;
        let mut state = self.state.lock().unwrap();
        let client = state.next_handle;
        state.next_handle += 1;
        state
            .universes
            .get_mut(&id)
            .ok_or(KernelError::BadDescriptor)?
            .insert(client);
        Ok(Handle(client))
    }

    fn close_descriptor(&self, universe: Handle, handle: Handle) -> KernelResult<()> {
        let id = self.universe(universe)?;
        let mut state = self.state.lock().unwrap();
        let descriptors = state.universes.get_mut(&id).ok_or(KernelError::BadDescriptor)?;
        if descriptors.remove(&handle.0) {
            Ok(())
        } else {
            Err(KernelError::BadDescriptor)
        }
    }

    fn create_thread(
        &self,
        universe: Handle,
        space: Handle,
        ip: u64,
        sp: u64,
        stopped: bool,
    ) -> KernelResult<Handle> {
        self.universe(universe)?;
        let space = self.space(space)?;

        let mut registers = HashMap::new();
        registers.insert(
            RegisterSet::Signal,
            vec![0u8; NativeAbi::GREG_COUNT * 8],
        );
        registers.insert(RegisterSet::Simd, vec![0u8; SIMD_SIZE]);
        let thread = Arc::new(MockThread {
            space,
            registers: Mutex::new(registers),
            killed: AtomicBool::new(false),
            resumed: AtomicBool::new(!stopped),
            user_time: Mutex::new(0),
        });
        thread.set_program(ip, sp);

        self.state.lock().unwrap().threads.push(thread.clone());
        Ok(self.insert(Object::Thread(thread)))
    }

    fn kill_thread(&self, thread: Handle) -> KernelResult<()> {
        self.thread(thread)?.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume_thread(&self, thread: Handle) -> KernelResult<()> {
        self.thread(thread)?.resumed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn register_set_size(&self, set: RegisterSet) -> usize {
        match set {
            RegisterSet::Program => 16,
            RegisterSet::General | RegisterSet::Signal => NativeAbi::GREG_COUNT * 8,
            RegisterSet::Simd => SIMD_SIZE,
        }
    }

    fn load_registers(&self, thread: Handle, set: RegisterSet) -> KernelResult<Vec<u8>> {
        let thread = self.thread(thread)?;
        match set {
            RegisterSet::Program => {
                let (ip, sp) = thread.program();
                Ok(bytemuck::cast_slice(&[ip, sp]).to_vec())
            }
            RegisterSet::General | RegisterSet::Signal => {
                Ok(thread.registers.lock().unwrap()[&RegisterSet::Signal].clone())
            }
            RegisterSet::Simd => Ok(thread.simd()),
        }
    }

    fn store_registers(&self, thread: Handle, set: RegisterSet, image: &[u8]) -> KernelResult<()> {
        let thread = self.thread(thread)?;
        if image.len() != self.register_set_size(set) {
            return Err(KernelError::IllegalArguments);
        }
        match set {
            RegisterSet::Program => {
                let words: Vec<u64> = bytemuck::pod_collect_to_vec(image);
                thread.set_program(words[0], words[1]);
            }
            RegisterSet::General | RegisterSet::Signal => {
                thread
                    .registers
                    .lock()
                    .unwrap()
                    .insert(RegisterSet::Signal, image.to_vec());
            }
            RegisterSet::Simd => {
                thread
                    .registers
                    .lock()
                    .unwrap()
                    .insert(RegisterSet::Simd, image.to_vec());
            }
        }
        Ok(())
    }

    async fn read_memory(
        &self,
        thread: Handle,
        address: u64,
        length: usize,
    ) -> KernelResult<Vec<u8>> {
        self.thread(thread)?.space.read(address, length)
    }

    async fn write_memory(&self, thread: Handle, address: u64, data: &[u8]) -> KernelResult<()> {
        self.thread(thread)?.space.write(address, data)
    }

    fn thread_stats(&self, thread: Handle) -> KernelResult<ThreadStats> {
        Ok(ThreadStats {
            user_time: *self.thread(thread)?.user_time.lock().unwrap(),
        })
    }
}

// ─── Collaborators ──────────────────────────────────────────────────

/// Builds every image as a stack mapping plus a stopped thread.
pub struct MockLoader {
    kernel: Arc<MockKernel>,
    failing: Mutex<HashSet<String>>,
    executed: Mutex<Vec<String>>,
}

impl MockLoader {
    pub fn new(kernel: Arc<MockKernel>) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            failing: Mutex::new(HashSet::new()),
            executed: Mutex::new(Vec::new()),
        })
    }

    /// Reject `path` with `LoadError::NotFound`.
    pub fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait(?Send)]
impl Loader for MockLoader {
    async fn execute(&self, request: ExecRequest<'_>) -> posix_subsystem::Result<ExecResult> {
        if self.failing.lock().unwrap().contains(request.path) {
            return Err(LoadError::NotFound.into());
        }

        let stack = request.vm.map_file(
            None,
            None,
            None,
            0,
            STACK_SIZE,
            true,
            MapFlags::PROT_READ | MapFlags::PROT_WRITE,
        )?;
        let sp = stack + STACK_SIZE;
        let thread =
            self.kernel
                .create_thread(request.universe, request.vm.space(), ENTRY_IP, sp, true)?;

        self.executed.lock().unwrap().push(request.path.to_string());
        let kernel: Arc<dyn Microkernel> = self.kernel.clone();
        Ok(ExecResult {
            thread: UniqueHandle::new(kernel, thread),
            aux_begin: sp - 0x100,
            aux_end: sp,
        })
    }
}

struct MockProcDirectory {
    pid: Pid,
    unlinked: Arc<Mutex<Vec<Pid>>>,
}

impl ProcDirectory for MockProcDirectory {
    fn unlink_self(&self) {
        self.unlinked.lock().unwrap().push(self.pid);
    }
}

#[derive(Default)]
pub struct MockProcfs {
    created: Mutex<Vec<Pid>>,
    unlinked: Arc<Mutex<Vec<Pid>>>,
}

impl MockProcfs {
    pub fn created(&self) -> Vec<Pid> {
        self.created.lock().unwrap().clone()
    }

    pub fn unlinked(&self) -> Vec<Pid> {
        self.unlinked.lock().unwrap().clone()
    }
}

impl Procfs for MockProcfs {
    fn create_proc_directory(&self, pid: Pid) -> Box<dyn ProcDirectory> {
        self.created.lock().unwrap().push(pid);
        Box::new(MockProcDirectory {
            pid,
            unlinked: self.unlinked.clone(),
        })
    }
}

/// Keeps one request in flight per generation until it is cancelled.
#[derive(Default)]
pub struct TestEndpoint {
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl TestEndpoint {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait(?Send)]
impl ServiceEndpoint for TestEndpoint {
    async fn serve(&self, _process: Arc<Process>, generation: Arc<Generation>) {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(_request) = generation.begin_request() {
            generation.cancellation().cancelled().await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// A file whose contents live in a plain memory object.
pub struct MockFile {
    kernel: Arc<MockKernel>,
    memory: Handle,
    lane: Handle,
}

impl MockFile {
    pub fn new(kernel: &Arc<MockKernel>, content: &[u8]) -> Arc<Self> {
        let memory = kernel.create_memory(content);
        let lane = kernel.allocate_memory(0).unwrap();
        Arc::new(Self {
            kernel: kernel.clone(),
            memory,
            lane,
        })
    }

    /// An owned view of the contents, as handed to `map_file`.
    pub fn view(&self) -> UniqueHandle {
        let kernel: Arc<dyn Microkernel> = self.kernel.clone();
        UniqueHandle::new(kernel, self.kernel.duplicate(self.memory).unwrap())
    }
}

#[async_trait(?Send)]
impl File for MockFile {
    fn passthrough_lane(&self) -> Handle {
        self.lane
    }

    async fn access_memory(&self) -> posix_subsystem::Result<UniqueHandle> {
        let kernel: Arc<dyn Microkernel> = self.kernel.clone();
        Ok(UniqueHandle::new(
            kernel,
            self.kernel.duplicate(self.memory).map_err(Error::from)?,
        ))
    }
}

// ─── Harness ────────────────────────────────────────────────────────

pub type Slot<T> = Rc<RefCell<Option<T>>>;

pub struct Harness {
    pub pool: LocalPool,
    pub kernel: Arc<MockKernel>,
    pub loader: Arc<MockLoader>,
    pub procfs: Arc<MockProcfs>,
    pub endpoint: Arc<TestEndpoint>,
    pub subsystem: Arc<Subsystem>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let pool = LocalPool::new();
        let kernel = MockKernel::new();
        let loader = MockLoader::new(kernel.clone());
        let procfs = Arc::new(MockProcfs::default());
        let endpoint = Arc::new(TestEndpoint::default());

        let spawner: Arc<dyn LocalSpawn> = Arc::new(pool.spawner());
        let platform = posix_subsystem::Platform {
            kernel: kernel.clone(),
            loader: loader.clone(),
            endpoint: endpoint.clone(),
            procfs: procfs.clone(),
            spawner,
            mbus_lane: Handle(0x6d62),
        };
        let subsystem = Subsystem::new(config, platform);

        Self {
            pool,
            kernel,
            loader,
            procfs,
            endpoint,
            subsystem,
        }
    }

    /// Spawn `future` without running it.
    pub fn spawn<T: 'static>(&self, future: impl Future<Output = T> + 'static) -> Slot<T> {
        let slot: Slot<T> = Rc::new(RefCell::new(None));
        let out = slot.clone();
        self.pool
            .spawner()
            .spawn_local(async move {
                *out.borrow_mut() = Some(future.await);
            })
            .unwrap();
        slot
    }

    /// Run every task until nothing can make progress.
    pub fn stall(&mut self) {
        self.pool.run_until_stalled();
    }

    /// Run `future` (and everything it wakes) to completion.
    pub fn run<T: 'static>(&mut self, future: impl Future<Output = T> + 'static) -> T {
        let slot = self.spawn(future);
        self.stall();
        let result = slot.borrow_mut().take();
        result.expect("future did not complete")
    }

    /// Start init from `/sbin/init`.
    pub fn init(&mut self) -> Arc<Process> {
        let subsystem = self.subsystem.clone();
        self.run(async move { subsystem.launch_init("/sbin/init").await })
            .unwrap()
    }

    /// Fork `parent`, copy its registers into the child and resume it.
    pub fn fork(&mut self, parent: &Arc<Process>) -> Arc<Process> {
        let child = Process::fork(parent).unwrap();
        let from = parent.thread_handle().unwrap();
        let to = child.thread_handle().unwrap();
        for set in [RegisterSet::Signal, RegisterSet::Simd] {
            let image = self.kernel.load_registers(from, set).unwrap();
            self.kernel.store_registers(to, set, &image).unwrap();
        }
        child.resume().unwrap();
        self.stall();
        child
    }

    /// Terminate `process` with an exit code and let everything settle.
    pub fn exit(&mut self, process: &Arc<Process>, code: i32) {
        let process = process.clone();
        self.run(async move {
            process
                .terminate(posix_subsystem::TerminationState::ByExit(code))
                .await
        })
        .unwrap();
    }
}
