//! The virtual machine: registers, processors, and shared runtime state

pub mod exec;

pub use self::exec::{ ExecOutcome, ExecState };

use std::sync::Arc;

use crate::{
  exception::{ default_handler, HandlerFunc },
  function::{ Function, NativeFunc },
  memory::{ CoreAllocator, MemoryError },
  storage::FlatStorage,
  sync::Mutex,
  thread_memory::ThreadMemory,
};


/// One 64-bit untagged register slot.
///
/// The store is a plain 64-bit integer; the executor chooses an
/// interpretation per opcode through the typed accessors. There is no tag
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Register(u64);

impl Register {
  /// The number of registers in a virtual processor's file
  pub const COUNT: usize = 16;

  /// Zero the register
  pub fn clear (&mut self) { self.0 = 0 }

  /// Read as an unsigned 64-bit integer
  pub fn as_u64 (self) -> u64 { self.0 }

  /// Write an unsigned 64-bit integer
  pub fn set_u64 (&mut self, value: u64) { self.0 = value }

  /// Read as a signed 64-bit integer
  pub fn as_i64 (self) -> i64 { self.0 as i64 }

  /// Write a signed 64-bit integer
  pub fn set_i64 (&mut self, value: i64) { self.0 = value as u64 }

  /// Read a 32-bit float from the low bytes
  pub fn as_f32 (self) -> f32 { f32::from_bits(self.0 as u32) }

  /// Write a 32-bit float into the low bytes, zeroing the high bytes
  pub fn set_f32 (&mut self, value: f32) { self.0 = value.to_bits() as u64 }

  /// Read as a 64-bit float
  pub fn as_f64 (self) -> f64 { f64::from_bits(self.0) }

  /// Write a 64-bit float
  pub fn set_f64 (&mut self, value: f64) { self.0 = value.to_bits() }

  /// Read as a memory pointer
  pub fn as_ptr (self) -> *mut u8 { self.0 as usize as *mut u8 }

  /// Write a memory pointer
  pub fn set_ptr (&mut self, ptr: *mut u8) { self.0 = ptr as usize as u64 }
}


/// One execution context: an id, its thread memory, and a step counter.
/// Each processor is pinned to a single executor thread; the register file
/// itself lives in the per-activation [`ExecState`]
pub struct VirtualProcessor {
  id: u16,
  memory: ThreadMemory,
  steps: u64,
}

impl VirtualProcessor {
  /// Create a processor around an existing thread memory
  pub fn new (id: u16, memory: ThreadMemory) -> Self {
    Self { id, memory, steps: 0 }
  }

  /// The processor's id
  pub fn id (&self) -> u16 { self.id }

  /// True for the VM's main processor
  pub fn is_main_thread (&self) -> bool { self.id == 0 }

  /// How many instructions this processor has executed
  pub fn steps (&self) -> u64 { self.steps }

  pub(crate) fn count_step (&mut self) { self.steps += 1 }

  /// The processor's thread memory
  pub fn memory (&self) -> &ThreadMemory { &self.memory }

  /// The processor's thread memory, mutably
  pub fn memory_mut (&mut self) -> &mut ThreadMemory { &mut self.memory }
}


/// A running VM instance: the core allocator, the symbol store, the
/// core-service table, the default exception handler, and the processors
/// spawned by executing bytecode.
///
/// The allocator and the store are the only shared mutable structures;
/// each carries its own internal lock
pub struct Vm {
  allocator: Arc<CoreAllocator>,
  storage: FlatStorage,
  handler: HandlerFunc,
  services: Mutex<Vec<NativeFunc>>,
  spawned: Mutex<Vec<Option<VirtualProcessor>>>,
  stack_bytes: u32,
  local_bytes: u32,
}

impl Vm {
  /// The default stack geometry for new processors
  pub const DEFAULT_STACK_BYTES: u32 = 4 * 1024;

  /// The default local arena geometry for new processors
  pub const DEFAULT_LOCAL_BYTES: u32 = 60 * 1024;

  /// Create a VM with a fresh allocator and symbol store and the default
  /// processor geometry
  pub fn new () -> Result<Self, MemoryError> {
    let allocator = Arc::new(CoreAllocator::new());
    let storage = FlatStorage::new(&allocator)?;

    Ok(Self {
      allocator,
      storage,
      handler: default_handler,
      services: Mutex::new(Vec::new()),
      spawned: Mutex::new(Vec::new()),
      stack_bytes: Self::DEFAULT_STACK_BYTES,
      local_bytes: Self::DEFAULT_LOCAL_BYTES,
    })
  }

  /// The VM's core allocator
  pub fn allocator (&self) -> &Arc<CoreAllocator> {
    &self.allocator
  }

  /// The VM's symbol store
  pub fn storage (&self) -> &FlatStorage {
    &self.storage
  }

  /// Replace the VM-wide default exception handler. Functions may still
  /// install their own, which take precedence
  pub fn install_handler (&mut self, handler: HandlerFunc) {
    self.handler = handler
  }

  /// The VM-wide default exception handler
  pub fn handler (&self) -> HandlerFunc {
    self.handler
  }

  /// Change the thread-memory geometry used for new processors
  pub fn set_processor_geometry (&mut self, stack_bytes: u32, local_bytes: u32) {
    self.stack_bytes = stack_bytes;
    self.local_bytes = local_bytes;
  }

  /// Register a native service callable through the `corecall`
  /// instruction. Returns the service index
  pub fn register_service (&self, service: NativeFunc) -> u16 {
    let mut services = self.services.lock();
    let idx = services.len() as u16;
    services.push(service);
    idx
  }

  pub(crate) fn service (&self, idx: u16) -> Option<NativeFunc> {
    self.services.lock().get(idx as usize).copied()
  }

  /// Create a processor with the VM's current geometry
  pub fn make_processor (&self, id: u16) -> Result<VirtualProcessor, MemoryError> {
    let memory = ThreadMemory::new(&self.allocator, self.stack_bytes, self.local_bytes)?;
    Ok(VirtualProcessor::new(id, memory))
  }

  /// Execute a function on a processor until it returns or faults
  pub fn run (&self, vp: &mut VirtualProcessor, func: &Function) -> ExecOutcome {
    exec::run(self, vp, func)
  }

  /// Park a processor in the VM's spawn table, returning its spawn id.
  /// Parked processors can be merged from and reaped later
  pub fn park_spawned (&self, vp: VirtualProcessor) -> u16 {
    let mut spawned = self.spawned.lock();
    let id = spawned.len() as u16;
    spawned.push(Some(vp));
    id
  }

  /// Reserve the next spawn id without parking anything yet
  pub(crate) fn reserve_spawn_id (&self) -> u16 {
    let mut spawned = self.spawned.lock();
    let id = spawned.len() as u16;
    spawned.push(None);
    id
  }

  /// Fill a reserved spawn slot
  pub(crate) fn fill_spawn_slot (&self, id: u16, vp: VirtualProcessor) {
    self.spawned.lock()[id as usize] = Some(vp)
  }

  /// Run `f` against a parked spawned processor.
  /// Returns None when the id names no live processor
  pub fn with_spawned<R> (&self, id: u16, f: impl FnOnce(&mut VirtualProcessor) -> R) -> Option<R> {
    let mut spawned = self.spawned.lock();
    spawned.get_mut(id as usize)?.as_mut().map(f)
  }

  /// Remove and return a parked spawned processor
  pub fn reap_spawned (&self, id: u16) -> Option<VirtualProcessor> {
    self.spawned.lock().get_mut(id as usize)?.take()
  }

  /// The number of spawn slots the VM has handed out
  pub fn spawn_count (&self) -> usize {
    self.spawned.lock().len()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_register_views () {
    let mut reg = Register::default();

    reg.set_u64(u64::MAX);
    assert_eq!(reg.as_i64(), -1);

    reg.set_i64(-42);
    assert_eq!(reg.as_u64(), (-42i64) as u64);

    reg.set_f32(1.5);
    assert_eq!(reg.as_f32(), 1.5);
    assert_eq!(reg.as_u64(), 1.5f32.to_bits() as u64);

    reg.set_f64(-2.25);
    assert_eq!(reg.as_f64(), -2.25);

    let mut byte = 7u8;
    reg.set_ptr(&mut byte);
    assert_eq!(unsafe { reg.as_ptr().read() }, 7);

    reg.clear();
    assert_eq!(reg.as_u64(), 0);
  }

  #[test]
  fn test_processor_geometry () {
    let mut vm = Vm::new().unwrap();
    vm.set_processor_geometry(256, 512);

    let vp = vm.make_processor(0).unwrap();
    assert!(vp.is_main_thread());
    assert_eq!(vp.memory().stack_size(), 256);
    assert_eq!(vp.memory().local_size(), 512);
    assert_eq!(vp.steps(), 0);
  }

  #[test]
  fn test_service_registry () {
    use crate::exception::HandlerResult;

    fn service (_state: &mut ExecState) -> HandlerResult { HandlerResult::Handled }

    let vm = Vm::new().unwrap();
    assert_eq!(vm.register_service(service), 0);
    assert_eq!(vm.register_service(service), 1);
    assert!(vm.service(1).is_some());
    assert!(vm.service(2).is_none());
  }

  #[test]
  fn test_spawn_table () {
    let vm = Vm::new().unwrap();

    let vp = vm.make_processor(1).unwrap();
    let id = vm.park_spawned(vp);

    assert_eq!(vm.with_spawned(id, |vp| vp.id()), Some(1));
    assert!(vm.reap_spawned(id).is_some());
    assert_eq!(vm.with_spawned(id, |vp| vp.id()), None);
  }
}
