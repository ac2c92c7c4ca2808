//! Function objects: native callables and bytecode bodies

use std::{
  cell::Cell,
  mem::align_of,
  ptr::NonNull,
  sync::Arc,
};

use crate::{
  exception::{ HandlerFunc, HandlerResult },
  instruction::{ Instruction, Opcode },
  memory::{ CoreAllocator, MemoryAddress, MemoryError, DEFAULT_ALLOC_FLAGS },
  reloc::RelocationTable,
  utils::get_align_offset,
};


/// A native function exposed to the VM, callable from bytecode routines
pub type NativeFunc = fn(&mut crate::vm::ExecState) -> HandlerResult;


enum Body {
  Native(NativeFunc),
  Bytecode {
    allocator: Arc<CoreAllocator>,
    region: MemoryAddress,
  },
}


/// An executable routine: either VM bytecode or a native function.
///
/// A bytecode function owns a single allocation laid out as
/// `[code][padding][shared data]`. The padding is at least
/// [`Function::BASE_PADDING_BYTES`] and every one of its bytes is the `ret`
/// opcode, so an executor that overruns the code space halts before
/// touching the shared data; it also keeps the shared space pointer-aligned
pub struct Function {
  instruction_count: u16,
  shared_size: u16,
  padding_bytes: u8,
  shared_offset: u32,
  first_run: Cell<bool>,
  handler: Cell<Option<HandlerFunc>>,
  reloc: Option<NonNull<RelocationTable>>,
  body: Body,
}

impl Function {
  /// The size in bytes of one instruction word
  pub const INS_WIDTH: u32 = 4;

  /// The minimum padding between the code space and the shared space:
  /// one full `ret` instruction word. Alignment of the shared space may
  /// require additional bytes
  pub const BASE_PADDING_BYTES: u32 = 4;

  /// Create a Function wrapping a native callable.
  /// All bytecode-layout fields are zero
  pub fn new_native (native: NativeFunc) -> Self {
    Self {
      instruction_count: 0,
      shared_size: 0,
      padding_bytes: 0,
      shared_offset: 0,
      first_run: Cell::new(true),
      handler: Cell::new(None),
      reloc: None,
      body: Body::Native(native),
    }
  }

  /// Allocate the combined code + shared region for a bytecode Function.
  ///
  /// The code space must be populated afterwards through
  /// [`Function::store_instruction`]; every byte of the region starts out
  /// as the `ret` opcode. `reloc` is the table consulted by the
  /// cross-referencing instructions, if the routine uses any
  ///
  /// # Safety
  /// When given, `reloc` must outlive the Function
  pub unsafe fn new_bytecode (
    allocator: &Arc<CoreAllocator>,
    reloc: Option<NonNull<RelocationTable>>,
    instruction_count: u16,
    shared_size: u16,
  ) -> Result<Self, MemoryError> {
    let code_bytes = Self::INS_WIDTH * instruction_count as u32;

    let padding = Self::BASE_PADDING_BYTES + get_align_offset(
      (code_bytes + Self::BASE_PADDING_BYTES) as usize,
      align_of::<*const u8>()
    ) as u32;

    let shared_offset = code_bytes + padding;
    let total = shared_offset + shared_size as u32;

    let region = allocator
      .request_array::<u8>(total, DEFAULT_ALLOC_FLAGS, Opcode::Ret as u8)
      .ok_or_else(|| allocator.last_error().unwrap_or(MemoryError::HitOsMaximum))?;

    Ok(Self {
      instruction_count,
      shared_size,
      padding_bytes: padding as u8,
      shared_offset,
      first_run: Cell::new(true),
      handler: Cell::new(None),
      reloc,
      body: Body::Bytecode {
        allocator: Arc::clone(allocator),
        region: MemoryAddress::from_raw(region),
      },
    })
  }

// QUERY: //

  /// True if this Function is comprised of VM bytecode
  pub fn is_bytecode (&self) -> bool {
    matches!(self.body, Body::Bytecode { .. })
  }

  /// True if this Function wraps a native callable
  pub fn is_native (&self) -> bool {
    matches!(self.body, Body::Native(_))
  }

  /// True until the executor has observed this Function at least once;
  /// gates the one-shot static validation pass
  pub fn is_first_run (&self) -> bool {
    self.first_run.get()
  }

  /// Record that the executor has observed this Function
  pub fn mark_used (&self) {
    self.first_run.set(false)
  }

  /// Install an exception handler for this Function, replacing the VM's
  /// default fatal-on-everything handler
  pub fn install_handler (&self, handler: HandlerFunc) {
    self.handler.set(Some(handler))
  }

  /// The exception handler installed on this Function, if any
  pub fn handler (&self) -> Option<HandlerFunc> {
    self.handler.get()
  }

// GETTERS: //

  /// The relocation table consulted by this Function's bytecode, if any
  pub fn reloc_table (&self) -> Option<NonNull<RelocationTable>> {
    self.reloc
  }

  /// The native callable, when this Function wraps one
  pub fn native_func (&self) -> Option<NativeFunc> {
    match self.body {
      Body::Native(native) => Some(native),
      Body::Bytecode { .. } => None
    }
  }

  fn region (&self) -> Option<MemoryAddress> {
    match &self.body {
      Body::Bytecode { region, .. } => Some(*region),
      Body::Native(_) => None
    }
  }

  /// A pointer to the code space, when this Function holds bytecode and
  /// has at least one instruction
  pub fn code_space (&self) -> Option<NonNull<u8>> {
    if self.instruction_count == 0 { return None }
    self.region().map(|region| unsafe { NonNull::new_unchecked(region.as_ptr()) })
  }

  /// A pointer to the shared space, when this Function holds bytecode and
  /// has a shared region
  pub fn shared_space (&self) -> Option<NonNull<u8>> {
    if self.shared_size == 0 { return None }
    self.region().map(|region| unsafe {
      NonNull::new_unchecked(region.as_ptr().add(self.shared_offset as usize))
    })
  }

  /// The number of instruction words in the code space, wide-immediate
  /// continuation words included
  pub fn instruction_count (&self) -> u16 {
    self.instruction_count
  }

  /// The size in bytes of the shared space
  pub fn shared_size (&self) -> u16 {
    self.shared_size
  }

  /// The number of padding bytes between code space and shared space
  pub fn padding_bytes (&self) -> u8 {
    self.padding_bytes
  }

  /// The byte offset of the shared space within the region
  pub fn shared_offset (&self) -> u32 {
    self.shared_offset
  }

  /// The number of words an executor may fetch: the code space plus the
  /// `ret`-filled padding
  pub fn executable_words (&self) -> u32 {
    self.shared_offset / Self::INS_WIDTH
  }

// CODE ACCESS: //

  /// Read the word at `word_idx`, which may land in the padding region.
  /// Returns None past the padding or for native functions
  pub fn fetch (&self, word_idx: u32) -> Option<Instruction> {
    if word_idx >= self.executable_words() { return None }

    let region = self.region()?;

    let mut bytes = [0u8; 4];
    unsafe {
      std::ptr::copy_nonoverlapping(
        region.as_ptr().add((word_idx * Self::INS_WIDTH) as usize),
        bytes.as_mut_ptr(),
        4
      )
    }

    Some(Instruction::from_bytes(bytes))
  }

  /// Write an instruction word into the code space.
  /// Returns false when the index is out of bounds or this Function is
  /// native. Code must not be modified once execution has begun
  pub fn store_instruction (&mut self, word_idx: u16, ins: Instruction) -> bool {
    if word_idx >= self.instruction_count { return false }

    let region = match self.region() {
      Some(region) => region,
      None => return false
    };

    unsafe {
      std::ptr::copy_nonoverlapping(
        ins.to_bytes().as_ptr(),
        region.as_ptr().add((word_idx as u32 * Self::INS_WIDTH) as usize),
        4
      )
    }

    true
  }

  /// Read a byte anywhere in the region; code, padding, or shared space
  pub fn region_byte (&self, offset: u32) -> Option<u8> {
    let region = self.region()?;
    if offset >= self.shared_offset + self.shared_size as u32 { return None }

    Some(unsafe { region.as_ptr().add(offset as usize).read() })
  }

  /// Write a byte into the shared space at `offset`
  pub fn store_shared (&mut self, offset: u16, value: u8) -> bool {
    if offset >= self.shared_size { return false }

    match self.region() {
      Some(region) => {
        unsafe { region.as_ptr().add((self.shared_offset + offset as u32) as usize).write(value) }
        true
      },
      None => false
    }
  }
}

impl Drop for Function {
  fn drop (&mut self) {
    // The region is managed as one block; a single release frees code,
    // padding, and shared space together
    if let Body::Bytecode { allocator, region } = &self.body {
      allocator.release(*region)
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::exception::HandlerResult;

  fn alloc () -> Arc<CoreAllocator> {
    Arc::new(CoreAllocator::new())
  }

  fn probe (_state: &mut crate::vm::ExecState) -> HandlerResult {
    HandlerResult::NoException
  }

  #[test]
  fn test_native_function () {
    let func = Function::new_native(probe);

    assert!(func.is_native());
    assert!(!func.is_bytecode());
    assert!(func.native_func().is_some());
    assert!(func.code_space().is_none());
    assert!(func.shared_space().is_none());
    assert_eq!(func.instruction_count(), 0);
    assert_eq!(func.shared_offset(), 0);
    assert!(func.is_first_run());
  }

  #[test]
  fn test_padding_is_ret () {
    let alloc = alloc();
    let func = unsafe { Function::new_bytecode(&alloc, None, 1, 0).unwrap() };

    assert_eq!(func.padding_bytes(), 4);
    assert_eq!(func.shared_offset(), 8);
    assert_eq!(func.shared_offset() as usize % align_of::<*const u8>(), 0);

    // Bytes 4 and 7 sit in the padding region and read as ret
    assert_eq!(func.region_byte(4), Some(Opcode::Ret as u8));
    assert_eq!(func.region_byte(7), Some(Opcode::Ret as u8));

    // Every padding byte is ret
    for k in 0..func.padding_bytes() as u32 {
      assert_eq!(
        func.region_byte(Function::INS_WIDTH * func.instruction_count() as u32 + k),
        Some(Opcode::Ret as u8)
      );
    }
  }

  #[test]
  fn test_layout_invariants () {
    let alloc = alloc();

    for (count, shared) in [(0u16, 0u16), (1, 8), (2, 0), (3, 16), (7, 3), (100, 255)] {
      let func = unsafe { Function::new_bytecode(&alloc, None, count, shared).unwrap() };

      assert!(func.padding_bytes() as u32 >= Function::BASE_PADDING_BYTES);
      assert_eq!(func.shared_offset() as usize % align_of::<*const u8>(), 0);
      assert_eq!(
        func.shared_offset(),
        Function::INS_WIDTH * count as u32 + func.padding_bytes() as u32
      );
      assert_eq!(func.shared_size(), shared);

      for k in 0..func.padding_bytes() as u32 {
        assert_eq!(
          func.region_byte(Function::INS_WIDTH * count as u32 + k),
          Some(Opcode::Ret as u8)
        );
      }
    }
  }

  #[test]
  fn test_store_and_fetch () {
    let alloc = alloc();
    let mut func = unsafe { Function::new_bytecode(&alloc, None, 2, 0).unwrap() };

    // The untouched code space decodes as ret
    assert_eq!(func.fetch(0).unwrap().opcode(), Some(Opcode::Ret));

    assert!(func.store_instruction(0, Instruction::imm16(Opcode::MovImm, 0, 42)));
    assert!(func.store_instruction(1, Instruction::any(Opcode::Ret)));
    assert!(!func.store_instruction(2, Instruction::any(Opcode::Nop)));

    let ins = func.fetch(0).unwrap();
    assert_eq!(ins.opcode(), Some(Opcode::MovImm));
    assert_eq!(ins.imm16_value(), 42);

    // Fetch past the code space lands in ret padding, then ends
    assert_eq!(func.fetch(2).unwrap().opcode(), Some(Opcode::Ret));
    assert!(func.fetch(func.executable_words()).is_none());
  }

  #[test]
  fn test_shared_space () {
    let alloc = alloc();
    let mut func = unsafe { Function::new_bytecode(&alloc, None, 1, 4).unwrap() };

    assert!(func.shared_space().is_some());
    assert!(func.store_shared(0, 0xAA));
    assert!(func.store_shared(3, 0xBB));
    assert!(!func.store_shared(4, 0xCC));

    assert_eq!(func.region_byte(func.shared_offset()), Some(0xAA));
    assert_eq!(func.region_byte(func.shared_offset() + 3), Some(0xBB));
  }

  #[test]
  fn test_first_run_gate () {
    let alloc = alloc();
    let func = unsafe { Function::new_bytecode(&alloc, None, 1, 0).unwrap() };

    assert!(func.is_first_run());
    func.mark_used();
    assert!(!func.is_first_run());
  }

  #[test]
  fn test_region_released_whole () {
    let alloc = alloc();

    {
      let _func = unsafe { Function::new_bytecode(&alloc, None, 8, 32).unwrap() };
      assert!(alloc.object_bytes() > 0);
    }

    assert_eq!(alloc.object_bytes(), 0);
  }
}
