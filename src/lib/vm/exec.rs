//! The executor: per-activation state, static validation, and dispatch

use std::{
  ops::{ BitAnd, BitOr, BitXor },
  ptr::{ self, NonNull },
};

use crate::{
  exception::{ Exception, ExceptionKind, HandlerResult },
  function::Function,
  instruction::{ Instruction, Opcode, Shape },
  memory::{ CoreAllocator, MemoryAddress, DEFAULT_ALLOC_FLAGS },
  storage::{ FlatStorage, Symbol, SymbolType },
  thread_memory::ThreadMemory,
};

use super::{ Register, VirtualProcessor, Vm };


/// The terminal state of one function activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
  /// The function executed a `ret`
  Returned,
  /// A handler returned Fatal; the fault propagates upward
  Faulted,
}


/// The bundle threaded through every instruction handler and native
/// function: the VM, the instruction pointer, the activation's register
/// file, the executing processor, and the current function.
///
/// Registers belong to the activation: every entry to a bytecode function
/// starts with a cleared file, and a caller's registers are untouched by
/// its callees. Values cross activations through the thread stack
pub struct ExecState<'a> {
  /// The VM owning the shared runtime structures
  pub vm: &'a Vm,
  /// The instruction pointer, as a word index into the code region.
  /// While a handler runs it has already advanced past the offender
  pub ip: u32,
  /// The activation's register file
  pub registers: [Register; Register::COUNT],
  /// The executing processor
  pub vp: &'a mut VirtualProcessor,
  /// The currently executing function
  pub func: &'a Function,
}

impl<'a> ExecState<'a> {
  fn new (vm: &'a Vm, vp: &'a mut VirtualProcessor, func: &'a Function) -> Self {
    Self {
      vm,
      ip: 0,
      registers: [Register::default(); Register::COUNT],
      vp,
      func,
    }
  }

  /// Read one register. Indices wrap into the file
  pub fn reg (&self, idx: u8) -> Register {
    self.registers[idx as usize & (Register::COUNT - 1)]
  }

  /// Access one register mutably. Indices wrap into the file
  pub fn reg_mut (&mut self, idx: u8) -> &mut Register {
    &mut self.registers[idx as usize & (Register::COUNT - 1)]
  }

  /// The VM's core allocator
  pub fn allocator (&self) -> &CoreAllocator {
    self.vm.allocator()
  }

  /// The VM's symbol store
  pub fn storage (&self) -> &FlatStorage {
    self.vm.storage()
  }

  /// The executing processor's thread memory
  pub fn memory (&mut self) -> &mut ThreadMemory {
    self.vp.memory_mut()
  }
}


enum Flow {
  Continue,
  Return,
  Raise(ExceptionKind),
  /// A callee faulted fatally; halt this activation too
  Abort,
}


fn handler_for (state: &ExecState) -> crate::exception::HandlerFunc {
  state.func.handler().unwrap_or_else(|| state.vm.handler())
}

fn handle (state: &mut ExecState, exception: Exception) -> HandlerResult {
  let handler = handler_for(state);
  handler(exception, state)
}


/// Execute `func` on `vp` until it returns or faults.
///
/// Bytecode activations get a cleared register file and their own local
/// frame (dropped on exit). The first observation of a function runs the
/// one-shot static validation pass before anything executes
pub fn run (vm: &Vm, vp: &mut VirtualProcessor, func: &Function) -> ExecOutcome {
  if let Some(native) = func.native_func() {
    func.mark_used();

    let mut state = ExecState::new(vm, vp, func);
    return match native(&mut state) {
      HandlerResult::Fatal => ExecOutcome::Faulted,
      _ => ExecOutcome::Returned
    }
  }

  if func.is_first_run() {
    if !validate(vm, vp, func) { return ExecOutcome::Faulted }
    func.mark_used();
  }

  let opened_frame = vp.memory().local_size() > 0 && vp.memory_mut().frame_new();

  let mut state = ExecState::new(vm, vp, func);
  let outcome = exec_loop(&mut state);

  if opened_frame { vp.memory_mut().frame_drop(); }

  outcome
}

fn exec_loop (state: &mut ExecState) -> ExecOutcome {
  loop {
    let base = state.ip;

    let ins = match state.func.fetch(base) {
      Some(ins) => ins,
      // The pointer left the executable region entirely; the ret padding
      // normally halts execution long before this is reachable
      None => {
        let exception = Exception::bytecode(
          ExceptionKind::InstructionOverflow,
          Instruction::any(Opcode::Ret),
          false
        );
        return match handle(state, exception) {
          HandlerResult::Fatal => ExecOutcome::Faulted,
          _ => ExecOutcome::Returned
        }
      }
    };

    let op = match ins.opcode() {
      Some(op) => op,
      None => {
        state.ip = base + 1;
        state.vp.count_step();

        let exception = Exception::bytecode(ExceptionKind::InstructionOverflow, ins, false);
        match handle(state, exception) {
          HandlerResult::Fatal => return ExecOutcome::Faulted,
          _ => continue
        }
      }
    };

    let width = op.word_count();

    let mut imm = [0u32; 2];
    let mut truncated = false;
    for k in 1..width {
      match state.func.fetch(base + k) {
        Some(word) => imm[(k - 1) as usize] = word.imm_value(),
        None => truncated = true
      }
    }

    // The pointer advances by the instruction's full width before
    // dispatch, so an Ignored verdict simply skips the operation
    state.ip = base + width;
    state.vp.count_step();

    if truncated {
      let exception = Exception::bytecode(ExceptionKind::InstructionOverflow, ins, false);
      match handle(state, exception) {
        HandlerResult::Fatal => return ExecOutcome::Faulted,
        _ => continue
      }
    }

    match dispatch(state, op, ins, imm) {
      Flow::Continue => {},
      Flow::Return => return ExecOutcome::Returned,
      Flow::Abort => return ExecOutcome::Faulted,
      Flow::Raise(kind) => {
        let exception = Exception::bytecode(kind, ins, false);
        match handle(state, exception) {
          HandlerResult::Fatal => return ExecOutcome::Faulted,
          _ => {}
        }
      }
    }
  }
}


// STATIC VALIDATION: //

fn check_reg (field: u8, required: bool) -> Option<ExceptionKind> {
  if field == Instruction::UNUSED_REG {
    if required { Some(ExceptionKind::InvalidUnusedRegister) } else { None }
  } else if field as usize >= Register::COUNT {
    Some(ExceptionKind::InvalidRegisterAccess)
  } else {
    None
  }
}

fn check_instruction (ins: Instruction, code_words: u32) -> Option<ExceptionKind> {
  use Opcode::*;

  let op = match ins.opcode() {
    Some(op) => op,
    None => return Some(ExceptionKind::InstructionOverflow)
  };

  let faults = match op.shape() {
    Shape::Any | Shape::Opt32 => None,

    Shape::OneReg => check_reg(ins.rx(), true),

    Shape::TwoReg => check_reg(ins.rx(), true).or_else(|| check_reg(ins.ry(), true)),

    Shape::ThreeReg => check_reg(ins.rx(), true)
      .or_else(|| check_reg(ins.ry(), true))
      .or_else(|| check_reg(ins.rz(), true)),

    Shape::Imm16 => {
      // Pure-transfer instructions carry no register operand
      let rx_required = !matches!(op, Jmp | Call | CoreCall | SpawnAnon);
      check_reg(ins.rx(), rx_required)
    },

    // Packed 4-bit fields always name a real register
    Shape::Imm16Alt => None,

    Shape::MemAccess => check_reg(ins.rz(), false),

    Shape::MemAccessPriv => check_reg(ins.rx(), true).or_else(|| check_reg(ins.ry(), true)),
  };

  if faults.is_some() { return faults }

  // Static jump targets must land inside the code space
  let is_jump = matches!(op, Jmp | JmpIs0 | JmpNot0 | JmpEq | JmpNeq | JmpLt | JmpGt | JmpLtEq | JmpGtEq);
  if is_jump && ins.imm16_value() as u32 >= code_words {
    return Some(ExceptionKind::InstructionOverflow)
  }

  None
}

/// Walk the code space once, checking register fields, static jump
/// targets, and wide-immediate truncation, raising each fault through the
/// installed handler. Returns false when any fault was fatal
fn validate (vm: &Vm, vp: &mut VirtualProcessor, func: &Function) -> bool {
  let code_words = func.instruction_count() as u32;
  let mut word = 0u32;

  while word < code_words {
    let ins = match func.fetch(word) {
      Some(ins) => ins,
      None => break
    };

    let width = ins.opcode().map(Opcode::word_count).unwrap_or(1);

    let mut fault = check_instruction(ins, code_words);
    if fault.is_none() && word + width > code_words {
      // A wide instruction's continuation words ran off the code space
      fault = Some(ExceptionKind::InstructionOverflow);
    }

    if let Some(kind) = fault {
      let exception = Exception::bytecode(kind, ins, true);
      let mut state = ExecState::new(vm, &mut *vp, func);
      state.ip = word;

      let handler = handler_for(&state);
      if handler(exception, &mut state) == HandlerResult::Fatal {
        return false
      }
    }

    word += width;
  }

  true
}


// RELOCATION ACCESS: //

fn resolve_symbol (state: &mut ExecState, idx: u16) -> Option<NonNull<Symbol>> {
  let reloc = state.func.reloc_table()?;
  unsafe { (*reloc.as_ptr()).retrieve_idx(idx as u32) }
}

fn resolve_function (state: &mut ExecState, idx: u16) -> Option<NonNull<Function>> {
  let symbol = resolve_symbol(state, idx)?;
  let symbol = unsafe { symbol.as_ref() };

  if symbol.kind != SymbolType::Func { return None }

  NonNull::new(symbol.cast_value::<Function>())
}

fn spawn_function (vm: &Vm, func: &Function) -> Result<u16, ExceptionKind> {
  let id = vm.reserve_spawn_id();

  let mut vp = vm.make_processor(id).map_err(|_| ExceptionKind::HeapOutOfMemory)?;

  // The spawned activation runs to completion here; the processor is
  // parked afterwards regardless of its outcome so its stack can still
  // be merged from
  run(vm, &mut vp, func);
  vm.fill_spawn_slot(id, vp);

  Ok(id)
}


// DISPATCH: //

fn jump (state: &mut ExecState, target: u64) -> Flow {
  if target >= state.func.executable_words() as u64 {
    return Flow::Raise(ExceptionKind::InstructionOverflow)
  }

  state.ip = target as u32;
  Flow::Continue
}

fn gload (state: &mut ExecState, ins: Instruction, width: u32) -> Flow {
  let index = if ins.rz() == Instruction::UNUSED_REG {
    0
  } else {
    state.reg(ins.rz()).as_u64()
  };

  let addr = state.reg(ins.packed_ry()).as_u64()
    .wrapping_add(index.wrapping_mul(ins.scale() as u64));
  let src = addr as usize as *const u8;

  let value = unsafe {
    match width {
      1 => src.read() as u64,
      2 => (src as *const u16).read_unaligned() as u64,
      4 => (src as *const u32).read_unaligned() as u64,
      _ => (src as *const u64).read_unaligned(),
    }
  };

  state.reg_mut(ins.packed_rx()).set_u64(value);
  Flow::Continue
}

fn gsave (state: &mut ExecState, ins: Instruction, width: u32) -> Flow {
  let index = if ins.rz() == Instruction::UNUSED_REG {
    0
  } else {
    state.reg(ins.rz()).as_u64()
  };

  let addr = state.reg(ins.packed_ry()).as_u64()
    .wrapping_add(index.wrapping_mul(ins.scale() as u64));
  let dst = addr as usize as *mut u8;

  let value = state.reg(ins.packed_rx()).as_u64();

  unsafe {
    match width {
      1 => dst.write(value as u8),
      2 => (dst as *mut u16).write_unaligned(value as u16),
      4 => (dst as *mut u32).write_unaligned(value as u32),
      _ => (dst as *mut u64).write_unaligned(value),
    }
  }

  Flow::Continue
}

fn private_ptr (state: &mut ExecState, ins: Instruction, width: u32) -> Result<*mut u8, ExceptionKind> {
  let scale = ins.scale().max(1) as u64;
  let offset = state.reg(ins.ry()).as_u64().wrapping_mul(scale);

  let memory = state.vp.memory_mut();
  if !memory.local_valid() { return Err(ExceptionKind::LocalUnset) }

  // The whole accessed span must sit inside the frame's bytes
  let last = offset + width as u64 - 1;
  if last > u32::MAX as u64 || memory.get_at(last as u32).is_none() {
    return Err(ExceptionKind::LocalAccessOverflow)
  }

  Ok(memory.get_at(offset as u32).unwrap().as_ptr())
}

fn pload (state: &mut ExecState, ins: Instruction, width: u32) -> Flow {
  let src = match private_ptr(state, ins, width) {
    Ok(ptr) => ptr as *const u8,
    Err(kind) => return Flow::Raise(kind)
  };

  let value = unsafe {
    match width {
      1 => src.read() as u64,
      2 => (src as *const u16).read_unaligned() as u64,
      4 => (src as *const u32).read_unaligned() as u64,
      _ => (src as *const u64).read_unaligned(),
    }
  };

  state.reg_mut(ins.rx()).set_u64(value);
  Flow::Continue
}

fn psave (state: &mut ExecState, ins: Instruction, width: u32) -> Flow {
  let dst = match private_ptr(state, ins, width) {
    Ok(ptr) => ptr,
    Err(kind) => return Flow::Raise(kind)
  };

  let value = state.reg(ins.rx()).as_u64();

  unsafe {
    match width {
      1 => dst.write(value as u8),
      2 => (dst as *mut u16).write_unaligned(value as u16),
      4 => (dst as *mut u32).write_unaligned(value as u32),
      _ => (dst as *mut u64).write_unaligned(value),
    }
  }

  Flow::Continue
}

macro_rules! bin_u64 {
  ($state:expr, $ins:expr, $op:ident) => {{
    let a = $state.reg($ins.ry()).as_u64();
    let b = $state.reg($ins.rz()).as_u64();
    $state.reg_mut($ins.rx()).set_u64(a.$op(b));
    Flow::Continue
  }};
}

macro_rules! div_u64 {
  ($state:expr, $ins:expr, $op:ident) => {{
    let b = $state.reg($ins.rz()).as_u64();
    if b == 0 { Flow::Raise(ExceptionKind::DivideByZeroU) }
    else {
      let a = $state.reg($ins.ry()).as_u64();
      $state.reg_mut($ins.rx()).set_u64(a.$op(b));
      Flow::Continue
    }
  }};
}

macro_rules! div_i64 {
  ($state:expr, $ins:expr, $op:ident) => {{
    let b = $state.reg($ins.rz()).as_i64();
    if b == 0 { Flow::Raise(ExceptionKind::DivideByZeroI) }
    else {
      let a = $state.reg($ins.ry()).as_i64();
      $state.reg_mut($ins.rx()).set_i64(a.$op(b));
      Flow::Continue
    }
  }};
}

macro_rules! bin_f32 {
  ($state:expr, $ins:expr, $op:tt) => {{
    let a = $state.reg($ins.ry()).as_f32();
    let b = $state.reg($ins.rz()).as_f32();
    $state.reg_mut($ins.rx()).set_f32(a $op b);
    Flow::Continue
  }};
}

macro_rules! div_f32 {
  ($state:expr, $ins:expr, $op:tt) => {{
    let b = $state.reg($ins.rz()).as_f32();
    if b == 0.0 { Flow::Raise(ExceptionKind::DivideByZeroF) }
    else {
      let a = $state.reg($ins.ry()).as_f32();
      $state.reg_mut($ins.rx()).set_f32(a $op b);
      Flow::Continue
    }
  }};
}

macro_rules! bin_f64 {
  ($state:expr, $ins:expr, $op:tt) => {{
    let a = $state.reg($ins.ry()).as_f64();
    let b = $state.reg($ins.rz()).as_f64();
    $state.reg_mut($ins.rx()).set_f64(a $op b);
    Flow::Continue
  }};
}

macro_rules! div_f64 {
  ($state:expr, $ins:expr, $op:tt) => {{
    let b = $state.reg($ins.rz()).as_f64();
    if b == 0.0 { Flow::Raise(ExceptionKind::DivideByZeroD) }
    else {
      let a = $state.reg($ins.ry()).as_f64();
      $state.reg_mut($ins.rx()).set_f64(a $op b);
      Flow::Continue
    }
  }};
}

macro_rules! cmp_via {
  ($state:expr, $ins:expr, $read:ident, $op:tt) => {{
    let a = $state.reg($ins.ry()).$read();
    let b = $state.reg($ins.rz()).$read();
    $state.reg_mut($ins.rx()).set_u64((a $op b) as u64);
    Flow::Continue
  }};
}

macro_rules! imm_u64 {
  ($state:expr, $ins:expr, $op:ident) => {{
    let rx = $ins.rx();
    let value = $state.reg(rx).as_u64().$op($ins.imm16_value() as u64);
    $state.reg_mut(rx).set_u64(value);
    Flow::Continue
  }};
}

fn dispatch (state: &mut ExecState, op: Opcode, ins: Instruction, imm: [u32; 2]) -> Flow {
  use Opcode::*;

  match op {

  // GENERIC: //

    Nop => Flow::Continue,

    Chrono => {
      let steps = state.vp.steps();
      state.reg_mut(ins.rx()).set_u64(steps);
      Flow::Continue
    },

  // CONTROL: FLOW: //

    Seek => {
      let target = state.reg(ins.rx()).as_u64();
      jump(state, target)
    },

    Jmp => jump(state, ins.imm16_value() as u64),

    JmpIs0 => {
      if state.reg(ins.rx()).as_u64() == 0 { jump(state, ins.imm16_value() as u64) }
      else { Flow::Continue }
    },

    JmpNot0 => {
      if state.reg(ins.rx()).as_u64() != 0 { jump(state, ins.imm16_value() as u64) }
      else { Flow::Continue }
    },

    JmpEq | JmpNeq | JmpLt | JmpGt | JmpLtEq | JmpGtEq => {
      let a = state.reg(ins.packed_rx()).as_u64();
      let b = state.reg(ins.packed_ry()).as_u64();

      let taken = match op {
        JmpEq => a == b,
        JmpNeq => a != b,
        JmpLt => a < b,
        JmpGt => a > b,
        JmpLtEq => a <= b,
        _ => a >= b,
      };

      if taken { jump(state, ins.imm16_value() as u64) } else { Flow::Continue }
    },

    Call => match resolve_function(state, ins.imm16_value()) {
      Some(callee) => {
        let callee = unsafe { callee.as_ref() };
        match run(state.vm, state.vp, callee) {
          ExecOutcome::Returned => Flow::Continue,
          ExecOutcome::Faulted => Flow::Abort,
        }
      },
      None => Flow::Raise(ExceptionKind::InstructionOverflow)
    },

    CoreCall => match state.vm.service(ins.imm16_value()) {
      Some(service) => match service(state) {
        HandlerResult::Fatal => Flow::Abort,
        _ => Flow::Continue
      },
      None => Flow::Raise(ExceptionKind::InstructionOverflow)
    },

    Spawn | SpawnAnon => match resolve_function(state, ins.imm16_value()) {
      Some(callee) => {
        let callee = unsafe { callee.as_ref() };
        match spawn_function(state.vm, callee) {
          Ok(id) => {
            if op == Spawn { state.reg_mut(ins.rx()).set_u64(id as u64) }
            Flow::Continue
          },
          Err(kind) => Flow::Raise(kind)
        }
      },
      None => Flow::Raise(ExceptionKind::InstructionOverflow)
    },

    Merge => {
      let id = state.reg(ins.rx()).as_u64() as u16;
      let size = state.reg(ins.ry()).as_u64() as u32;

      let vm = state.vm;
      let memory = state.vp.memory_mut();

      match vm.with_spawned(id, |other| memory.merge(other.memory_mut(), size)) {
        None => Flow::Raise(ExceptionKind::StackUnset),
        Some(ThreadMemory::MERGE_FAILURE) => Flow::Raise(ExceptionKind::StackUnderflow),
        Some(n) if n < 0 => Flow::Raise(ExceptionKind::StackOverflow),
        Some(_) => Flow::Continue
      }
    },

    // Reserved escape instructions; the immediate word selects an
    // extended operation in future ISA revisions
    MuOp | CvOp => Flow::Continue,

    Ret => Flow::Return,

  // REGISTERS: //

    Clr => {
      state.reg_mut(ins.rx()).clear();
      Flow::Continue
    },

    Mov => {
      let value = state.reg(ins.ry());
      *state.reg_mut(ins.rx()) = value;
      Flow::Continue
    },

    MovImm => {
      state.reg_mut(ins.rx()).set_u64(ins.imm16_value() as u64);
      Flow::Continue
    },

    MovImm32 | MovImmF => {
      state.reg_mut(ins.rx()).set_u64(imm[0] as u64);
      Flow::Continue
    },

    MovImm64 | MovImmD => {
      state.reg_mut(ins.rx()).set_u64(imm[0] as u64 | (imm[1] as u64) << 32);
      Flow::Continue
    },

  // STACK: //

    PushReg | PushArg => {
      if !state.memory().stack_valid() { return Flow::Raise(ExceptionKind::StackUnset) }

      let value = state.reg(ins.rx()).as_u64();
      if state.memory().push64(value) < 0 { Flow::Raise(ExceptionKind::StackOverflow) }
      else { Flow::Continue }
    },

    PopReg | PopArg => {
      if !state.memory().stack_valid() { return Flow::Raise(ExceptionKind::StackUnset) }

      let result = state.memory().pop64();
      if result.valid {
        state.reg_mut(ins.rx()).set_u64(result.value);
        Flow::Continue
      } else {
        Flow::Raise(ExceptionKind::StackUnderflow)
      }
    },

    PushGen => {
      if !state.memory().stack_valid() { return Flow::Raise(ExceptionKind::StackUnset) }

      let value = state.reg(ins.rx()).as_u64();
      let pushed = match ins.imm16_value() {
        1 => state.memory().push8(value as u8),
        2 => state.memory().push16(value as u16),
        4 => state.memory().push32(value as u32),
        8 => state.memory().push64(value),
        _ => return Flow::Raise(ExceptionKind::InstructionOverflow)
      };

      if pushed < 0 { Flow::Raise(ExceptionKind::StackOverflow) } else { Flow::Continue }
    },

    PopGen => {
      if !state.memory().stack_valid() { return Flow::Raise(ExceptionKind::StackUnset) }

      let result = match ins.imm16_value() {
        1 => state.memory().pop8(),
        2 => state.memory().pop16(),
        4 => state.memory().pop32(),
        8 => state.memory().pop64(),
        _ => return Flow::Raise(ExceptionKind::InstructionOverflow)
      };

      if result.valid {
        state.reg_mut(ins.rx()).set_u64(result.value);
        Flow::Continue
      } else {
        Flow::Raise(ExceptionKind::StackUnderflow)
      }
    },

    PushAll => {
      if !state.memory().stack_valid() { return Flow::Raise(ExceptionKind::StackUnset) }
      if (state.memory().stack_remaining() as usize) < Register::COUNT * 8 {
        return Flow::Raise(ExceptionKind::StackOverflow)
      }

      for idx in 0..Register::COUNT as u8 {
        let value = state.reg(idx).as_u64();
        state.memory().push64(value);
      }

      Flow::Continue
    },

    PopAll => {
      if !state.memory().stack_valid() { return Flow::Raise(ExceptionKind::StackUnset) }
      if (state.memory().stack_usage() as usize) < Register::COUNT * 8 {
        return Flow::Raise(ExceptionKind::StackUnderflow)
      }

      for idx in (0..Register::COUNT as u8).rev() {
        let value = state.memory().pop64().value;
        state.reg_mut(idx).set_u64(value);
      }

      Flow::Continue
    },

    PushMem => {
      if !state.memory().stack_valid() { return Flow::Raise(ExceptionKind::StackUnset) }

      let src = state.reg(ins.rx()).as_ptr();
      let size = state.reg(ins.ry()).as_u64() as usize;
      let bytes = unsafe { std::slice::from_raw_parts(src, size) };

      if state.memory().push_mem(bytes) < 0 { Flow::Raise(ExceptionKind::StackOverflow) }
      else { Flow::Continue }
    },

    PopMem => {
      if !state.memory().stack_valid() { return Flow::Raise(ExceptionKind::StackUnset) }

      let dst = state.reg(ins.rx()).as_ptr();
      let size = state.reg(ins.ry()).as_u64() as usize;
      let bytes = unsafe { std::slice::from_raw_parts_mut(dst, size) };

      if state.memory().pop_mem(bytes).valid { Flow::Continue }
      else { Flow::Raise(ExceptionKind::StackUnderflow) }
    },

  // MEMORY: GENERIC: //

    MemSet => {
      let dst = state.reg(ins.rx()).as_ptr();
      let value = state.reg(ins.ry()).as_u64() as u8;
      let len = state.reg(ins.rz()).as_u64() as usize;

      unsafe { ptr::write_bytes(dst, value, len) }
      Flow::Continue
    },

    MemCpy => {
      let dst = state.reg(ins.rx()).as_ptr();
      let src = state.reg(ins.ry()).as_ptr();
      let len = state.reg(ins.rz()).as_u64() as usize;

      unsafe { ptr::copy(src, dst, len) }
      Flow::Continue
    },

    Offset => bin_u64!(state, ins, wrapping_add),

    RequestBytes => {
      let size = state.reg(ins.ry()).as_u64();
      if size == 0 || size > CoreAllocator::MAX_ALLOCATION {
        return Flow::Raise(ExceptionKind::HeapOutOfMemory)
      }

      match state.allocator().request(size as u32, DEFAULT_ALLOC_FLAGS) {
        Some(addr) => {
          state.reg_mut(ins.rx()).set_ptr(addr.as_ptr());
          Flow::Continue
        },
        None => Flow::Raise(ExceptionKind::HeapOutOfMemory)
      }
    },

    ReleaseBytes => {
      if let Some(ptr) = NonNull::new(state.reg(ins.rx()).as_ptr()) {
        let addr = unsafe { MemoryAddress::from_raw(ptr) };
        state.allocator().release(addr);
      }
      Flow::Continue
    },

    RequestLocal => {
      let size = state.reg(ins.ry()).as_u64();

      let memory = state.vp.memory_mut();
      if !memory.local_valid() { return Flow::Raise(ExceptionKind::LocalUnset) }

      if size > u32::MAX as u64 { return Flow::Raise(ExceptionKind::LocalOutOfMemory) }

      match memory.request_bytes(size as u32) {
        Some(ptr) => {
          state.reg_mut(ins.rx()).set_ptr(ptr.as_ptr());
          Flow::Continue
        },
        None => Flow::Raise(ExceptionKind::LocalOutOfMemory)
      }
    },

    DropLocal => {
      let size = state.reg(ins.rx()).as_u64();

      let memory = state.vp.memory_mut();
      if !memory.local_valid() { return Flow::Raise(ExceptionKind::LocalUnset) }

      if size > u32::MAX as u64 || memory.drop_bytes(size as u32) < 0 {
        Flow::Raise(ExceptionKind::LocalAccessUnderflow)
      } else {
        Flow::Continue
      }
    },

    ELoad => match resolve_symbol(state, ins.imm16_value()) {
      Some(symbol) => {
        let value = unsafe { symbol.as_ref() }.value;
        state.reg_mut(ins.rx()).set_ptr(value);
        Flow::Continue
      },
      None => Flow::Raise(ExceptionKind::InstructionOverflow)
    },

    P2G => {
      let offset = state.reg(ins.ry()).as_u64();

      let memory = state.vp.memory_mut();
      if !memory.local_valid() { return Flow::Raise(ExceptionKind::LocalUnset) }

      if offset > u32::MAX as u64 { return Flow::Raise(ExceptionKind::LocalAccessOverflow) }

      match memory.get_at(offset as u32) {
        Some(ptr) => {
          state.reg_mut(ins.rx()).set_ptr(ptr.as_ptr());
          Flow::Continue
        },
        None => Flow::Raise(ExceptionKind::LocalAccessOverflow)
      }
    },

  // MEMORY: GLOBAL: //

    GLoad8 => gload(state, ins, 1),
    GLoad16 => gload(state, ins, 2),
    GLoad32 => gload(state, ins, 4),
    GLoad64 => gload(state, ins, 8),
    GSave8 => gsave(state, ins, 1),
    GSave16 => gsave(state, ins, 2),
    GSave32 => gsave(state, ins, 4),
    GSave64 => gsave(state, ins, 8),

  // MEMORY: PRIVATE: //

    PLoad8 => pload(state, ins, 1),
    PLoad16 => pload(state, ins, 2),
    PLoad32 => pload(state, ins, 4),
    PLoad64 => pload(state, ins, 8),
    PSave8 => psave(state, ins, 1),
    PSave16 => psave(state, ins, 2),
    PSave32 => psave(state, ins, 4),
    PSave64 => psave(state, ins, 8),

  // COMPARISON: //

    CmpIs0 => {
      let zero = state.reg(ins.ry()).as_u64() == 0;
      state.reg_mut(ins.rx()).set_u64(zero as u64);
      Flow::Continue
    },

    CmpNot0 => {
      let nonzero = state.reg(ins.ry()).as_u64() != 0;
      state.reg_mut(ins.rx()).set_u64(nonzero as u64);
      Flow::Continue
    },

    CmpEq => cmp_via!(state, ins, as_u64, ==),
    CmpNeq => cmp_via!(state, ins, as_u64, !=),
    CmpLt => cmp_via!(state, ins, as_u64, <),
    CmpGt => cmp_via!(state, ins, as_u64, >),
    CmpLtEq => cmp_via!(state, ins, as_u64, <=),
    CmpGtEq => cmp_via!(state, ins, as_u64, >=),

    CmpLtI => cmp_via!(state, ins, as_i64, <),
    CmpGtI => cmp_via!(state, ins, as_i64, >),
    CmpLtEqI => cmp_via!(state, ins, as_i64, <=),
    CmpGtEqI => cmp_via!(state, ins, as_i64, >=),

    CmpLtF => cmp_via!(state, ins, as_f32, <),
    CmpGtF => cmp_via!(state, ins, as_f32, >),
    CmpLtEqF => cmp_via!(state, ins, as_f32, <=),
    CmpGtEqF => cmp_via!(state, ins, as_f32, >=),

    CmpLtD => cmp_via!(state, ins, as_f64, <),
    CmpGtD => cmp_via!(state, ins, as_f64, >),
    CmpLtEqD => cmp_via!(state, ins, as_f64, <=),
    CmpGtEqD => cmp_via!(state, ins, as_f64, >=),

  // LOGICAL: //

    LAnd => {
      let a = state.reg(ins.ry()).as_u64() != 0;
      let b = state.reg(ins.rz()).as_u64() != 0;
      state.reg_mut(ins.rx()).set_u64((a && b) as u64);
      Flow::Continue
    },

    LOr => {
      let a = state.reg(ins.ry()).as_u64() != 0;
      let b = state.reg(ins.rz()).as_u64() != 0;
      state.reg_mut(ins.rx()).set_u64((a || b) as u64);
      Flow::Continue
    },

    LNot => {
      let zero = state.reg(ins.ry()).as_u64() == 0;
      state.reg_mut(ins.rx()).set_u64(zero as u64);
      Flow::Continue
    },

  // ARITHMETIC: //

    Inc => {
      let rx = ins.rx();
      let value = state.reg(rx).as_u64().wrapping_add(1);
      state.reg_mut(rx).set_u64(value);
      Flow::Continue
    },

    Dec => {
      let rx = ins.rx();
      let value = state.reg(rx).as_u64().wrapping_sub(1);
      state.reg_mut(rx).set_u64(value);
      Flow::Continue
    },

    I2F => {
      let value = state.reg(ins.ry()).as_i64() as f32;
      state.reg_mut(ins.rx()).set_f32(value);
      Flow::Continue
    },

    U2F => {
      let value = state.reg(ins.ry()).as_u64() as f32;
      state.reg_mut(ins.rx()).set_f32(value);
      Flow::Continue
    },

    I2D => {
      let value = state.reg(ins.ry()).as_i64() as f64;
      state.reg_mut(ins.rx()).set_f64(value);
      Flow::Continue
    },

    U2D => {
      let value = state.reg(ins.ry()).as_u64() as f64;
      state.reg_mut(ins.rx()).set_f64(value);
      Flow::Continue
    },

    F2I => {
      let value = state.reg(ins.ry()).as_f32() as i64;
      state.reg_mut(ins.rx()).set_i64(value);
      Flow::Continue
    },

    F2U => {
      let value = state.reg(ins.ry()).as_f32() as u64;
      state.reg_mut(ins.rx()).set_u64(value);
      Flow::Continue
    },

    F2D => {
      let value = state.reg(ins.ry()).as_f32() as f64;
      state.reg_mut(ins.rx()).set_f64(value);
      Flow::Continue
    },

    D2I => {
      let value = state.reg(ins.ry()).as_f64() as i64;
      state.reg_mut(ins.rx()).set_i64(value);
      Flow::Continue
    },

    D2U => {
      let value = state.reg(ins.ry()).as_f64() as u64;
      state.reg_mut(ins.rx()).set_u64(value);
      Flow::Continue
    },

    D2F => {
      let value = state.reg(ins.ry()).as_f64() as f32;
      state.reg_mut(ins.rx()).set_f32(value);
      Flow::Continue
    },

    Pow => {
      let a = state.reg(ins.ry()).as_u64();
      let b = state.reg(ins.rz()).as_u64();
      state.reg_mut(ins.rx()).set_u64(a.wrapping_pow(b as u32));
      Flow::Continue
    },

    PowI => {
      let a = state.reg(ins.ry()).as_i64();
      let b = state.reg(ins.rz()).as_u64();
      state.reg_mut(ins.rx()).set_i64(a.wrapping_pow(b as u32));
      Flow::Continue
    },

    PowF => {
      let a = state.reg(ins.ry()).as_f32();
      let b = state.reg(ins.rz()).as_f32();
      state.reg_mut(ins.rx()).set_f32(a.powf(b));
      Flow::Continue
    },

    PowD => {
      let a = state.reg(ins.ry()).as_f64();
      let b = state.reg(ins.rz()).as_f64();
      state.reg_mut(ins.rx()).set_f64(a.powf(b));
      Flow::Continue
    },

    Sqrt => {
      let value = (state.reg(ins.ry()).as_u64() as f64).sqrt() as u64;
      state.reg_mut(ins.rx()).set_u64(value);
      Flow::Continue
    },

    SqrtF => {
      let value = state.reg(ins.ry()).as_f32().sqrt();
      state.reg_mut(ins.rx()).set_f32(value);
      Flow::Continue
    },

    SqrtD => {
      let value = state.reg(ins.ry()).as_f64().sqrt();
      state.reg_mut(ins.rx()).set_f64(value);
      Flow::Continue
    },

    Add => bin_u64!(state, ins, wrapping_add),
    Sub => bin_u64!(state, ins, wrapping_sub),
    Mul => bin_u64!(state, ins, wrapping_mul),
    Div => div_u64!(state, ins, wrapping_div),
    Mod => div_u64!(state, ins, wrapping_rem),

    AddImm => imm_u64!(state, ins, wrapping_add),
    SubImm => imm_u64!(state, ins, wrapping_sub),
    MulImm => imm_u64!(state, ins, wrapping_mul),

    DivImm | ModImm => {
      let imm = ins.imm16_value() as u64;
      if imm == 0 { return Flow::Raise(ExceptionKind::DivideByZeroU) }

      let rx = ins.rx();
      let a = state.reg(rx).as_u64();
      let value = if op == DivImm { a / imm } else { a % imm };
      state.reg_mut(rx).set_u64(value);
      Flow::Continue
    },

    IDiv => div_i64!(state, ins, wrapping_div),
    IMod => div_i64!(state, ins, wrapping_rem),

    IDivImm | IModImm => {
      let imm = ins.imm16_value() as i16 as i64;
      if imm == 0 { return Flow::Raise(ExceptionKind::DivideByZeroI) }

      let rx = ins.rx();
      let a = state.reg(rx).as_i64();
      let value = if op == IDivImm { a.wrapping_div(imm) } else { a.wrapping_rem(imm) };
      state.reg_mut(rx).set_i64(value);
      Flow::Continue
    },

    FAdd => bin_f32!(state, ins, +),
    FSub => bin_f32!(state, ins, -),
    FMul => bin_f32!(state, ins, *),
    FDiv => div_f32!(state, ins, /),
    FMod => div_f32!(state, ins, %),

    DAdd => bin_f64!(state, ins, +),
    DSub => bin_f64!(state, ins, -),
    DMul => bin_f64!(state, ins, *),
    DDiv => div_f64!(state, ins, /),
    DMod => div_f64!(state, ins, %),

  // BITWISE: //

    And => bin_u64!(state, ins, bitand),
    Or => bin_u64!(state, ins, bitor),
    Xor => bin_u64!(state, ins, bitxor),

    Not => {
      let value = !state.reg(ins.ry()).as_u64();
      state.reg_mut(ins.rx()).set_u64(value);
      Flow::Continue
    },

    Shl => {
      let a = state.reg(ins.ry()).as_u64();
      let b = state.reg(ins.rz()).as_u64();
      state.reg_mut(ins.rx()).set_u64(a.wrapping_shl(b as u32));
      Flow::Continue
    },

    Shr => {
      let a = state.reg(ins.ry()).as_u64();
      let b = state.reg(ins.rz()).as_u64();
      state.reg_mut(ins.rx()).set_u64(a.wrapping_shr(b as u32));
      Flow::Continue
    },

    AndImm => imm_u64!(state, ins, bitand),
    OrImm => imm_u64!(state, ins, bitor),
    XorImm => imm_u64!(state, ins, bitxor),

    NotImm => {
      state.reg_mut(ins.rx()).set_u64(!(ins.imm16_value() as u64));
      Flow::Continue
    },

    ShlImm => {
      let rx = ins.rx();
      let value = state.reg(rx).as_u64().wrapping_shl(ins.imm16_value() as u32);
      state.reg_mut(rx).set_u64(value);
      Flow::Continue
    },

    ShrImm => {
      let rx = ins.rx();
      let value = state.reg(rx).as_u64().wrapping_shr(ins.imm16_value() as u32);
      state.reg_mut(rx).set_u64(value);
      Flow::Continue
    },
  }
}
