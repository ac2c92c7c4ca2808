//! The runtime exception discipline: fault kinds, records, and handlers

use crate::instruction::{ Instruction, Opcode };


/// An enumeration of every fault the VM can raise
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
  /// No fault occurred
  None,

  // Static //
  /// An instruction names a register outside the file
  InvalidRegisterAccess,
  /// An instruction marks a required register as unused
  InvalidUnusedRegister,

  // Static or runtime //
  /// Execution or a jump reached outside the executable universe
  InstructionOverflow,
  /// Execution or a jump reached before the start of the code space
  InstructionUnderflow,

  // Runtime //
  /// Signed integer division by zero
  DivideByZeroI,
  /// Unsigned integer division by zero
  DivideByZeroU,
  /// 32-bit float division by zero
  DivideByZeroF,
  /// 64-bit float division by zero
  DivideByZeroD,

  /// A stack push would overrun the stack space
  StackOverflow,
  /// A stack pop would underrun the stack space
  StackUnderflow,
  /// The stack was never initialised
  StackUnset,

  /// A local access reached beyond the current frame's bytes
  LocalAccessOverflow,
  /// A local drop would underflow the current frame
  LocalAccessUnderflow,
  /// No local frame is open
  LocalUnset,

  /// The core allocator could not satisfy a request
  HeapOutOfMemory,
  /// The local arena could not satisfy a request
  LocalOutOfMemory,
}


/// An internal exception raised by the VM during runtime execution or
/// static validation. A plain value; exceptions are returned and
/// dispatched, never unwound
#[derive(Debug, Clone, Copy)]
pub struct Exception {
  kind: ExceptionKind,
  from_bytecode: bool,
  static_eval: bool,
  offender: Instruction,
}

impl Exception {
  /// Create an Exception raised from a bytecode function, recording the
  /// offending instruction word
  pub fn bytecode (kind: ExceptionKind, offender: Instruction, static_eval: bool) -> Self {
    Self { kind, from_bytecode: true, static_eval, offender }
  }

  /// Create an Exception raised from a native function exposed to the VM
  pub fn native (kind: ExceptionKind) -> Self {
    Self { kind, from_bytecode: false, static_eval: false, offender: Instruction::any(Opcode::Nop) }
  }

  /// The kind of this Exception
  pub fn kind (&self) -> ExceptionKind {
    self.kind
  }

  /// True when this Exception was raised from a bytecode function rather
  /// than from a native one
  pub fn is_bytecode (&self) -> bool {
    self.from_bytecode
  }

  /// True when this Exception was raised from a native function
  pub fn is_native (&self) -> bool {
    !self.from_bytecode
  }

  /// True when this Exception was raised during static validation.
  /// No registers were live and no corrective action is required
  pub fn is_static_eval (&self) -> bool {
    self.static_eval
  }

  /// The instruction word that raised this Exception.
  /// Meaningful only for bytecode offenders
  pub fn offending_instruction (&self) -> Instruction {
    self.offender
  }
}


/// The verdict a handler returns about an exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
  /// No exception occurred; reserved for probe calls
  NoException,
  /// The exception was handled gracefully; the executor may continue as
  /// if the instruction completed
  Handled,
  /// The exception was ignored: the instruction is not executed but the
  /// instruction pointer still advances past it
  Ignored,
  /// The exception was fatal; the enclosing function halts and the fault
  /// propagates upward
  Fatal,
}


/// A function that handles an [`Exception`]. Handlers may mutate registers
/// and thread memory through the execution state
pub type HandlerFunc = fn(Exception, &mut crate::vm::ExecState) -> HandlerResult;


/// The default handler: every runtime exception is fatal
pub fn default_handler (exception: Exception, _state: &mut crate::vm::ExecState) -> HandlerResult {
  match exception.kind() {
    ExceptionKind::None => HandlerResult::NoException,
    _ => HandlerResult::Fatal
  }
}
