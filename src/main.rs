extern crate octane;

use octane::{
  instruction::{ Instruction, Opcode },
  storage::{ StorageRequest, SymbolType },
  vm::Vm,
};

fn main () {
  env_logger::init();

  let vm = Vm::new().expect("Failed to initialise the VM");

  // Set up some dummy symbols and inspect the store
  for key in ["KeyA", "KeyB"] {
    let request = StorageRequest {
      kind: SymbolType::Data,
      extended_type: 0,
      key,
      value: std::ptr::null_mut(),
      value_size: 0,
    };

    if vm.storage().assign(&request).is_none() {
      panic!("Failed to assign {}: {:?}", key, vm.storage().last_error());
    }
  }

  vm.storage().log(false);

  println!("KeyA -> {:?}", vm.storage().lookup("KeyA"));
  println!("KeyB -> {:?}", vm.storage().lookup("KeyB"));
  println!("KeyC -> {:?}", vm.storage().lookup("KeyC"));

  // Assemble and run a small routine: (5 + 7) * 3, result via the stack
  let code = [
    Instruction::imm16(Opcode::MovImm, 0, 5),
    Instruction::imm16(Opcode::MovImm, 1, 7),
    Instruction::three_reg(Opcode::Add, 2, 0, 1),
    Instruction::imm16(Opcode::MulImm, 2, 3),
    Instruction::one_reg(Opcode::PushReg, 2),
    Instruction::any(Opcode::Ret),
  ];

  let mut func = unsafe {
    octane::function::Function::new_bytecode(vm.allocator(), None, code.len() as u16, 0)
  }.expect("Failed to allocate the demo function");

  for (idx, &ins) in code.iter().enumerate() {
    assert!(func.store_instruction(idx as u16, ins));
  }

  let mut vp = vm.make_processor(0).expect("Failed to allocate a processor");

  let outcome = vm.run(&mut vp, &func);
  let result = vp.memory_mut().pop64();

  println!("outcome: {:?}, steps: {}, result: {}", outcome, vp.steps(), result.value);

  vm.allocator().log();
}
