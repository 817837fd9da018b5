//! Pluggable execution backends.
//!
//! A backend is one method per opcode plus `setup`/`finalize`. The dispatch
//! loop hands each hook the machine and the opcode's already-decoded
//! immediates, so backends never parse bytecode themselves (the
//! interpreter's structured-block scanner being the one deliberate
//! exception). Every hook defaults to a no-op; a backend implements only
//! the opcodes it cares about and keeps its private state in its own
//! fields.

mod interp;
pub mod tac;

pub use interp::Interp;
pub use tac::TacBackend;

use crate::value::{TypeTag, Word};
use crate::vm::Vm;

#[allow(unused_variables)]
pub trait Backend {
    /// Called once before execution starts, with the machine not yet reset.
    fn setup(&mut self, vm: &mut Vm<'_>) {}
    /// Called by the driver once execution and any dumping are done.
    fn finalize(&mut self, vm: &mut Vm<'_>, imm: Word) {}

    fn op_nop(&mut self, vm: &mut Vm<'_>) {}
    fn op_push(&mut self, vm: &mut Vm<'_>, tag: TypeTag, imm: Word) {}
    fn op_set(&mut self, vm: &mut Vm<'_>, tag: TypeTag, imm: Word) {}
    fn op_add(&mut self, vm: &mut Vm<'_>) {}
    fn op_sub(&mut self, vm: &mut Vm<'_>) {}
    fn op_mul(&mut self, vm: &mut Vm<'_>) {}
    fn op_div(&mut self, vm: &mut Vm<'_>) {}
    fn op_rem(&mut self, vm: &mut Vm<'_>) {}
    fn op_load(&mut self, vm: &mut Vm<'_>) {}
    fn op_store(&mut self, vm: &mut Vm<'_>) {}
    fn op_print(&mut self, vm: &mut Vm<'_>) {}
    fn op_print_char(&mut self, vm: &mut Vm<'_>) {}
    fn op_deref(&mut self, vm: &mut Vm<'_>) {}
    fn op_refer(&mut self, vm: &mut Vm<'_>) {}
    fn op_where(&mut self, vm: &mut Vm<'_>) {}
    fn op_index(&mut self, vm: &mut Vm<'_>) {}
    fn op_move(&mut self, vm: &mut Vm<'_>, imm: Word) {}
    fn op_offset(&mut self, vm: &mut Vm<'_>, imm: Word) {}
    fn op_function(&mut self, vm: &mut Vm<'_>, index: Word) {}
    fn op_call(&mut self, vm: &mut Vm<'_>, index: Word) {}
    fn op_return(&mut self, vm: &mut Vm<'_>) {}
    fn op_if(&mut self, vm: &mut Vm<'_>) {}
    fn op_else(&mut self, vm: &mut Vm<'_>) {}
    fn op_end_block(&mut self, vm: &mut Vm<'_>) {}
    fn op_while(&mut self, vm: &mut Vm<'_>, cond_ip: Word) {}
    fn op_or(&mut self, vm: &mut Vm<'_>) {}
    fn op_and(&mut self, vm: &mut Vm<'_>) {}
    fn op_not(&mut self, vm: &mut Vm<'_>) {}
    fn op_bit_and(&mut self, vm: &mut Vm<'_>) {}
    fn op_bit_or(&mut self, vm: &mut Vm<'_>) {}
    fn op_bit_xor(&mut self, vm: &mut Vm<'_>) {}
    fn op_lsh(&mut self, vm: &mut Vm<'_>) {}
    fn op_lrsh(&mut self, vm: &mut Vm<'_>) {}
    fn op_arsh(&mut self, vm: &mut Vm<'_>) {}
    fn op_gez(&mut self, vm: &mut Vm<'_>) {}
    fn op_halt(&mut self, vm: &mut Vm<'_>) {}
}
