//! Machine state and the dispatch loop.

mod runtime;
mod stack;

pub use runtime::{
    BLOCK_STACK_SIZE, BlockEntry, BlockKind, CALL_STACK_SIZE, Frame, MAX_FUNCTIONS,
    PTR_STACK_SIZE, STACK_SIZE, TAPE_SIZE, Vm,
};
pub use stack::Stack;
