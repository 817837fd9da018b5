//! The virtual machine: state buffers, registers and the decode loop.
//!
//! The loop owns the bytecode *format* — it decodes each opcode and its
//! immediates and forwards them to the backend — while the backend owns the
//! *semantics*. The loop never touches the stacks or the tape itself; it
//! only advances `ip`, and control-flow hooks are free to move `ip`
//! themselves (the interpreter's `If` skips forward, its `EndBlock` jumps
//! back to a `While` head, the TAC backend leaves `ip` alone so the whole
//! program is visited linearly).

use crate::backend::Backend;
use crate::bytecode::Op;
use crate::value::{TypeTag, Value, Word};
use crate::vm::stack::Stack;

pub const STACK_SIZE: usize = 1024;
pub const TAPE_SIZE: usize = 1024;
pub const PTR_STACK_SIZE: usize = TAPE_SIZE;
pub const CALL_STACK_SIZE: usize = 256;
pub const BLOCK_STACK_SIZE: usize = 256;
pub const MAX_FUNCTIONS: usize = 256;

/// One saved call context: where to resume and the caller's frame pointer.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub return_ip: usize,
    pub saved_fp: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockKind {
    If,
    While,
}

/// An open structured block. For `While`, `ip` is the condition's start so
/// `EndBlock` can restart the loop.
#[derive(Clone, Copy, Debug)]
pub struct BlockEntry {
    pub kind: BlockKind,
    pub ip: usize,
}

/// Machine state for one program execution.
///
/// The bytecode is borrowed immutably; all state buffers are owned and
/// zero-initialised at [`Vm::run`] entry.
pub struct Vm<'p> {
    code: &'p [Word],
    pub ip: usize,
    pub stack: Stack<Value>,
    pub fp: usize,
    pub tape: Vec<Value>,
    pub tp: usize,
    pub ptr_stack: Stack<usize>,
    pub call_stack: Stack<Frame>,
    pub block_stack: Stack<BlockEntry>,
    pub functions: [Option<usize>; MAX_FUNCTIONS],
}

impl<'p> Vm<'p> {
    pub fn new(code: &'p [Word]) -> Self {
        Vm {
            code,
            ip: 0,
            stack: Stack::new(STACK_SIZE),
            fp: 0,
            tape: vec![Value::default(); TAPE_SIZE],
            tp: 0,
            ptr_stack: Stack::new(PTR_STACK_SIZE),
            call_stack: Stack::new(CALL_STACK_SIZE),
            block_stack: Stack::new(BLOCK_STACK_SIZE),
            functions: [None; MAX_FUNCTIONS],
        }
    }

    #[inline]
    pub fn code(&self) -> &'p [Word] {
        self.code
    }

    #[inline]
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    fn reset(&mut self) {
        self.ip = 0;
        self.fp = 0;
        self.tp = 0;
        self.stack.clear();
        self.ptr_stack.clear();
        self.call_stack.clear();
        self.block_stack.clear();
        self.tape.fill(Value::default());
        self.functions = [None; MAX_FUNCTIONS];
    }

    /// Reads the next word as an immediate.
    #[inline]
    fn fetch(&mut self) -> Word {
        assert!(self.ip < self.code.len(), "unexpected end of code");
        let w = self.code[self.ip];
        self.ip += 1;
        w
    }

    /// Executes the program against `backend` until `Halt` or end of code.
    ///
    /// # Panics
    ///
    /// Panics on malformed bytecode (unknown opcode, missing immediate) and
    /// on any invariant violation raised by the backend hooks; these are
    /// programmer errors, not recoverable faults.
    pub fn run<B: Backend>(&mut self, backend: &mut B) {
        backend.setup(self);
        self.reset();
        tracing::trace!(code_len = self.code.len(), "vm run");

        while self.ip < self.code.len() {
            let op = Op::try_from(self.code[self.ip]).unwrap_or_else(|e| panic!("{e}"));
            self.ip += 1;

            use Op::*;
            match op {
                Nop => backend.op_nop(self),
                Add => backend.op_add(self),
                Sub => backend.op_sub(self),
                Mul => backend.op_mul(self),
                Div => backend.op_div(self),
                Rem => backend.op_rem(self),
                Load => backend.op_load(self),
                Store => backend.op_store(self),
                Print => backend.op_print(self),
                PrintChar => backend.op_print_char(self),
                Deref => backend.op_deref(self),
                Refer => backend.op_refer(self),
                Where => backend.op_where(self),
                Index => backend.op_index(self),
                Return => backend.op_return(self),
                If => backend.op_if(self),
                Else => backend.op_else(self),
                EndBlock => backend.op_end_block(self),
                Or => backend.op_or(self),
                And => backend.op_and(self),
                Not => backend.op_not(self),
                BitAnd => backend.op_bit_and(self),
                BitOr => backend.op_bit_or(self),
                BitXor => backend.op_bit_xor(self),
                Lsh => backend.op_lsh(self),
                Lrsh => backend.op_lrsh(self),
                Arsh => backend.op_arsh(self),
                Gez => backend.op_gez(self),
                Halt => {
                    backend.op_halt(self);
                    return;
                }
                Move => {
                    let imm = self.fetch();
                    backend.op_move(self, imm);
                }
                Offset => {
                    let imm = self.fetch();
                    backend.op_offset(self, imm);
                }
                Function => {
                    let imm = self.fetch();
                    backend.op_function(self, imm);
                }
                Call => {
                    let imm = self.fetch();
                    backend.op_call(self, imm);
                }
                While => {
                    let imm = self.fetch();
                    backend.op_while(self, imm);
                }
                Push => {
                    let tag = self.fetch();
                    let imm = self.fetch();
                    let tag = TypeTag::try_from(tag).unwrap_or_else(|e| panic!("{e}"));
                    backend.op_push(self, tag, imm);
                }
                Set => {
                    let tag = self.fetch();
                    let imm = self.fetch();
                    let tag = TypeTag::try_from(tag).unwrap_or_else(|e| panic!("{e}"));
                    backend.op_set(self, tag, imm);
                }
            }
        }
    }
}
