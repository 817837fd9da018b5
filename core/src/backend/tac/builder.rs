//! The streaming bytecode-to-TAC lowering backend.
//!
//! Every value-producing opcode allocates an SSA temp and pushes its id on
//! a virtual operand stack; consumers pop ids instead of values. Control
//! flow lowers to labels and jumps through a block stack that mirrors the
//! interpreter's.
//!
//! The delicate part is `While`: the condition bytecode precedes the
//! `While` opcode, so by the time the hook runs, the condition's IR has
//! already been emitted. The backend therefore keeps a map from VM opcode
//! ip to the IR index its first instruction landed at, and retroactively
//! inserts the condition label at that position, shifting every recorded
//! index at or past the insertion point.

use crate::backend::Backend;
use crate::backend::tac::{Instr, TacOp, TacProgram};
use crate::value::{TypeTag, Word};
use crate::vm::{MAX_FUNCTIONS, STACK_SIZE, TAPE_SIZE, Vm};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TacBlock {
    Function,
    If,
    Else,
    While,
}

#[derive(Clone, Copy, Debug)]
struct BlockEntry {
    kind: TacBlock,
    start_label: i32,
    else_label: i32,
    end_label: i32,
    #[allow(dead_code)]
    cond_vm_ip: Option<usize>,
}

/// Lowers bytecode into a [`TacProgram`] as the dispatch loop streams over
/// it. The backend never touches `ip`, so the whole program is visited in
/// order exactly once.
pub struct TacBackend {
    prog: TacProgram,
    /// Virtual operand stack of temp ids.
    operands: Vec<i32>,
    next_temp: i32,
    /// Label ids start at 1; 0 names the implicit clause in the dump.
    next_label: i32,
    blocks: Vec<BlockEntry>,
    /// VM function index -> TAC label, -1 while unassigned.
    func_labels: [i32; MAX_FUNCTIONS],
    /// VM opcode ip -> IR index of the first instruction that opcode
    /// produced, -1 while unassigned. Sized to the bytecode at setup.
    ip_to_tac_index: Vec<i32>,
    /// VM opcode ip -> TAC label attached to that position, if any.
    ip_to_tac_label: Vec<i32>,
    /// Per-temp type tags, grown on demand.
    temp_types: Vec<TypeTag>,
    /// Virtual tape pointer tracking `Move` for diagnostics.
    vtp: usize,
}

impl Default for TacBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TacBackend {
    pub fn new() -> Self {
        TacBackend {
            prog: TacProgram::new(),
            operands: Vec::new(),
            next_temp: 0,
            next_label: 1,
            blocks: Vec::new(),
            func_labels: [-1; MAX_FUNCTIONS],
            ip_to_tac_index: Vec::new(),
            ip_to_tac_label: Vec::new(),
            temp_types: Vec::new(),
            vtp: 0,
        }
    }

    pub fn program(&self) -> &TacProgram {
        &self.prog
    }

    pub fn into_program(self) -> TacProgram {
        self.prog
    }

    fn new_temp(&mut self) -> i32 {
        let t = self.next_temp;
        self.next_temp += 1;
        t
    }

    fn new_label(&mut self) -> i32 {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    fn set_temp_type(&mut self, temp: i32, tag: TypeTag) {
        let idx = temp as usize;
        if idx >= self.temp_types.len() {
            self.temp_types.resize(idx + 1, TypeTag::Unknown);
        }
        self.temp_types[idx] = tag;
    }

    fn temp_type(&self, temp: i32) -> TypeTag {
        usize::try_from(temp)
            .ok()
            .and_then(|i| self.temp_types.get(i).copied())
            .unwrap_or(TypeTag::Unknown)
    }

    fn pop_operand(&mut self) -> i32 {
        self.operands.pop().expect("missing operand temp")
    }

    fn push_operand(&mut self, temp: i32) {
        assert!(self.operands.len() < STACK_SIZE, "operand stack overflow");
        self.operands.push(temp);
    }

    /// Records that the opcode which consumed `consumed` words (opcode plus
    /// immediates) produces its first IR instruction at the current IR
    /// length. `vm.ip` already points past the opcode's immediates.
    fn record_ip(&mut self, vm: &Vm<'_>, consumed: usize) {
        let opcode_ip = vm.ip.saturating_sub(consumed);
        if opcode_ip < self.ip_to_tac_index.len() {
            self.ip_to_tac_index[opcode_ip] = self.prog.len() as i32;
        }
    }

    fn emit_label(&mut self, label: i32) {
        self.prog.emit(Instr {
            imm: label as Word,
            ..Instr::new(TacOp::Label)
        });
    }

    fn emit_jmp(&mut self, label: i32) {
        self.prog.emit(Instr {
            imm: label as Word,
            ..Instr::new(TacOp::Jmp)
        });
    }

    fn emit_jz(&mut self, cond: i32, label: i32) {
        self.prog.emit(Instr {
            lhs: cond,
            imm: label as Word,
            ..Instr::new(TacOp::Jz)
        });
    }

    /// Inserts `Label(label)` at IR index `idx` and rewrites the ip maps:
    /// VM ips that pointed at `idx` get the label attached (so future
    /// lookups resolve to it), and every recorded IR index at or past `idx`
    /// is shifted by one.
    fn insert_label_at(&mut self, idx: usize, label: i32) {
        tracing::debug!(idx, label, ir_len = self.prog.len(), "inserting condition label");
        for vm_ip in 0..self.ip_to_tac_index.len() {
            if self.ip_to_tac_index[vm_ip] == idx as i32 {
                self.ip_to_tac_label[vm_ip] = label;
            }
        }
        self.prog.insert(
            idx,
            Instr {
                imm: label as Word,
                ..Instr::new(TacOp::Label)
            },
        );
        for slot in &mut self.ip_to_tac_index {
            if *slot >= idx as i32 {
                *slot += 1;
            }
        }
    }

    fn binary(&mut self, vm: &Vm<'_>, op: TacOp) {
        self.record_ip(vm, 1);
        let rhs = self.pop_operand();
        let lhs = self.pop_operand();
        let dst = self.new_temp();
        let inferred = self.temp_type(lhs);
        self.set_temp_type(dst, inferred);
        self.prog.emit(Instr {
            dst,
            lhs,
            rhs,
            dst_type: inferred,
            ..Instr::new(op)
        });
        self.push_operand(dst);
    }

    fn unary(&mut self, vm: &Vm<'_>, op: TacOp) {
        self.record_ip(vm, 1);
        let lhs = self.pop_operand();
        let dst = self.new_temp();
        self.prog.emit(Instr {
            dst,
            lhs,
            ..Instr::new(op)
        });
        self.push_operand(dst);
    }
}

impl Backend for TacBackend {
    fn setup(&mut self, vm: &mut Vm<'_>) {
        *self = TacBackend::new();
        self.ip_to_tac_index = vec![-1; vm.code_len()];
        self.ip_to_tac_label = vec![-1; vm.code_len()];
    }

    fn op_push(&mut self, vm: &mut Vm<'_>, tag: TypeTag, imm: Word) {
        self.record_ip(vm, 3);
        let dst = self.new_temp();
        self.set_temp_type(dst, tag);
        self.prog.emit(Instr {
            dst,
            imm,
            dst_type: tag,
            ..Instr::new(TacOp::Const)
        });
        self.push_operand(dst);
    }

    fn op_set(&mut self, vm: &mut Vm<'_>, tag: TypeTag, imm: Word) {
        self.record_ip(vm, 3);
        let val = self.new_temp();
        self.set_temp_type(val, tag);
        self.prog.emit(Instr {
            dst: val,
            imm,
            dst_type: tag,
            ..Instr::new(TacOp::Const)
        });
        // A store does not consume the pointer in machine semantics, so the
        // pointer temp is peeked, not popped; materialise one from the
        // current address when the operand stack has none.
        let ptr = match self.operands.last() {
            Some(&p) => p,
            None => {
                let p = self.new_temp();
                self.set_temp_type(p, TypeTag::Ptr);
                self.prog.emit(Instr {
                    dst: p,
                    dst_type: TypeTag::Ptr,
                    ..Instr::new(TacOp::Where)
                });
                self.push_operand(p);
                p
            }
        };
        self.prog.emit(Instr {
            lhs: ptr,
            rhs: val,
            ..Instr::new(TacOp::Set)
        });
    }

    fn op_add(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::Add);
    }

    fn op_sub(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::Sub);
    }

    fn op_mul(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::Mul);
    }

    fn op_div(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::Div);
    }

    fn op_rem(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::Rem);
    }

    fn op_or(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::Or);
    }

    fn op_and(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::And);
    }

    fn op_bit_and(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::BitAnd);
    }

    fn op_bit_or(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::BitOr);
    }

    fn op_bit_xor(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::BitXor);
    }

    fn op_lsh(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::Lsh);
    }

    fn op_lrsh(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::Lrsh);
    }

    fn op_arsh(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, TacOp::Arsh);
    }

    fn op_not(&mut self, vm: &mut Vm<'_>) {
        self.unary(vm, TacOp::Not);
    }

    fn op_gez(&mut self, vm: &mut Vm<'_>) {
        self.unary(vm, TacOp::Gez);
    }

    fn op_move(&mut self, vm: &mut Vm<'_>, imm: Word) {
        self.record_ip(vm, 2);
        self.prog.emit(Instr {
            imm,
            ..Instr::new(TacOp::Move)
        });
        // Track the virtual tape pointer so out-of-range moves surface at
        // lowering time too.
        let vtp = self.vtp as i64 + imm as i64;
        assert!(
            (0..TAPE_SIZE as i64).contains(&vtp),
            "tape pointer out of bounds: {vtp}"
        );
        self.vtp = vtp as usize;
    }

    fn op_load(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        let dst = self.new_temp();
        self.prog.emit(Instr {
            dst,
            ..Instr::new(TacOp::Load)
        });
        self.push_operand(dst);
    }

    fn op_store(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        let src = self.pop_operand();
        self.prog.emit(Instr {
            lhs: src,
            ..Instr::new(TacOp::Store)
        });
    }

    fn op_print(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        let val = self.pop_operand();
        self.prog.emit(Instr {
            lhs: val,
            ..Instr::new(TacOp::Print)
        });
    }

    fn op_print_char(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        let val = self.pop_operand();
        self.prog.emit(Instr {
            lhs: val,
            ..Instr::new(TacOp::PrintChar)
        });
    }

    fn op_deref(&mut self, vm: &mut Vm<'_>) {
        self.unary(vm, TacOp::Deref);
    }

    fn op_refer(&mut self, vm: &mut Vm<'_>) {
        self.unary(vm, TacOp::Refer);
    }

    fn op_where(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        let dst = self.new_temp();
        self.prog.emit(Instr {
            dst,
            ..Instr::new(TacOp::Where)
        });
        self.push_operand(dst);
    }

    fn op_offset(&mut self, vm: &mut Vm<'_>, imm: Word) {
        self.record_ip(vm, 2);
        let ptr = self.pop_operand();
        let dst = self.new_temp();
        self.prog.emit(Instr {
            dst,
            lhs: ptr,
            imm,
            ..Instr::new(TacOp::Offset)
        });
        self.push_operand(dst);
    }

    fn op_index(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        let idx = self.pop_operand();
        let ptr = self.pop_operand();
        let dst = self.new_temp();
        self.prog.emit(Instr {
            dst,
            lhs: ptr,
            rhs: idx,
            ..Instr::new(TacOp::Index)
        });
        self.push_operand(dst);
    }

    fn op_function(&mut self, vm: &mut Vm<'_>, index: Word) {
        self.record_ip(vm, 2);
        let idx = index as usize;
        assert!(idx < MAX_FUNCTIONS, "function index out of range: {index}");
        // Functions get fresh label ids so they never collide with labels
        // generated for structured blocks.
        let label = self.new_label();
        self.func_labels[idx] = label;
        self.emit_label(label);
        self.blocks.push(BlockEntry {
            kind: TacBlock::Function,
            start_label: label,
            else_label: 0,
            end_label: 0,
            cond_vm_ip: None,
        });
    }

    fn op_call(&mut self, vm: &mut Vm<'_>, index: Word) {
        self.record_ip(vm, 2);
        let idx = index as usize;
        assert!(idx < MAX_FUNCTIONS, "function index out of range: {index}");
        let mut label = self.func_labels[idx];
        if label < 0 {
            // Forward call to a function not yet seen.
            label = self.new_label();
            self.func_labels[idx] = label;
        }
        // Calls are values: allocate a destination temp unconditionally.
        let dst = self.new_temp();
        self.prog.emit(Instr {
            dst,
            imm: label as Word,
            ..Instr::new(TacOp::Call)
        });
        self.push_operand(dst);
    }

    fn op_return(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        self.prog.emit(Instr::new(TacOp::Ret));
    }

    fn op_if(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        let cond = self.pop_operand();
        let else_label = self.new_label();
        let end_label = self.new_label();
        self.emit_jz(cond, else_label);
        self.blocks.push(BlockEntry {
            kind: TacBlock::If,
            start_label: 0,
            else_label,
            end_label,
            cond_vm_ip: None,
        });
    }

    fn op_else(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        let entry = self.blocks.last_mut().expect("else without matching if");
        assert!(entry.kind == TacBlock::If, "else without matching if");
        entry.kind = TacBlock::Else;
        let (end_label, else_label) = (entry.end_label, entry.else_label);
        self.emit_jmp(end_label);
        self.emit_label(else_label);
    }

    fn op_while(&mut self, vm: &mut Vm<'_>, cond_ip: Word) {
        self.record_ip(vm, 2);
        let cond = self.pop_operand();

        let cond_vm_ip = cond_ip as usize;
        let mut cond_label = -1;
        if cond_vm_ip < self.ip_to_tac_index.len() {
            let map_idx = self.ip_to_tac_index[cond_vm_ip];
            if map_idx >= 0 {
                cond_label = self.new_label();
                self.insert_label_at(map_idx as usize, cond_label);
            } else {
                tracing::debug!(cond_vm_ip, "while condition ip has no recorded lowering");
            }
        } else {
            tracing::debug!(
                cond_vm_ip,
                code_len = self.ip_to_tac_index.len(),
                "while condition ip out of range"
            );
        }
        if cond_label < 0 {
            debug_assert!(false, "while condition at ip {cond_vm_ip} was never lowered");
            cond_label = self.new_label();
            self.emit_label(cond_label);
        }
        if cond_vm_ip < self.ip_to_tac_label.len() {
            self.ip_to_tac_label[cond_vm_ip] = cond_label;
        }

        let end_label = self.new_label();
        self.emit_jz(cond, end_label);
        let body_label = self.new_label();
        self.emit_label(body_label);
        self.blocks.push(BlockEntry {
            kind: TacBlock::While,
            start_label: cond_label,
            else_label: 0,
            end_label,
            cond_vm_ip: Some(cond_vm_ip),
        });
    }

    fn op_end_block(&mut self, vm: &mut Vm<'_>) {
        self.record_ip(vm, 1);
        let entry = self.blocks.pop().expect("end without open block");
        match entry.kind {
            TacBlock::While => {
                let mut target = entry.start_label;
                if target <= 0 {
                    // Recover from a lost block label via the ip map.
                    target = self
                        .ip_to_tac_label
                        .iter()
                        .copied()
                        .find(|&l| l > 0)
                        .unwrap_or(-1);
                }
                assert!(target > 0, "missing condition label for while");
                self.emit_jmp(target);
                self.emit_label(entry.end_label);
            }
            TacBlock::If | TacBlock::Else => {
                self.emit_label(entry.end_label);
            }
            TacBlock::Function => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Op, Program};
    use pretty_assertions::assert_eq;

    fn lower(p: &Program) -> TacBackend {
        let mut vm = Vm::new(p.words());
        let mut backend = TacBackend::new();
        vm.run(&mut backend);
        backend
    }

    #[test]
    fn push_add_print() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 3)
            .op2(Push, TypeTag::I64, 4)
            .op(Add)
            .op(Print)
            .op(Halt);
        let tac = lower(&p);
        assert_eq!(
            tac.program().to_string(),
            "l0 :-\n  const(t0, i64, 3),\n  const(t1, i64, 4),\n  add(t2, i64, t0, t1),\n  print(t2).\n"
        );
    }

    #[test]
    fn binary_result_type_inherited_from_lhs() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::U32, 8)
            .op2(Push, TypeTag::U32, 2)
            .op(Div)
            .op(Store)
            .op(Halt);
        let tac = lower(&p);
        assert!(tac.program().to_string().contains("div(t2, u32, t0, t1)"));
    }

    #[test]
    fn set_peeks_pointer_and_materialises_where() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Set, TypeTag::I64, 9).op2(Set, TypeTag::I64, 10).op(Halt);
        let tac = lower(&p);
        // First set materialises a pointer temp; the second reuses it
        // because stores never consume the pointer.
        assert_eq!(
            tac.program().to_string(),
            "l0 :-\n  const(t0, i64, 9),\n  where(t1),\n  set(t1, t0),\n  const(t2, i64, 10),\n  set(t1, t2).\n"
        );
    }

    #[test]
    fn if_else_lowering() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 1)
            .op(If)
            .op2(Push, TypeTag::I64, 100)
            .op(Print)
            .op(Else)
            .op2(Push, TypeTag::I64, 200)
            .op(Print)
            .op(EndBlock)
            .op(Halt);
        let tac = lower(&p);
        assert_eq!(
            tac.program().to_string(),
            "l0 :-\n  const(t0, i64, 1),\n  jz(t0, l1),\n  const(t1, i64, 100),\n  print(t1),\n  jmp(l2).\n\nl1 :-\n  const(t2, i64, 200),\n  print(t2).\n\nl2 :-\n  true.\n"
        );
    }

    #[test]
    fn call_targets_the_function_label() {
        use Op::*;
        let mut p = Program::new();
        p.op1(Function, 0)
            .op2(Push, TypeTag::I64, 1)
            .op(Return)
            .op(EndBlock)
            .op1(Call, 0)
            .op(Print)
            .op(Halt);
        let tac = lower(&p);
        assert_eq!(
            tac.program().to_string(),
            "l1 :-\n  const(t0, i64, 1),\n  ret.\n\nl0 :-\n  call(l1, t1),\n  print(t1).\n"
        );
    }

    #[test]
    fn forward_call_allocates_a_placeholder_label() {
        use Op::*;
        let mut p = Program::new();
        p.op1(Call, 7).op(Store).op(Halt);
        let tac = lower(&p);
        assert_eq!(
            tac.program().to_string(),
            "l0 :-\n  call(l1, t0),\n  store(t0).\n"
        );
    }

    #[test]
    fn while_label_inserted_before_condition() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 3).op(Store);
        let cond_ip = p.len() as Word;
        p.op(Load)
            .op1(While, cond_ip)
            .op(Load)
            .op(Print)
            .op(Load)
            .op2(Push, TypeTag::I64, 1)
            .op(Sub)
            .op(Store)
            .op(EndBlock)
            .op(Halt);
        let tac = lower(&p);
        assert_eq!(
            tac.program().to_string(),
            concat!(
                "l0 :-\n",
                "  const(t0, i64, 3),\n",
                "  store(t0).\n",
                "\n",
                "l1 :-\n",
                "  load(t1),\n",
                "  jz(t1, l2).\n",
                "\n",
                "l3 :-\n",
                "  load(t2),\n",
                "  print(t2),\n",
                "  load(t3),\n",
                "  const(t4, i64, 1),\n",
                "  sub(t5, unknown, t3, t4),\n",
                "  store(t5),\n",
                "  jmp(l1).\n",
                "\n",
                "l2 :-\n",
                "  true.\n",
            )
        );
    }

    #[test]
    fn while_insert_rewrites_ip_maps() {
        use Op::*;
        let mut p = Program::new();
        let cond_ip = p.len() as Word;
        p.op(Load)
            .op1(While, cond_ip)
            .op(Load)
            .op(Store)
            .op(EndBlock)
            .op(Halt);
        let tac = lower(&p);
        // The condition Load's mapping was shifted past the inserted label
        // and the label itself is attached to the condition's VM ip.
        assert_eq!(tac.ip_to_tac_index[0], 1);
        assert_eq!(tac.ip_to_tac_label[0], 1);
        assert_eq!(tac.program().instrs()[0].op, TacOp::Label);
        assert_eq!(tac.program().instrs()[1].op, TacOp::Load);
    }

    #[test]
    fn lowering_is_deterministic() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 2).op(Store);
        let cond_ip = p.len() as Word;
        p.op(Load)
            .op1(While, cond_ip)
            .op(Load)
            .op(Print)
            .op(Load)
            .op2(Push, TypeTag::I64, 1)
            .op(Sub)
            .op(Store)
            .op(EndBlock)
            .op(Halt);
        let first = lower(&p).into_program().to_string();
        let second = lower(&p).into_program().to_string();
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic(expected = "missing operand temp")]
    fn consuming_a_missing_temp_is_fatal() {
        use Op::*;
        let mut p = Program::new();
        p.op(Print).op(Halt);
        lower(&p);
    }
}
