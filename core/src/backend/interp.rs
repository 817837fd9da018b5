//! The interpreter backend: executes bytecode directly against the machine
//! state.
//!
//! Structured control flow (`If`/`Else`/`EndBlock`/`While`, function body
//! skipping) works by scanning forward over the bytecode. The scanner honours
//! [`Op::arity`] so it skips immediates correctly; any divergence between
//! emission arities and this table silently desynchronises execution, which
//! is why the arity lives on [`Op`] and nowhere else.

use std::io::{self, Write};

use crate::backend::Backend;
use crate::bytecode::Op;
use crate::value::{TypeTag, UWord, Value, Word};
use crate::vm::{BlockEntry, BlockKind, Frame, MAX_FUNCTIONS, TAPE_SIZE, Vm};

/// Where a forward scan is allowed to stop.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanStop {
    /// Stop just past the first `Else` or `EndBlock` at depth zero
    /// (skipping a false `If` branch).
    ElseOrEnd,
    /// Stop just past the matching `EndBlock` only.
    End,
}

/// Scans forward from `ip`, honouring opcode arities, and returns the ip
/// just past the terminating opcode together with that opcode.
///
/// Depth increments on `If`/`While`/`Function`. An `EndBlock` at depth zero
/// terminates any scan, otherwise it closes one nested block. An `Else`
/// only terminates an `ElseOrEnd` scan at depth zero; at any other depth it
/// belongs to a nested `If` and is ignored.
fn scan_block(code: &[Word], mut ip: usize, stop: ScanStop) -> (usize, Op) {
    let mut depth = 0usize;
    while ip < code.len() {
        let op = Op::try_from(code[ip]).unwrap_or_else(|e| panic!("{e}"));
        ip += 1 + op.arity();
        assert!(ip <= code.len(), "unexpected end of code");
        match op {
            Op::If | Op::While | Op::Function => depth += 1,
            Op::Else if depth == 0 && stop == ScanStop::ElseOrEnd => return (ip, op),
            Op::EndBlock => {
                if depth == 0 {
                    return (ip, op);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    panic!("unterminated block");
}

/// Applies a binary opcode to two equally tagged operands.
///
/// `a` is the deeper operand (`a - b`, `a / b`, `a << b`). Float tags
/// compute in the reinterpreted float domain, unsigned tags in the unsigned
/// reinterpretation, everything else in signed words. The result inherits
/// the operand tag.
fn apply_binary(op: Op, a: Value, b: Value) -> Value {
    assert!(
        a.tag == b.tag,
        "type mismatch in {}: {} vs {}",
        op.mnemonic(),
        a.tag.name(),
        b.tag.name()
    );
    let tag = a.tag;
    let raw = match op {
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Rem => match tag {
            TypeTag::F32 => {
                let (x, y) = (a.as_f32(), b.as_f32());
                if matches!(op, Op::Div | Op::Rem) {
                    assert!(y != 0.0, "division by zero");
                }
                let r = match op {
                    Op::Add => x + y,
                    Op::Sub => x - y,
                    Op::Mul => x * y,
                    Op::Div => x / y,
                    _ => x % y,
                };
                r.to_bits() as Word
            }
            TypeTag::F64 => {
                let (x, y) = (a.as_f64(), b.as_f64());
                if matches!(op, Op::Div | Op::Rem) {
                    assert!(y != 0.0, "division by zero");
                }
                let r = match op {
                    Op::Add => x + y,
                    Op::Sub => x - y,
                    Op::Mul => x * y,
                    Op::Div => x / y,
                    _ => x % y,
                };
                r.to_bits() as Word
            }
            t if t.is_unsigned() => {
                let (x, y) = (a.raw as UWord, b.raw as UWord);
                if matches!(op, Op::Div | Op::Rem) {
                    assert!(y != 0, "division by zero");
                }
                let r = match op {
                    Op::Add => x.wrapping_add(y),
                    Op::Sub => x.wrapping_sub(y),
                    Op::Mul => x.wrapping_mul(y),
                    Op::Div => x / y,
                    _ => x % y,
                };
                r as Word
            }
            _ => {
                let (x, y) = (a.raw, b.raw);
                if matches!(op, Op::Div | Op::Rem) {
                    assert!(y != 0, "division by zero");
                }
                match op {
                    Op::Add => x.wrapping_add(y),
                    Op::Sub => x.wrapping_sub(y),
                    Op::Mul => x.wrapping_mul(y),
                    Op::Div => x.wrapping_div(y),
                    _ => x.wrapping_rem(y),
                }
            }
        },
        Op::BitAnd => a.raw & b.raw,
        Op::BitOr => a.raw | b.raw,
        Op::BitXor => a.raw ^ b.raw,
        Op::Lsh => ((a.raw as UWord).wrapping_shl(b.raw as u32)) as Word,
        Op::Lrsh => ((a.raw as UWord).wrapping_shr(b.raw as u32)) as Word,
        Op::Arsh => a.raw.wrapping_shr(b.raw as u32),
        Op::Or => (a.raw != 0 || b.raw != 0) as Word,
        Op::And => (a.raw != 0 && b.raw != 0) as Word,
        _ => unreachable!("not a binary opcode: {:?}", op),
    };
    Value { raw, tag }
}

/// The direct-execution backend. Output from `Print`/`PrintChar` goes
/// through the writer so callers (and tests) can capture it.
pub struct Interp<W> {
    out: W,
}

impl Interp<io::Stdout> {
    pub fn stdout() -> Self {
        Interp { out: io::stdout() }
    }
}

impl<W: Write> Interp<W> {
    pub fn new(out: W) -> Self {
        Interp { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn binary(&mut self, vm: &mut Vm<'_>, op: Op) {
        let b = vm.stack.pop().expect("stack underflow");
        let a = vm.stack.pop().expect("stack underflow");
        vm.stack.push(apply_binary(op, a, b));
    }
}

fn move_tp(vm: &mut Vm<'_>, delta: Word) {
    let tp = vm.tp as i64 + delta as i64;
    assert!(
        (0..TAPE_SIZE as i64).contains(&tp),
        "tape pointer out of bounds: {tp}"
    );
    vm.tp = tp as usize;
}

impl<W: Write> Backend for Interp<W> {
    fn op_push(&mut self, vm: &mut Vm<'_>, tag: TypeTag, imm: Word) {
        vm.stack.push(Value::new(tag, imm));
    }

    fn op_set(&mut self, vm: &mut Vm<'_>, tag: TypeTag, imm: Word) {
        vm.tape[vm.tp] = Value::new(tag, imm);
    }

    fn op_add(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::Add);
    }

    fn op_sub(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::Sub);
    }

    fn op_mul(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::Mul);
    }

    fn op_div(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::Div);
    }

    fn op_rem(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::Rem);
    }

    fn op_or(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::Or);
    }

    fn op_and(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::And);
    }

    fn op_bit_and(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::BitAnd);
    }

    fn op_bit_or(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::BitOr);
    }

    fn op_bit_xor(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::BitXor);
    }

    fn op_lsh(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::Lsh);
    }

    fn op_lrsh(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::Lrsh);
    }

    fn op_arsh(&mut self, vm: &mut Vm<'_>) {
        self.binary(vm, Op::Arsh);
    }

    fn op_not(&mut self, vm: &mut Vm<'_>) {
        let a = vm.stack.pop().expect("stack underflow");
        vm.stack.push(Value::new(a.tag, (a.raw == 0) as Word));
    }

    fn op_gez(&mut self, vm: &mut Vm<'_>) {
        let a = vm.stack.pop().expect("stack underflow");
        let nonneg = match a.tag {
            TypeTag::F32 => a.as_f32() >= 0.0,
            TypeTag::F64 => a.as_f64() >= 0.0,
            t if t.is_unsigned() => true,
            _ => a.raw >= 0,
        };
        vm.stack.push(Value::new(a.tag, nonneg as Word));
    }

    fn op_move(&mut self, vm: &mut Vm<'_>, imm: Word) {
        move_tp(vm, imm);
    }

    fn op_offset(&mut self, vm: &mut Vm<'_>, imm: Word) {
        move_tp(vm, imm);
    }

    fn op_load(&mut self, vm: &mut Vm<'_>) {
        let v = vm.tape[vm.tp];
        vm.stack.push(v);
    }

    fn op_store(&mut self, vm: &mut Vm<'_>) {
        let v = vm.stack.pop().expect("stack underflow");
        vm.tape[vm.tp] = v;
    }

    fn op_deref(&mut self, vm: &mut Vm<'_>) {
        vm.ptr_stack.push(vm.tp);
        let target = vm.tape[vm.tp].raw;
        assert!(
            (0..TAPE_SIZE as Word).contains(&target),
            "deref target out of bounds: {target}"
        );
        vm.tp = target as usize;
    }

    fn op_refer(&mut self, vm: &mut Vm<'_>) {
        vm.tp = vm.ptr_stack.pop().expect("pointer stack underflow");
    }

    fn op_where(&mut self, vm: &mut Vm<'_>) {
        vm.stack.push(Value::new(TypeTag::Ptr, vm.tp as Word));
    }

    fn op_index(&mut self, vm: &mut Vm<'_>) {
        let delta = vm.tape[vm.tp].raw;
        move_tp(vm, delta);
    }

    fn op_print(&mut self, vm: &mut Vm<'_>) {
        let v = vm.stack.pop().expect("stack underflow");
        writeln!(self.out, "{v}").expect("write failed");
    }

    fn op_print_char(&mut self, vm: &mut Vm<'_>) {
        let v = vm.stack.pop().expect("stack underflow");
        let byte = [v.raw as u8];
        self.out.write_all(&byte).expect("write failed");
    }

    fn op_function(&mut self, vm: &mut Vm<'_>, index: Word) {
        let idx = index as usize;
        assert!(idx < MAX_FUNCTIONS, "function index out of range: {index}");
        // ip currently points at the first body instruction.
        vm.functions[idx] = Some(vm.ip);
        let (past_end, _) = scan_block(vm.code(), vm.ip, ScanStop::End);
        vm.ip = past_end;
    }

    fn op_call(&mut self, vm: &mut Vm<'_>, index: Word) {
        let idx = index as usize;
        let entry = vm
            .functions
            .get(idx)
            .copied()
            .flatten()
            .unwrap_or_else(|| panic!("call to undefined function {index}"));
        vm.call_stack.push(Frame {
            return_ip: vm.ip,
            saved_fp: vm.fp,
        });
        vm.fp = vm.stack.len();
        vm.ip = entry;
    }

    fn op_return(&mut self, vm: &mut Vm<'_>) {
        let ret = if vm.stack.len() > vm.fp {
            vm.stack.pop().expect("stack underflow")
        } else {
            Value::default()
        };
        vm.stack.truncate(vm.fp);
        let frame = vm.call_stack.pop().expect("return without call");
        vm.ip = frame.return_ip;
        vm.fp = frame.saved_fp;
        vm.stack.push(ret);
    }

    fn op_if(&mut self, vm: &mut Vm<'_>) {
        let cond = vm.stack.pop().expect("stack underflow");
        if cond.raw != 0 {
            vm.block_stack.push(BlockEntry {
                kind: BlockKind::If,
                ip: vm.ip,
            });
        } else {
            let (past, stopped) = scan_block(vm.code(), vm.ip, ScanStop::ElseOrEnd);
            vm.ip = past;
            // Landing past an `Else` enters the else branch; its shared
            // `EndBlock` still pops a marker.
            if stopped == Op::Else {
                vm.block_stack.push(BlockEntry {
                    kind: BlockKind::If,
                    ip: past,
                });
            }
        }
    }

    fn op_else(&mut self, vm: &mut Vm<'_>) {
        // Reached only on the true-branch path: skip the else branch.
        let entry = vm.block_stack.pop().expect("else without matching if");
        assert!(entry.kind == BlockKind::If, "else without matching if");
        let (past, _) = scan_block(vm.code(), vm.ip, ScanStop::End);
        vm.ip = past;
    }

    fn op_end_block(&mut self, vm: &mut Vm<'_>) {
        let entry = vm.block_stack.pop().expect("end without open block");
        if entry.kind == BlockKind::While {
            // Restart the loop at the condition; the `While` opcode will
            // re-push the marker if the condition still holds.
            vm.ip = entry.ip;
        }
    }

    fn op_while(&mut self, vm: &mut Vm<'_>, cond_ip: Word) {
        let cond = vm.stack.pop().expect("stack underflow");
        if cond.raw != 0 {
            assert!(
                (0..vm.code_len() as Word).contains(&cond_ip),
                "while condition ip out of range: {cond_ip}"
            );
            vm.block_stack.push(BlockEntry {
                kind: BlockKind::While,
                ip: cond_ip as usize,
            });
        } else {
            let (past, _) = scan_block(vm.code(), vm.ip, ScanStop::End);
            vm.ip = past;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Program;
    use pretty_assertions::assert_eq;

    fn run(p: &Program) -> String {
        let mut vm = Vm::new(p.words());
        let mut interp = Interp::new(Vec::new());
        vm.run(&mut interp);
        assert_eq!(vm.block_stack.len(), 0, "unbalanced blocks");
        assert_eq!(vm.call_stack.len(), 0, "unbalanced calls");
        String::from_utf8(interp.into_inner()).unwrap()
    }

    #[test]
    fn arithmetic_left_operand_is_deeper() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 10)
            .op2(Push, TypeTag::I64, 3)
            .op(Sub)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "7\n");
    }

    #[test]
    fn division_round_trip() {
        use Op::*;
        // a == (a/b)*b + a%b for a=-17, b=5
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, -17)
            .op2(Push, TypeTag::I64, 5)
            .op(Div)
            .op2(Push, TypeTag::I64, 5)
            .op(Mul)
            .op2(Push, TypeTag::I64, -17)
            .op2(Push, TypeTag::I64, 5)
            .op(Rem)
            .op(Add)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "-17\n");
    }

    #[test]
    #[should_panic(expected = "division by zero")]
    fn division_by_zero_is_fatal() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 1)
            .op2(Push, TypeTag::I64, 0)
            .op(Div);
        run(&p);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn mismatched_tags_are_fatal() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 1)
            .op2(Push, TypeTag::I32, 1)
            .op(Add);
        run(&p);
    }

    #[test]
    fn float_arithmetic_uses_bit_reinterpretation() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::F32, 0x3fc00000) // 1.5
            .op2(Push, TypeTag::F32, 0x40200000) // 2.5
            .op(Add)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "4\n");
    }

    #[test]
    fn unsigned_prints_unsigned() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::U64, -1).op(Print).op(Halt);
        assert_eq!(run(&p), format!("{}\n", UWord::MAX));
    }

    #[test]
    fn shifts() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 1)
            .op2(Push, TypeTag::I64, 4)
            .op(Lsh)
            .op(Print)
            .op2(Push, TypeTag::I64, -8)
            .op2(Push, TypeTag::I64, 1)
            .op(Arsh)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "16\n-4\n");
    }

    #[test]
    fn logical_ops_yield_zero_or_one() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 7)
            .op2(Push, TypeTag::I64, 0)
            .op(Or)
            .op(Print)
            .op2(Push, TypeTag::I64, 7)
            .op2(Push, TypeTag::I64, 0)
            .op(And)
            .op(Print)
            .op2(Push, TypeTag::I64, -3)
            .op(Gez)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "1\n0\n0\n");
    }

    #[test]
    fn pointer_save_restore_preserves_tp() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Set, TypeTag::Ptr, 5)
            .op(Deref)
            .op(Refer)
            .op(Where)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "0\n");
    }

    #[test]
    fn index_advances_by_cell_value() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Set, TypeTag::I64, 3)
            .op(Index)
            .op(Where)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "3\n");
    }

    #[test]
    #[should_panic(expected = "tape pointer out of bounds")]
    fn move_below_zero_is_fatal() {
        use Op::*;
        let mut p = Program::new();
        p.op1(Move, -1);
        run(&p);
    }

    #[test]
    fn print_char_writes_low_byte() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 0x41)
            .op(PrintChar)
            .op2(Push, TypeTag::I64, 0x0A)
            .op(PrintChar)
            .op(Halt);
        assert_eq!(run(&p), "A\n");
    }

    #[test]
    fn nested_if_skipping() {
        use Op::*;
        // Outer condition false; the skipped body contains a full
        // if/else/end that must not derail the scan.
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 0)
            .op(If)
            .op2(Push, TypeTag::I64, 1)
            .op(If)
            .op2(Push, TypeTag::I64, 1)
            .op(Print)
            .op(Else)
            .op2(Push, TypeTag::I64, 2)
            .op(Print)
            .op(EndBlock)
            .op(Else)
            .op2(Push, TypeTag::I64, 3)
            .op(Print)
            .op(EndBlock)
            .op(Halt);
        assert_eq!(run(&p), "3\n");
    }

    #[test]
    fn if_without_else() {
        use Op::*;
        let mut p = Program::new();
        p.op2(Push, TypeTag::I64, 0)
            .op(If)
            .op2(Push, TypeTag::I64, 1)
            .op(Print)
            .op(EndBlock)
            .op2(Push, TypeTag::I64, 2)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "2\n");
    }

    #[test]
    fn function_return_restores_frame() {
        use Op::*;
        let mut p = Program::new();
        p.op1(Function, 0)
            .op2(Push, TypeTag::I64, 41)
            .op2(Push, TypeTag::I64, 1)
            .op(Add)
            .op(Return)
            .op(EndBlock)
            .op2(Push, TypeTag::I64, 7) // caller operand below the frame
            .op1(Call, 0)
            .op(Add)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "49\n");
    }

    #[test]
    #[should_panic(expected = "call to undefined function")]
    fn call_undefined_function_is_fatal() {
        use Op::*;
        let mut p = Program::new();
        p.op1(Call, 3);
        run(&p);
    }

    #[test]
    fn while_loop_counts_down() {
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
        assert_eq!(run(&p), "3\n2\n1\n");
    }

    #[test]
    fn while_with_false_condition_skips_body() {
        use Op::*;
        let mut p = Program::new();
        let cond_ip = p.len() as Word;
        p.op(Load)
            .op1(While, cond_ip)
            .op2(Push, TypeTag::I64, 9)
            .op(Print)
            .op(EndBlock)
            .op2(Push, TypeTag::I64, 5)
            .op(Print)
            .op(Halt);
        assert_eq!(run(&p), "5\n");
    }
}
