//! Three-address code: the structured IR the bytecode is lowered into, and
//! its Horn-clause serialisation.
//!
//! The IR is a flat instruction vector. `dst`/`lhs`/`rhs` are SSA temp ids
//! (`-1` when absent), `imm` carries constants and label ids, and
//! `dst_type` tags the destination temp where one exists. The textual form
//! groups instructions into Prolog-style clauses: every `Label` starts a
//! clause `l<id> :-` whose body is a comma-separated list of goals
//! terminated by a period.

mod builder;

pub use builder::TacBackend;

use core::fmt;

use crate::value::{TypeTag, UWord, Value, Word};

/// TAC opcode set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TacOp {
    Const,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Lsh,
    Lrsh,
    Arsh,
    Or,
    And,
    /// Unary: dst = !lhs.
    Not,
    /// Unary: dst = lhs >= 0.
    Gez,
    Move,
    Load,
    Store,
    Print,
    PrintChar,
    /// lhs = pointer temp, dst = loaded value.
    Deref,
    /// lhs = value temp, dst = pointer temp.
    Refer,
    /// dst = current address.
    Where,
    /// lhs = pointer temp, imm = signed offset, dst = result pointer.
    Offset,
    /// lhs = pointer temp, rhs = index temp, dst = result.
    Index,
    /// lhs = pointer temp (peeked, not consumed), rhs = value temp.
    Set,
    /// imm = label id.
    Label,
    /// imm = target label.
    Jmp,
    /// lhs = condition temp, imm = target label.
    Jz,
    /// imm = callee label, dst = result temp.
    Call,
    Ret,
}

/// One TAC instruction. Fields default to "absent" (`-1`).
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Instr {
    pub op: TacOp,
    pub dst: i32,
    pub lhs: i32,
    pub rhs: i32,
    pub imm: Word,
    pub dst_type: TypeTag,
}

impl Instr {
    pub fn new(op: TacOp) -> Self {
        Instr {
            op,
            dst: -1,
            lhs: -1,
            rhs: -1,
            imm: 0,
            dst_type: TypeTag::Unknown,
        }
    }
}

/// The growing IR vector.
#[derive(Default, Clone)]
pub struct TacProgram {
    code: Vec<Instr>,
}

impl TacProgram {
    pub fn new() -> Self {
        TacProgram::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    #[inline]
    pub fn emit(&mut self, instr: Instr) {
        self.code.push(instr);
    }

    /// Inserts an instruction at `idx`, shifting the rest forward.
    /// The caller is responsible for rewriting any indices that pointed at
    /// or past `idx`.
    pub fn insert(&mut self, idx: usize, instr: Instr) {
        let idx = idx.min(self.code.len());
        self.code.insert(idx, instr);
    }

    #[inline]
    pub fn instrs(&self) -> &[Instr] {
        &self.code
    }
}

/// Writes one instruction as a predicate goal (no trailing comma/period).
fn write_goal(f: &mut fmt::Formatter<'_>, instr: &Instr) -> fmt::Result {
    use TacOp::*;
    match instr.op {
        Const => match instr.dst_type {
            // Float constants print as their bit pattern, with the decimal
            // value in a comment for readability.
            TypeTag::F32 => {
                let bits = instr.imm as u32;
                let v = Value::new(TypeTag::F32, instr.imm);
                write!(
                    f,
                    "const(t{}, f32, 0x{:08x} /* {:.6} */)",
                    instr.dst,
                    bits,
                    v.as_f32()
                )
            }
            TypeTag::F64 => {
                let bits = instr.imm as UWord as u64;
                let v = Value::new(TypeTag::F64, instr.imm);
                write!(
                    f,
                    "const(t{}, f64, 0x{:016x} /* {:.6} */)",
                    instr.dst,
                    bits,
                    v.as_f64()
                )
            }
            t => write!(f, "const(t{}, {}, {})", instr.dst, t.name(), instr.imm),
        },
        Add | Sub | Mul | Div | Rem | BitAnd | BitOr | BitXor | Lsh | Lrsh | Arsh => {
            let name = match instr.op {
                Add => "add",
                Sub => "sub",
                Mul => "mul",
                Div => "div",
                Rem => "rem",
                BitAnd => "bitand",
                BitOr => "bitor",
                BitXor => "bitxor",
                Lsh => "lsh",
                Lrsh => "lrsh",
                _ => "arsh",
            };
            write!(
                f,
                "{}(t{}, {}, t{}, t{})",
                name,
                instr.dst,
                instr.dst_type.name(),
                instr.lhs,
                instr.rhs
            )
        }
        Or => write!(f, "or(t{}, bool, t{}, t{})", instr.dst, instr.lhs, instr.rhs),
        And => write!(f, "and(t{}, bool, t{}, t{})", instr.dst, instr.lhs, instr.rhs),
        Not => write!(f, "not(t{}, bool, t{})", instr.dst, instr.lhs),
        Gez => write!(f, "gez(t{}, bool, t{})", instr.dst, instr.lhs),
        Move => write!(f, "move({})", instr.imm),
        Load => write!(f, "load(t{})", instr.dst),
        Store => write!(f, "store(t{})", instr.lhs),
        Print => write!(f, "print(t{})", instr.lhs),
        PrintChar => write!(f, "printchar(t{})", instr.lhs),
        Deref => write!(f, "deref(t{}, t{})", instr.dst, instr.lhs),
        Refer => write!(f, "refer(t{}, t{})", instr.dst, instr.lhs),
        Where => write!(f, "where(t{})", instr.dst),
        Offset => write!(f, "offset(t{}, t{}, {})", instr.dst, instr.lhs, instr.imm),
        Index => write!(f, "index(t{}, t{}, t{})", instr.dst, instr.lhs, instr.rhs),
        Set => write!(f, "set(t{}, t{})", instr.lhs, instr.rhs),
        Jmp => write!(f, "jmp(l{})", instr.imm),
        Jz => write!(f, "jz(t{}, l{})", instr.lhs, instr.imm),
        Call => {
            if instr.dst >= 0 {
                write!(f, "call(l{}, t{})", instr.imm, instr.dst)
            } else {
                write!(f, "call(l{})", instr.imm)
            }
        }
        Ret => write!(f, "ret"),
        // Labels are clause heads; a stray one degrades to a no-op goal.
        Label => write!(f, "true"),
    }
}

impl fmt::Display for TacProgram {
    /// The Horn-clause dump. A new clause begins at every `Label`;
    /// instructions before the first label form an implicit `l0` clause, as
    /// do instructions following a clause-terminating `ret`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = &self.code;
        let mut curr_label: i64 = -1;
        let mut i = 0;
        while i < code.len() {
            if code[i].op == TacOp::Label {
                let lbl = code[i].imm as i64;
                if curr_label != -1 {
                    writeln!(f)?;
                }
                curr_label = lbl;
                writeln!(f, "l{} :-", lbl)?;
                i += 1;
                if i >= code.len() || code[i].op == TacOp::Label {
                    writeln!(f, "  true.")?;
                    continue;
                }
            } else if curr_label != 0 {
                if curr_label != -1 {
                    writeln!(f)?;
                }
                curr_label = 0;
                writeln!(f, "l0 :-")?;
            }

            write!(f, "  ")?;
            write_goal(f, &code[i])?;
            if code[i].op == TacOp::Ret {
                writeln!(f, ".")?;
                i += 1;
                continue;
            }
            i += 1;

            let mut closed = false;
            while i < code.len() && code[i].op != TacOp::Label {
                write!(f, ",\n  ")?;
                write_goal(f, &code[i])?;
                if code[i].op == TacOp::Ret {
                    writeln!(f, ".")?;
                    i += 1;
                    closed = true;
                    break;
                }
                i += 1;
            }
            if !closed {
                writeln!(f, ".")?;
            }
        }
        Ok(())
    }
}
