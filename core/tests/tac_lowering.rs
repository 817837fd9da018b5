//! TAC lowering driven through the full toolchain: textual source to
//! Horn-clause dump.

use pretty_assertions::assert_eq;
use tapevm_core::{TacBackend, Vm, parse_source};

fn lower(src: &str) -> String {
    let program = parse_source(src).expect("parse failed");
    let mut vm = Vm::new(program.words());
    let mut backend = TacBackend::new();
    vm.run(&mut backend);
    backend.into_program().to_string()
}

#[test]
fn straight_line_program_is_one_clause() {
    let src = "\
push i64 3
push i64 4
add
push i64 5
mul
print
halt
";
    assert_eq!(
        lower(src),
        "\
l0 :-
  const(t0, i64, 3),
  const(t1, i64, 4),
  add(t2, i64, t0, t1),
  const(t3, i64, 5),
  mul(t4, i64, t2, t3),
  print(t4).
"
    );
}

#[test]
fn functions_and_if_else_lowering() {
    let src = "\
func f
push i64 7
push i64 35
add
ret
end
func g
push i64 5
push i64 3
mul
ret
end
call f
call g
add
print
push i64 1
if
push i64 100
print
else
push i64 200
print
end
halt
";
    assert_eq!(
        lower(src),
        "\
l1 :-
  const(t0, i64, 7),
  const(t1, i64, 35),
  add(t2, i64, t0, t1),
  ret.

l2 :-
  const(t3, i64, 5),
  const(t4, i64, 3),
  mul(t5, i64, t3, t4),
  ret.

l0 :-
  call(l1, t6),
  call(l2, t7),
  add(t8, unknown, t6, t7),
  print(t8),
  const(t9, i64, 1),
  jz(t9, l3),
  const(t10, i64, 100),
  print(t10),
  jmp(l4).

l3 :-
  const(t11, i64, 200),
  print(t11).

l4 :-
  true.
"
    );
}

#[test]
fn while_condition_gets_a_retroactive_label() {
    let src = "\
push i64 4
store
label cond
load
while cond
load
print
load
push i64 1
sub
store
end
halt
";
    assert_eq!(
        lower(src),
        "\
l0 :-
  const(t0, i64, 4),
  store(t0).

l1 :-
  load(t1),
  jz(t1, l2).

l3 :-
  load(t2),
  print(t2),
  load(t3),
  const(t4, i64, 1),
  sub(t5, unknown, t3, t4),
  store(t5),
  jmp(l1).

l2 :-
  true.
"
    );
}

#[test]
fn float_constants_print_bit_patterns() {
    let src = "\
push f32 1.5
print
push f64 1.5
print
halt
";
    assert_eq!(
        lower(src),
        "\
l0 :-
  const(t0, f32, 0x3fc00000 /* 1.500000 */),
  print(t0),
  const(t1, f64, 0x3ff8000000000000 /* 1.500000 */),
  print(t1).
"
    );
}

#[test]
fn pointer_ops_lowering() {
    let src = "\
set ptr 1
deref
set i64 123
refer
offset 1
load
print
halt
";
    assert_eq!(
        lower(src),
        "\
l0 :-
  const(t0, ptr, 1),
  where(t1),
  set(t1, t0),
  deref(t2, t1),
  const(t3, i64, 123),
  set(t2, t3),
  refer(t4, t2),
  offset(t5, t4, 1),
  load(t6),
  print(t6).
"
    );
}

#[test]
fn lowering_is_idempotent() {
    let src = "\
push i64 2
store
label cond
load
while cond
load
print
load
push i64 1
sub
store
end
halt
";
    assert_eq!(lower(src), lower(src));
}
