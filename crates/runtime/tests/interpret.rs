//! End-to-end interpreter tests: compile and run whole programs, capturing
//! what they print.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use jmpl_runtime::{InterpretResult, RuntimeConfig, Vm};

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_with(source: &str, stress: bool) -> (InterpretResult, String) {
    let buf = SharedBuf::default();
    let config = RuntimeConfig::new().with_stress_gc(stress);
    let mut vm = Vm::with_output(config, Box::new(buf.clone()));
    let result = vm.interpret(source);
    let output = String::from_utf8(buf.0.borrow().clone()).expect("valid utf8 output");
    (result, output)
}

fn run(source: &str) -> (InterpretResult, String) {
    run_with(source, false)
}

fn assert_output(source: &str, expected: &str) {
    let (result, output) = run(source);
    assert_eq!(result, InterpretResult::Ok, "program failed:\n{source}");
    assert_eq!(output, expected, "wrong output for:\n{source}");
}

fn assert_runtime_error(source: &str) {
    let (result, _) = run(source);
    assert_eq!(
        result,
        InterpretResult::RuntimeError,
        "expected runtime error for:\n{source}"
    );
}

// --- Arithmetic and printing ---

#[test]
fn test_arithmetic_precedence() {
    assert_output("let x := 1 + 2 * 3\nprintln(x)\n", "7\n");
    assert_output("println(2 ^ 3 * 2)\n", "16\n");
    assert_output("println(7 % 3)\n", "1\n");
    assert_output("println(-(3 - 5))\n", "2\n");
    assert_output("println(10 / 4)\n", "2.5\n");
}

#[test]
fn test_number_display_drops_integral_fraction() {
    assert_output("println(4 / 2)\n", "2\n");
    assert_output("println(0.5 + 0.25)\n", "0.75\n");
}

#[test]
fn test_number_display_uses_six_significant_figures() {
    assert_output("println(1 / 3)\n", "0.333333\n");
    assert_output("println(0.1 + 0.2)\n", "0.3\n");
    assert_output("println(10000000 * 10)\n", "1e+08\n");
    assert_output("println(\"n = \" + 10 / 3)\n", "n = 3.33333\n");
}

#[test]
fn test_modulo_by_zero_is_nan() {
    assert_output("println(7 % 0)\n", "nan\n");
}

#[test]
fn test_out_statement() {
    assert_output("out 1 + 1\n", "2\n");
    assert_output("out \"hi\"\n", "hi\n");
}

#[test]
fn test_print_and_println() {
    assert_output("print(1)\nprint(2)\nprintln(3)\n", "123\n");
}

// --- Booleans and logic ---

#[test]
fn test_logic_operators() {
    assert_output("println(true and false)\nprintln(true or false)\n", "false\ntrue\n");
    assert_output("println(true xor true)\nprintln(true xor false)\n", "false\ntrue\n");
    assert_output("println(\u{00AC}true)\n", "false\n");
    assert_output("println(false \u{21D2} false)\nprintln(true \u{21D2} false)\n", "true\nfalse\n");
}

#[test]
fn test_short_circuit_skips_rhs() {
    // The undefined global on the right is never evaluated.
    assert_output("println(false and missing())\n", "false\n");
    assert_output("println(true or missing())\n", "true\n");
}

#[test]
fn test_equality_is_structural() {
    assert_output("println(1 == 1.0)\nprintln(1 \u{00AC}= 2)\n", "true\ntrue\n");
    assert_output("println((1, 2) == (1, 2))\n", "true\n");
    assert_output("println({1, 2} == {2, 1})\n", "true\n");
    assert_output("println(\"a\" == \"b\")\nprintln(null == null)\n", "false\ntrue\n");
    assert_output("println(1 == \"1\")\n", "false\n");
}

// --- Control flow ---

#[test]
fn test_if_then_else() {
    assert_output("if 1 < 2 then out 1 else out 2\n", "1\n");
    assert_output("if 1 > 2 then out 1 else out 2\n", "2\n");
    let source = "\
if 2 > 1 then
    out 10
else
    out 20
";
    assert_output(source, "10\n");
}

#[test]
fn test_while_loop() {
    let source = "\
let i := 0
let total := 0
while i < 5 do
    i := i + 1
    total := total + i
println(total)
";
    assert_output(source, "15\n");
}

// --- Functions and closures ---

#[test]
fn test_function_call_and_return() {
    let source = "\
func add(a, b):
    return a + b
println(add(2, 3))
";
    assert_output(source, "5\n");
}

#[test]
fn test_implicit_return_of_last_expression_statement() {
    let source = "\
func f():
    1 + 2
println(f())
";
    assert_output(source, "3\n");
}

#[test]
fn test_explicit_return_beats_implicit() {
    let source = "\
func f(x):
    x * 10
    if x > 0 then
        return x
    return 0 - x
println(f(4))
println(f(-4))
";
    assert_output(source, "4\n4\n");
}

#[test]
fn test_function_without_return_yields_null() {
    let source = "\
func f():
    let x := 1
println(f())
";
    assert_output(source, "null\n");
}

#[test]
fn test_counter_closure() {
    let source = "\
func make():
    let c := 0
    func inc():
        c := c + 1
        return c
    return inc
let f := make()
println(f())
println(f())
";
    assert_output(source, "1\n2\n");
}

#[test]
fn test_closures_share_captured_variable() {
    let source = "\
func make():
    let c := 0
    func inc():
        c := c + 1
        return c
    func get():
        return c
    return (inc, get)
let pair := make()
let inc := pair[0]
let get := pair[1]
println(inc())
println(inc())
println(get())
";
    assert_output(source, "1\n2\n2\n");
}

#[test]
fn test_closure_captures_value_after_frame_returns() {
    let source = "\
func adder(n):
    func add(x):
        return x + n
    return add
let add5 := adder(5)
let add7 := adder(7)
println(add5(10))
println(add7(10))
";
    assert_output(source, "15\n17\n");
}

#[test]
fn test_recursion() {
    let source = "\
func fib(n):
    if n < 2 then
        return n
    return fib(n - 1) + fib(n - 2)
println(fib(10))
";
    assert_output(source, "55\n");
}

// --- Strings ---

#[test]
fn test_string_concatenation_and_interning() {
    assert_output("println(\"foo\" + \"bar\")\n", "foobar\n");
    // Interned strings compare by identity, so a concatenation equals the
    // directly written literal.
    assert_output("println(\"foo\" + \"bar\" == \"foobar\")\n", "true\n");
    assert_output("println(\"n = \" + 3)\n", "n = 3\n");
    assert_output("println(1 + \"x\")\n", "1x\n");
}

#[test]
fn test_unicode_string_length_and_index() {
    assert_output("println(\"h\u{e9}llo\"[1])\n", "\u{e9}\n");
    assert_output("println(#\"h\u{e9}llo\")\n", "5\n");
    assert_output("println(#\"\")\n", "0\n");
    assert_output("println(\"\u{1F600}ab\"[0])\n", "\u{1F600}\n");
}

#[test]
fn test_string_escapes() {
    assert_output("print(\"a\\nb\")\n", "a\nb");
    assert_output("println(\"\\x41\\u0042\")\n", "AB\n");
}

#[test]
fn test_string_slicing_by_code_point() {
    assert_output("println(\"h\u{e9}llo\"[1 \u{2026} 3])\n", "\u{e9}ll\n");
    assert_output("println(\"abcde\"[\u{2026} 1])\n", "ab\n");
    assert_output("println(\"abcde\"[3 \u{2026}])\n", "de\n");
    assert_output("println(\"abc\"[-2 \u{2026} -1])\n", "bc\n");
    // Slices clamp; a whole-string slice round-trips.
    assert_output("println(\"abc\"[0 \u{2026} 99])\n", "abc\n");
    assert_output("let s := \"h\u{e9}llo\"\nprintln(s[0 \u{2026} #s - 1] == s)\n", "true\n");
}

#[test]
fn test_string_membership() {
    assert_output("println(\"ll\" \u{2208} \"hello\")\n", "true\n");
    assert_output("println(\"z\" \u{2208} \"hello\")\n", "false\n");
}

// --- Sets ---

#[test]
fn test_set_union_and_equality() {
    let source = "\
let s := {1, 2, 3} \u{222A} {3, 4}
println(#s)
println(s == {1, 2, 3, 4})
";
    assert_output(source, "4\ntrue\n");
}

#[test]
fn test_set_operators() {
    assert_output("println({1, 2, 3} \u{2229} {2, 3, 4} == {2, 3})\n", "true\n");
    assert_output("println({1, 2, 3} \\ {2} == {1, 3})\n", "true\n");
    assert_output("println(2 \u{2208} {1, 2})\nprintln(5 \u{2208} {1, 2})\n", "true\nfalse\n");
    assert_output("println({1} \u{2282} {1, 2})\nprintln({1, 2} \u{2282} {1, 2})\n", "true\nfalse\n");
    assert_output("println({1, 2} \u{2286} {1, 2})\nprintln({3} \u{2286} {1, 2})\n", "true\nfalse\n");
}

#[test]
fn test_set_laws() {
    let source = "\
let a := {1, 2, 3}
let b := {3, 4}
println(a \u{222A} a == a)
println(a \u{2229} a == a)
println(a \\ a == {})
println(a \u{2286} a \u{222A} b)
println(#(a \u{222A} b) == #a + #b - #(a \u{2229} b))
";
    assert_output(source, "true\ntrue\ntrue\ntrue\ntrue\n");
}

#[test]
fn test_set_omissions() {
    assert_output("println(#{1 \u{2026} 10})\n", "10\n");
    assert_output("println({1, 3 \u{2026} 9} == {1, 3, 5, 7, 9})\n", "true\n");
    // A descending bound with the default step is empty.
    assert_output("println(#{5 \u{2026} 1})\n", "0\n");
    assert_output("println({5, 4 \u{2026} 1} == {1, 2, 3, 4, 5})\n", "true\n");
}

#[test]
fn test_set_builder() {
    assert_output(
        "println({x \u{2208} {1 \u{2026} 10} | x % 2 == 0} == {2, 4, 6, 8, 10})\n",
        "true\n",
    );
    assert_output("println(#{x \u{2208} {1 \u{2026} 5} | x > 5})\n", "0\n");
    assert_output("println(#{c \u{2208} \"aba\" | true})\n", "2\n");
}

#[test]
fn test_nested_sets_and_tuples_in_sets() {
    assert_output("println({{1, 2}} == {{2, 1}})\n", "true\n");
    assert_output("println((1, 2) \u{2208} {(1, 2), (3, 4)})\n", "true\n");
    assert_output("println(#{(1, 2), (1, 2), (2, 1)})\n", "2\n");
}

#[test]
fn test_arb_picks_a_member() {
    assert_output("println(arb {42})\n", "42\n");
    assert_output("let s := {1 \u{2026} 9}\nprintln(arb s \u{2208} s)\n", "true\n");
    assert_output("println(arb {})\n", "null\n");
}

#[test]
fn test_empty_set_prints_as_braces() {
    assert_output("println({})\n", "{}\n");
}

// --- Tuples ---

#[test]
fn test_tuple_omission_prints_in_order() {
    assert_output("println((1 \u{2026} 5))\n", "(1, 2, 3, 4, 5)\n");
    assert_output("println((1, 3 \u{2026} 9))\n", "(1, 3, 5, 7, 9)\n");
    assert_output("println((5, 4 \u{2026} 1))\n", "(5, 4, 3, 2, 1)\n");
}

#[test]
fn test_tuple_index_and_slice() {
    let source = "\
let t := (\"a\", \"b\", \"c\")
println(t[-1])
println(t[0 \u{2026} 1])
";
    assert_output(source, "c\n(a, b)\n");
}

#[test]
fn test_tuple_shapes() {
    assert_output("println(())\n", "()\n");
    assert_output("println((1,))\n", "(1,)\n");
    assert_output("println(#())\nprintln(#(1,))\n", "0\n1\n");
}

#[test]
fn test_tuple_concatenation() {
    assert_output("println((1, 2) + (3,))\n", "(1, 2, 3)\n");
    assert_output("println(#((1, 2) + (3, 4)) == #(1, 2) + #(3, 4))\n", "true\n");
    // Concatenation is associative.
    assert_output(
        "println(((1,) + (2,)) + (3,) == (1,) + ((2,) + (3,)))\n",
        "true\n",
    );
}

#[test]
fn test_tuple_slice_round_trips() {
    assert_output("let t := (1, 2, 3)\nprintln(t[0 \u{2026} #t - 1] == t)\n", "true\n");
}

// --- Summation ---

#[test]
fn test_summation() {
    assert_output("println(\u{2211}(x \u{2208} {1 \u{2026} 5}) x)\n", "15\n");
    assert_output("println(Sum(x \u{2208} {1 \u{2026} 10} | x % 2 == 0) x)\n", "30\n");
    assert_output("println(\u{2211}(x \u{2208} (1, 2, 3)) x * x)\n", "14\n");
    assert_output("println(\u{2211}(x \u{2208} {}) x)\n", "0\n");
}

// --- Natives ---

#[test]
fn test_math_natives() {
    assert_output("println(floor(2.7))\nprintln(ceil(2.2))\nprintln(round(2.5))\n", "2\n3\n3\n");
    assert_output("println(max(2, 5))\nprintln(min(2, 5))\n", "5\n2\n");
    assert_output("println(sin(pi()))\nprintln(cos(pi() / 2))\n", "0\n0\n");
    assert_output("println(sin(0))\nprintln(arctan(0))\n", "0\n0\n");
    assert_output("println(max(1, \"x\"))\n", "null\n");
}

#[test]
fn test_type_native() {
    let source = "\
println(type(1))
println(type(\"s\"))
println(type({1}))
println(type((1, 2)))
println(type(true))
println(type(null))
println(type(println))
func f():
    return 1
println(type(f))
";
    assert_output(
        source,
        "number\nstring\nset\ntuple\nbool\nnull\nnative\nfunction\n",
    );
}

#[test]
fn test_clock_is_monotonic() {
    assert_output("println(clock() >= 0)\n", "true\n");
}

// --- Runtime errors ---

#[test]
fn test_runtime_errors() {
    assert_runtime_error("println(1 / 0)\n");
    assert_runtime_error("println(missing)\n");
    assert_runtime_error("missing := 1\n");
    assert_runtime_error("let x := 1\nx()\n");
    assert_runtime_error("println(1 + {1})\n");
    assert_runtime_error("println(1 < \"a\")\n");
    assert_runtime_error("println((1, 2)[5])\n");
    assert_runtime_error("println(\"abc\"[3])\n");
    assert_runtime_error("println({1}[0])\n");
    assert_runtime_error("println(#1)\n");
    assert_runtime_error("println(arb 5)\n");
    assert_runtime_error("out {x \u{2208} 5 | true}\n");
    assert_runtime_error("out {1 \u{2026} 2.5}\n");
    assert_runtime_error("out {1, 1 \u{2026} 5}\n");
    assert_runtime_error("func f(a):\n    return a\nf(1, 2)\n");
    assert_runtime_error("sleep(1, 2)\n");
}

#[test]
fn test_deep_recursion_overflows_frames() {
    let source = "\
func f():
    return f()
f()
";
    assert_runtime_error(source);
}

// --- Globals persist across interpret calls (REPL behaviour) ---

#[test]
fn test_globals_persist_across_lines() {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(RuntimeConfig::new(), Box::new(buf.clone()));
    assert_eq!(vm.interpret("let x := 41\n"), InterpretResult::Ok);
    assert_eq!(vm.interpret("x := x + 1\n"), InterpretResult::Ok);
    assert_eq!(vm.interpret("println(x)\n"), InterpretResult::Ok);
    let output = String::from_utf8(buf.0.borrow().clone()).expect("utf8");
    assert_eq!(output, "42\n");
}

// --- GC behaviour ---

#[test]
fn test_allocation_heavy_program() {
    let source = "\
let acc := \"\"
let i := 0
while i < 200 do
    acc := acc + \"x\"
    i := i + 1
println(#acc)
";
    assert_output(source, "200\n");
}

#[test]
fn test_stress_gc_matches_normal_output() {
    let source = "\
func make(n):
    func get():
        return n
    return get
let fs := (make(1), make(2), make(3))
let total := \u{2211}(f \u{2208} fs) f()
let s := {x \u{2208} {1 \u{2026} 20} | x % 3 == 0}
println(total)
println(#s)
println(\"a\" + \"b\" + \"c\")
";
    let (result, output) = run_with(source, true);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "6\n6\nabc\n");

    let (result_normal, output_normal) = run_with(source, false);
    assert_eq!(result_normal, InterpretResult::Ok);
    assert_eq!(output, output_normal);
}
