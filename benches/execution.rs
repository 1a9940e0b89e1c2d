//! Microbenchmarks for the dispatch loop, closures, and string interning.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gravlax::VM;

pub fn arith_loop(c: &mut Criterion) {
    let src = r#"
var total = 0;
for (var i = 0; i < 20000; i = i + 1) {
  total = total + i * 3 - i / 2;
}
"#;
    c.bench_function("arith_loop", |b| {
        let mut vm = VM::default();
        let mut out = std::io::sink();
        b.iter(|| vm.interpret(black_box(src), &mut out));
    });
}

pub fn lambda_pipeline(c: &mut Criterion) {
    let src = r#"
fun adder(amount) {
  return fun(x) { return x + amount; };
}

var add2 = adder(2);
var add3 = adder(3);
var n = 0;
for (var i = 0; i < 5000; i = i + 1) {
  n = add3(add2(n));
}
"#;
    c.bench_function("lambda_pipeline", |b| {
        let mut vm = VM::default();
        let mut out = std::io::sink();
        b.iter(|| vm.interpret(black_box(src), &mut out));
    });
}

pub fn shared_upvalue(c: &mut Criterion) {
    let src = r#"
var bump;
var read;
{
  var cell = 0;
  fun up() { cell = cell + 1; }
  fun look() { return cell; }
  bump = up;
  read = look;
}
for (var i = 0; i < 10000; i = i + 1) {
  bump();
}
read();
"#;
    c.bench_function("shared_upvalue", |b| {
        let mut vm = VM::default();
        let mut out = std::io::sink();
        b.iter(|| vm.interpret(black_box(src), &mut out));
    });
}

pub fn string_growth(c: &mut Criterion) {
    // Every iteration interns a longer string, so the heap fills with
    // mostly-dead strings and the collector has to run mid-program.
    let src = r#"
var tail = "";
for (var i = 0; i < 300; i = i + 1) {
  tail = tail + "ab";
}
"#;
    c.bench_function("string_growth", |b| {
        let mut vm = VM::default();
        let mut out = std::io::sink();
        b.iter(|| vm.interpret(black_box(src), &mut out));
    });
}

criterion_group!(execution, arith_loop, lambda_pipeline, shared_upvalue, string_growth);
criterion_main!(execution);
