//! Microbenchmarks for method dispatch and collector churn.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gravlax::VM;

pub fn super_chain(c: &mut Criterion) {
    let src = r#"
class Base {
  cost() { return 1; }
}
class Mid < Base {
  cost() { return super.cost() + 1; }
}
class Leaf < Mid {
  cost() { return super.cost() + 1; }
}

var leaf = Leaf();
var total = 0;
for (var i = 0; i < 5000; i = i + 1) {
  total = total + leaf.cost();
}
"#;
    c.bench_function("super_chain", |b| {
        let mut vm = VM::default();
        let mut out = std::io::sink();
        b.iter(|| vm.interpret(black_box(src), &mut out));
    });
}

pub fn bound_methods(c: &mut Criterion) {
    // Reading the method off the instance allocates a fresh bound method
    // every iteration.
    let src = r#"
class Scaler {
  init(k) { this.k = k; }
  scale(x) { return x * this.k; }
}

var s = Scaler(3);
var total = 0;
for (var i = 0; i < 5000; i = i + 1) {
  var m = s.scale;
  total = total + m(i);
}
"#;
    c.bench_function("bound_methods", |b| {
        let mut vm = VM::default();
        let mut out = std::io::sink();
        b.iter(|| vm.interpret(black_box(src), &mut out));
    });
}

pub fn callable_fields(c: &mut Criterion) {
    // Invoking through a field that holds a lambda takes the slow path
    // where the field shadows any method of the same name.
    let src = r#"
class Holder {}

var h = Holder();
h.op = fun(x) { return x + 1; };
var n = 0;
for (var i = 0; i < 5000; i = i + 1) {
  n = h.op(n);
}
"#;
    c.bench_function("callable_fields", |b| {
        let mut vm = VM::default();
        let mut out = std::io::sink();
        b.iter(|| vm.interpret(black_box(src), &mut out));
    });
}

pub fn instance_churn(c: &mut Criterion) {
    let src = r#"
class Pair {
  init(a, b) { this.a = a; this.b = b; }
  sum() { return this.a + this.b; }
}

var total = 0;
for (var i = 0; i < 20000; i = i + 1) {
  total = total + Pair(i, i + 1).sum();
}
"#;
    c.bench_function("instance_churn", |b| {
        let mut vm = VM::default();
        let mut out = std::io::sink();
        b.iter(|| vm.interpret(black_box(src), &mut out));
    });
}

criterion_group!(dispatch, super_chain, bound_methods, callable_fields, instance_churn);
criterion_main!(dispatch);
