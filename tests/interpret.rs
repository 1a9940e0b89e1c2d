//! End-to-end interpreter tests asserting the exact `print` output of
//! complete programs.

use gravlax::{Error, VM};

fn run(src: &str) -> Result<String, Error> {
    let mut vm = VM::new();
    let mut out = Vec::new();
    vm.interpret(src, &mut out)?;
    Ok(String::from_utf8(out).expect("interpreter output is UTF-8"))
}

macro_rules! assert_prints {
    ($src:expr, $($line:expr),+ $(,)?) => {
        let output = run($src).expect("program should run cleanly");
        let expected: String = [$($line),+]
            .iter()
            .map(|line| format!("{}\n", line))
            .collect();
        assert_eq!(output, expected, "output of {:?}", $src);
    };
}

macro_rules! assert_runtime_error {
    ($src:expr) => {
        assert!(
            matches!(run($src), Err(Error::Runtime)),
            "expected runtime error from {:?}",
            $src
        );
    };
}

macro_rules! assert_compile_error {
    ($src:expr) => {
        assert!(
            matches!(run($src), Err(Error::Compile)),
            "expected compile error from {:?}",
            $src
        );
    };
}

// ---- expressions and statements ----

#[test]
fn arithmetic() {
    assert_prints!("print (1 + 2) * 3 - 4;", "5");
}

#[test]
fn string_concatenation() {
    assert_prints!("var a = \"foo\"; var b = \"bar\"; print a + b;", "foobar");
}

#[test]
fn string_literals_with_equal_contents_are_one_object() {
    assert_prints!("print \"hi\" == \"hi\";", "true");
    assert_prints!("print \"h\" + \"i\" == \"hi\";", "true");
    assert_prints!("print \"hi\" == \"ho\";", "false");
}

#[test]
fn equality_compares_type_then_value() {
    assert_prints!("print 1 == 1;", "true");
    assert_prints!("print 1 == \"1\";", "false");
    assert_prints!("print nil == false;", "false");
    assert_prints!("print true == true;", "true");
}

#[test]
fn short_circuit_operators_return_operands() {
    assert_prints!("print 1 and 2;", "2");
    assert_prints!("print nil and 2;", "nil");
    assert_prints!("print 1 or 2;", "1");
    assert_prints!("print false or \"fallback\";", "fallback");
}

#[test]
fn if_else_branches() {
    assert_prints!("if (1 < 2) print \"then\"; else print \"else\";", "then");
    assert_prints!("if (1 > 2) print \"then\"; else print \"else\";", "else");
}

#[test]
fn while_loops() {
    assert_prints!(
        "var i = 0; while (i < 3) { print i; i = i + 1; }",
        "0",
        "1",
        "2",
    );
}

#[test]
fn for_loops_run_exactly_their_range() {
    assert_prints!(
        "for (var i = 2; i < 7; i = i + 1) print i;",
        "2",
        "3",
        "4",
        "5",
        "6",
    );
}

#[test]
fn for_loops_with_empty_clauses() {
    assert_prints!(
        "fun first() { for (;;) { return \"done\"; } } print first();",
        "done",
    );
}

#[test]
fn block_scoping_and_shadowing() {
    assert_prints!(
        "var a = \"outer\"; { var a = \"inner\"; print a; } print a;",
        "inner",
        "outer",
    );
}

// ---- functions and closures ----

#[test]
fn closures_count() {
    assert_prints!(
        "fun makeCounter() { var i = 0; fun c() { i = i + 1; return i; } return c; } \
         var c = makeCounter(); print c(); print c(); print c();",
        "1",
        "2",
        "3",
    );
}

#[test]
fn counters_are_independent() {
    assert_prints!(
        "fun makeCounter() { var i = 0; fun c() { i = i + 1; return i; } return c; } \
         var a = makeCounter(); var b = makeCounter(); a(); print a(); print b();",
        "2",
        "1",
    );
}

#[test]
fn closures_capture_variables_not_values() {
    assert_prints!(
        "var f; { var x = 1; fun g() { print x; } x = 2; f = g; } f();",
        "2",
    );
}

#[test]
fn sibling_closures_share_one_upvalue() {
    assert_prints!(
        "var inc; var get; \
         { var v = 10; fun i() { v = v + 1; } fun g() { return v; } inc = i; get = g; } \
         inc(); inc(); print get();",
        "12",
    );
}

#[test]
fn recursion() {
    assert_prints!(
        "fun fib(n) { if (n < 2) return n; return fib(n - 2) + fib(n - 1); } print fib(10);",
        "55",
    );
}

#[test]
fn anonymous_functions_are_first_class() {
    assert_prints!(
        "var twice = fun(x) { return x + x; }; print twice(21);",
        "42",
    );
}

#[test]
fn functions_print_by_name() {
    assert_prints!("fun f() {} print f;", "<fn f>");
    assert_prints!("print clock;", "<native fn>");
}

// ---- classes ----

#[test]
fn inheritance_and_super() {
    assert_prints!(
        "class A { greet() { print \"A\"; } } \
         class B < A { greet() { super.greet(); print \"B\"; } } \
         B().greet();",
        "A",
        "B",
    );
}

#[test]
fn initializer_returns_this() {
    assert_prints!(
        "class P { init(x) { this.x = x; } } var p = P(42); print p.x;",
        "42",
    );
}

#[test]
fn fields_shadow_methods() {
    assert_prints!(
        "class C { f() { print \"method\"; } } var o = C(); \
         o.f = fun() { print \"field\"; }; o.f();",
        "field",
    );
}

#[test]
fn methods_are_inherited_and_overridable() {
    assert_prints!(
        "class A { m() { return \"A\"; } } class B < A {} print B().m();",
        "A",
    );
    assert_prints!(
        "class A { m() { return \"A\"; } } class B < A { m() { return \"B\"; } } print B().m();",
        "B",
    );
}

#[test]
fn bound_methods_remember_their_receiver() {
    assert_prints!(
        "class C { init() { this.v = 7; } get() { return this.v; } } \
         var bound = C().get; print bound();",
        "7",
    );
}

#[test]
fn super_calls_resolve_through_the_compile_time_class() {
    assert_prints!(
        "class A { m() { return \"A\"; } } \
         class B < A { m() { return \"B\"; } test() { return super.m(); } } \
         class C < B {} \
         print C().test();",
        "A",
    );
}

#[test]
fn instances_print_their_class() {
    assert_prints!("class Point {} print Point; print Point();", "Point", "Point instance");
}

#[test]
fn state_lives_in_fields() {
    assert_prints!(
        "class Counter { init() { this.n = 0; } bump() { this.n = this.n + 1; return this.n; } } \
         var c = Counter(); c.bump(); c.bump(); print c.bump();",
        "3",
    );
}

// ---- collector behavior under churn ----

#[test]
fn heavy_instance_churn_survives_collection() {
    assert_prints!(
        "class Node { init() { this.x = 1; } } \
         var keep = Node(); \
         for (var i = 0; i < 50000; i = i + 1) { var n = Node(); n.x = i; } \
         print keep.x;",
        "1",
    );
}

#[test]
fn closures_survive_collection_cycles() {
    assert_prints!(
        "fun makeCounter() { var i = 0; fun c() { i = i + 1; return i; } return c; } \
         var c = makeCounter(); \
         class Junk {} \
         for (var i = 0; i < 50000; i = i + 1) { var j = Junk(); } \
         c(); print c();",
        "2",
    );
}

// ---- error surfacing ----

#[test]
fn runtime_errors() {
    assert_runtime_error!("print missing;");
    assert_runtime_error!("var x = 1; x();");
    assert_runtime_error!("class C {} C().missing;");
    assert_runtime_error!("var NotAClass = 1; class B < NotAClass {}");
    assert_runtime_error!("print 1 + nil;");
    assert_runtime_error!("fun f(a) {} f();");
    assert_runtime_error!("class C {} C(1);");
    assert_runtime_error!("fun f() { f(); } f();");
}

#[test]
fn compile_errors() {
    assert_compile_error!("var a = ;");
    assert_compile_error!("a + b = c;");
    assert_compile_error!("return 1;");
    assert_compile_error!("print this;");
    assert_compile_error!("class C { init() { return 1; } }");
    assert_compile_error!("{ var a = 1; var a = 2; }");
    assert_compile_error!("print \"unterminated;");
}
