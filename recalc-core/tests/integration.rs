//! Integration Tests for the Expression Engine
//!
//! These tests build expressions through the public API and check caching,
//! invalidation, sharing and type erasure end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use recalc_core::prelude::*;

/// A vector parameter reading from shared state, counting its updates.
fn sensor(state: &Arc<Mutex<Vec<f64>>>, calls: &Arc<AtomicUsize>) -> Parameter<Value> {
    let state = state.clone();
    let calls = calls.clone();
    let len = state.lock().len();
    Parameter::vector(len, move |v| {
        calls.fetch_add(1, Ordering::SeqCst);
        v.copy_from_slice(&state.lock());
    })
}

fn constant_matrix(rows: &[[f64; 2]]) -> Parameter<Value> {
    let m = Matrix::from_rows(rows);
    Parameter::matrix(m.rows(), m.cols(), move |out| out.clone_from(&m))
}

/// Evaluating twice without a dirty-mark returns the cached value.
#[test]
fn evaluate_is_idempotent_without_dirtying() {
    let state = Arc::new(Mutex::new(vec![1.0, 2.0]));
    let calls = Arc::new(AtomicUsize::new(0));
    let x = Expr::from(sensor(&state, &calls));
    let a = Expr::from(constant_matrix(&[[1.0, 2.0], [3.0, 4.0]]));

    let e = &a * &x + &x;
    let built = ExprBuilder::new().build(&e).unwrap();

    let first = built.evaluate().unwrap().clone();
    assert_eq!(first, Value::Vector(vec![6.0, 13.0]));

    // External state changes, but nothing was marked dirty
    *state.lock() = vec![10.0, 20.0];
    for _ in 0..5 {
        assert_eq!(*built.evaluate().unwrap(), first);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(built.nodes().iter().all(|n| n.evaluation_count() <= 1));
}

/// Marking a parameter dirty gives the same result as rebuilding from scratch.
#[test]
fn dirty_parameter_matches_fresh_build() {
    let state = Arc::new(Mutex::new(vec![1.0, 2.0]));
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Registry::new();

    let build = |registry: &Registry| {
        let p = sensor(&state, &calls);
        registry.register(&p);
        let x = Expr::from(p);
        let a = Expr::from(constant_matrix(&[[2.0, 0.0], [1.0, 1.0]]));
        let e = vcat([dot(&x, &x), x.t() * &a * &x]) - 1.0 * vcat([x.at(0), x.at(1)]);
        ExprBuilder::new().build(&e).unwrap()
    };

    let built = build(&registry);
    built.evaluate().unwrap();

    for step in 0..4 {
        let next = vec![step as f64 - 1.5, 0.5 * step as f64];
        *state.lock() = next;
        registry.mark_all_dirty();

        let incremental = built.evaluate().unwrap().clone();
        let fresh = build(&Registry::new());
        assert_eq!(incremental, *fresh.evaluate().unwrap());
    }
}

/// Marking an unrelated parameter dirty does not recompute the root.
#[test]
fn unrelated_parameter_is_ignored() {
    let used = Parameter::scalar(|| 2.0);
    let unrelated = Parameter::scalar(|| 3.0);
    let registry = Registry::new();
    registry.register(&used);
    registry.register(&unrelated);

    let built = ExprBuilder::new()
        .build(&(Expr::from(&used) * Expr::from(vec![1.0, 2.0])))
        .unwrap();
    assert_eq!(*built.evaluate().unwrap(), Value::Vector(vec![2.0, 4.0]));

    unrelated.mark_dirty();
    built.evaluate().unwrap();
    assert_eq!(built.root().evaluation_count(), 1);

    // Recomputes even though the update produces the same value
    assert_eq!(registry.mark_all_dirty(), 2);
    built.evaluate().unwrap();
    assert_eq!(built.root().evaluation_count(), 2);
}

/// A sub-expression referenced twice runs once per evaluation.
#[test]
fn shared_subexpression_runs_once_per_evaluation() {
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = runs.clone();

    let mut builder = ExprBuilder::new();
    builder.register(Function::new(
        "counted",
        1,
        |shapes: &[Shape]| Ok(shapes[0]),
        move |args: &[&Value]| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            Ok(args[0].clone())
        },
    ));

    let p = Parameter::vector(3, |v| v.copy_from_slice(&[1.0, 2.0, 3.0]));
    let shared = call("counted", [&p]);
    let e = dot(&shared, &shared) + call("sum", [&shared]);
    let built = builder.build(&e).unwrap();

    assert_eq!(*built.evaluate().unwrap(), Value::Scalar(14.0 + 6.0));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    p.mark_dirty();
    built.evaluate().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Bracket form and explicit concatenation agree.
#[test]
fn bracket_matches_explicit_concat() {
    let x = Expr::from(Parameter::vector(2, |v| v.copy_from_slice(&[1.0, 2.0])));
    let y = Expr::from(Parameter::vector(2, |v| v.copy_from_slice(&[3.0, 4.0])));
    let builder = ExprBuilder::new();
    let eval = |e: &Expr| builder.build(e).unwrap().evaluate().unwrap().clone();

    assert_eq!(eval(&bracket([&x, &y])), Value::Vector(vec![1.0, 2.0, 3.0, 4.0]));
    assert_eq!(eval(&vcat([&x, &y])), Value::Vector(vec![1.0, 2.0, 3.0, 4.0]));
    assert_eq!(eval(&vcat([x.clone(), Expr::from(3.0)])), Value::Vector(vec![1.0, 2.0, 3.0]));
    assert_eq!(
        eval(&vcat([&x, &y, &x])),
        Value::Vector(vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0])
    );
    assert_eq!(
        eval(&bracket([bracket([&x, &y]), x.clone()])),
        eval(&vcat([&x, &y, &x]))
    );
}

/// Concatenating variables with numbers yields affine rows.
#[test]
fn concat_of_variables_and_numbers() {
    let xs = variables(2);
    let e = vcat([Expr::from(xs.as_slice()), Expr::from(5.0)]);
    let built = ExprBuilder::new().build(&e).unwrap();

    let rows = built.wrap::<Vec<AffineFunction>>().unwrap();
    let rows = rows.evaluate().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].value(|_| 0.0), 5.0);
    assert_eq!(rows[0].value(|v| if v == xs[0] { 7.0 } else { 0.0 }), 7.0);
}

/// A wrapped expression tracks its graph under any order of dirty-marks.
#[test]
fn wrapped_expression_matches_graph() {
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();
    let p = Parameter::scalar(move || counter_clone.fetch_add(1, Ordering::SeqCst) as f64);

    let e = Expr::from(&p) * 2.0 + 1.0;
    let built = ExprBuilder::new().build(&e).unwrap();
    let wrapped: WrappedExpression<f64> = built.wrap().unwrap();

    for step in 0..6 {
        match step % 3 {
            0 => p.mark_dirty(),
            1 => wrapped.mark_dirty(),
            _ => built.mark_all_dirty(),
        }
        let through_wrapper = *wrapped.evaluate().unwrap();
        assert_eq!(Value::Scalar(through_wrapper), *built.evaluate().unwrap());
    }
}

/// The typical control loop: register, dirty all, evaluate.
#[test]
fn control_loop_with_decision_variables() {
    let gain = Arc::new(Mutex::new(1.0));
    let gain_clone = gain.clone();
    let registry = Registry::new();

    let a = Parameter::matrix(2, 2, move |m| {
        let g = *gain_clone.lock();
        m.set(0, 0, g);
        m.set(1, 1, 2.0 * g);
    })
    .named("A");
    let b = Parameter::vector(2, |v| v.fill(1.0)).named("b");
    registry.register(&a);
    registry.register(&b);

    let x = variables(2);
    let e = Expr::from(&a) * Expr::from(x.as_slice()) - Expr::from(&b);
    let built = ExprBuilder::new().build(&e).unwrap();
    let constraints: WrappedExpression<Vec<AffineFunction>> = built.wrap().unwrap();

    for g in [1.0, 2.0, 0.5] {
        *gain.lock() = g;
        registry.mark_all_dirty();

        let rows = constraints.evaluate().unwrap();
        let at_one = |row: &AffineFunction| row.value(|_| 1.0);
        assert_eq!(at_one(&rows[0]), g - 1.0);
        assert_eq!(at_one(&rows[1]), 2.0 * g - 1.0);
        // The symbolic structure is the same every cycle
        assert_eq!(rows[0].linear.len(), 2);
    }
}

/// Failed evaluations leave the node dirty and are retried.
#[test]
fn failing_function_is_retried() {
    let fail = Arc::new(AtomicUsize::new(1));
    let fail_clone = fail.clone();

    let mut builder = ExprBuilder::new();
    builder.register(Function::new(
        "flaky",
        1,
        |shapes: &[Shape]| Ok(shapes[0]),
        move |args: &[&Value]| {
            if fail_clone.load(Ordering::SeqCst) > 0 {
                return Err(EvalError::Function {
                    name: "flaky".into(),
                    message: "sensor offline".into(),
                });
            }
            Ok(args[0].clone())
        },
    ));

    let built = builder.build(&call("flaky", [2.0])).unwrap();
    assert!(matches!(built.evaluate(), Err(EvalError::Function { .. })));
    assert!(built.is_dirty());

    fail.store(0, Ordering::SeqCst);
    assert_eq!(*built.evaluate().unwrap(), Value::Scalar(2.0));
}
