mod common;

use std::collections::HashSet;

use common::{assert_widened, eval};
use proptest::prelude::*;
use snakec::compile_to_assembly;

/// Integer expression over small literals, small enough that no
/// intermediate value leaves the 32-bit range.
#[derive(Debug, Clone)]
enum Arith {
  Num(i64),
  Neg(Box<Arith>),
  Bin(&'static str, Box<Arith>, Box<Arith>),
}

impl Arith {
  fn source(&self) -> String {
    match self {
      Self::Num(n) => n.to_string(),
      Self::Neg(inner) => format!("(-{})", inner.source()),
      Self::Bin(op, lhs, rhs) => format!("({} {op} {})", lhs.source(), rhs.source()),
    }
  }

  fn value(&self) -> i64 {
    match self {
      Self::Num(n) => *n,
      Self::Neg(inner) => -inner.value(),
      Self::Bin(op, lhs, rhs) => {
        let (a, b) = (lhs.value(), rhs.value());
        match *op {
          "+" => a + b,
          "-" => a - b,
          "*" => a * b,
          "==" => i64::from(a == b),
          "!=" => i64::from(a != b),
          "<" => i64::from(a < b),
          ">" => i64::from(a > b),
          "<=" => i64::from(a <= b),
          ">=" => i64::from(a >= b),
          "or" => i64::from(a != 0 || b != 0),
          other => unreachable!("operator {other}"),
        }
      }
    }
  }
}

fn arith() -> impl Strategy<Value = Arith> {
  let leaf = (0i64..10).prop_map(Arith::Num);
  leaf.prop_recursive(3, 16, 2, |inner| {
    prop_oneof![
      inner.clone().prop_map(|e| Arith::Neg(Box::new(e))),
      (
        prop::sample::select(vec!["+", "-", "*", "==", "!=", "<", ">", "<=", ">=", "or"]),
        inner.clone(),
        inner,
      )
        .prop_map(|(op, lhs, rhs)| Arith::Bin(op, Box::new(lhs), Box::new(rhs))),
    ]
  })
}

/// Statement shapes for nesting control flow; values are irrelevant.
#[derive(Debug, Clone)]
enum Shape {
  Assign,
  If(Vec<Shape>, Vec<Shape>),
  While(Vec<Shape>),
}

fn shapes() -> impl Strategy<Value = Vec<Shape>> {
  let leaf = Just(Shape::Assign);
  let shape = leaf.prop_recursive(4, 24, 3, |inner| {
    let block = prop::collection::vec(inner, 1..3);
    prop_oneof![
      (block.clone(), block.clone()).prop_map(|(then, els)| Shape::If(then, els)),
      block.prop_map(Shape::While),
    ]
  });
  prop::collection::vec(shape, 1..4)
}

fn render(shapes: &[Shape], depth: usize, out: &mut String) {
  let pad = "    ".repeat(depth);
  for shape in shapes {
    match shape {
      Shape::Assign => out.push_str(&format!("{pad}x = x + 1\n")),
      Shape::If(then, els) => {
        out.push_str(&format!("{pad}if x or 0:\n"));
        render(then, depth + 1, out);
        out.push_str(&format!("{pad}else:\n"));
        render(els, depth + 1, out);
      }
      Shape::While(body) => {
        out.push_str(&format!("{pad}while x < 3 or 0:\n"));
        render(body, depth + 1, out);
      }
    }
  }
}

fn program(body: &[Shape], functions: usize) -> String {
  let mut src = String::new();
  for i in 0..functions {
    src.push_str(&format!("def f{i}(x):\n"));
    render(body, 1, &mut src);
    src.push_str("    return x\n\n");
  }
  src.push_str("f0(0)\n");
  src
}

proptest! {
  #[test]
  fn compiled_arithmetic_matches_reference(expr in arith()) {
    let src = format!("def main():\n    return {}\n\nmain()\n", expr.source());
    prop_assert_eq!(eval(&src), expr.value());
  }

  #[test]
  fn nested_control_flow_never_reuses_labels(body in shapes(), functions in 1usize..4) {
    let asm = compile_to_assembly(&program(&body, functions)).unwrap();
    let mut seen = HashSet::new();
    for label in asm.labels() {
      prop_assert!(seen.insert(label.to_string()), "duplicate label {}", label);
    }
  }

  #[test]
  fn wide_rendering_is_a_line_by_line_widening(body in shapes()) {
    let asm = compile_to_assembly(&program(&body, 2)).unwrap();
    assert_widened(&asm);
  }
}
