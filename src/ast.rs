//! Abstract syntax tree produced by the parser.
//!
//! Plain owned data: every node has exactly one parent and the tree is never
//! mutated after parsing. The lowering pass matches over these enums
//! exhaustively, so adding a variant is a compile error until it is lowered.

use std::mem;

/// A whole compilation unit: function definitions and top-level calls in
/// source order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Program {
  pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
  Function(Function),
  Call(Call),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
  pub name: String,
  pub params: Vec<String>,
  pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
  pub name: String,
  pub args: Vec<Expr>,
}

/// Ordered statement list forming one indented block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
  pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
  Assign {
    name: String,
    value: Expr,
  },
  If {
    cond: Expr,
    then_block: Block,
    /// Empty when the source has no `else` clause.
    else_block: Block,
  },
  While {
    cond: Expr,
    body: Block,
  },
  Break,
  Continue,
  Return(Expr),
  Call(Call),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Mod,
  Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
  Eq,
  Ne,
  Gt,
  Lt,
  Ge,
  Le,
}

/// Radix a number literal was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
  Decimal,
  Binary,
  Hex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
  Binary {
    op: BinaryOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
  },
  Compare {
    op: CompareOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
  },
  Neg(Box<Expr>),
  Number {
    value: i64,
    base: Base,
  },
  Str(String),
  Ident(String),
  Call(Call),
}

impl Expr {
  pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
    Self::Binary {
      op,
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
    }
  }

  pub fn compare(op: CompareOp, lhs: Expr, rhs: Expr) -> Self {
    Self::Compare {
      op,
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
    }
  }

  pub fn neg(operand: Expr) -> Self {
    Self::Neg(Box::new(operand))
  }

  pub fn number(value: i64) -> Self {
    Self::Number {
      value,
      base: Base::Decimal,
    }
  }

  pub fn ident(name: impl Into<String>) -> Self {
    Self::Ident(name.into())
  }

  /// Move the direct sub-expressions out into `out`, leaving leaves behind.
  fn detach_children(&mut self, out: &mut Vec<Expr>) {
    match self {
      Self::Binary { lhs, rhs, .. } | Self::Compare { lhs, rhs, .. } => {
        out.push(mem::replace(&mut **lhs, Self::number(0)));
        out.push(mem::replace(&mut **rhs, Self::number(0)));
      }
      Self::Neg(operand) => out.push(mem::replace(&mut **operand, Self::number(0))),
      Self::Call(call) => out.append(&mut call.args),
      Self::Number { .. } | Self::Str(_) | Self::Ident(_) => {}
    }
  }
}

/// Operator chains nest one box per operand, so they are torn down with a
/// worklist rather than one stack frame per level.
impl Drop for Expr {
  fn drop(&mut self) {
    let mut pending = Vec::new();
    self.detach_children(&mut pending);
    while let Some(mut expr) = pending.pop() {
      expr.detach_children(&mut pending);
    }
  }
}
