//! Lowering pass: walks the AST and drives the code generator.
//!
//! All traversal state lives in [`LowerCtx`] and is handed explicitly to every
//! lowering function (and through the generator's callbacks): the scope stack
//! of frame slots, the loop-label stack, the epilogue label of the function
//! being lowered, and the table of known functions.

use std::collections::HashMap;

use snafu::{OptionExt, ensure};

use crate::ast::{BinaryOp, Block, Call, CompareOp, Expr, Function, Item, Program, Stmt};
use crate::codegen::{Assembly, CodeGen, Instr, LoopLabels, Operand, Reg};
use crate::error::{
  ArityMismatchSnafu, BreakOrContinueOutsideLoopSnafu, CompileResult, DuplicateFunctionSnafu,
  UndefinedFunctionSnafu, UndefinedVariableSnafu,
};

/// Slot of the first parameter: above the saved frame pointer and the return
/// address.
const FIRST_PARAM_SLOT: i32 = 2;

/// Lower a parsed program into its instruction sequence.
pub fn lower(program: &Program) -> CompileResult<Assembly> {
  let mut cx = LowerCtx::new(collect_functions(program)?);
  let mut cg = CodeGen::new();

  for item in &program.items {
    match item {
      Item::Function(func) => lower_function(&mut cg, &mut cx, func)?,
      Item::Call(call) => lower_call(&mut cg, &mut cx, call)?,
    }
  }

  Ok(cg.finish())
}

/// Entry label of a function.
pub fn function_label(name: &str) -> String {
  format!("_fn_{name}")
}

fn epilogue_label(name: &str) -> String {
  format!("_ret_{name}")
}

fn skip_label(name: &str) -> String {
  format!("_skip_{name}")
}

/// Map every defined function to its parameter count so calls can be checked
/// regardless of definition order.
fn collect_functions(program: &Program) -> CompileResult<HashMap<String, usize>> {
  let mut functions = HashMap::new();
  for item in &program.items {
    if let Item::Function(func) = item {
      let previous = functions.insert(func.name.clone(), func.params.len());
      ensure!(
        previous.is_none(),
        DuplicateFunctionSnafu {
          name: func.name.as_str()
        }
      );
    }
  }
  Ok(functions)
}

/// Frame slots of one function body.
#[derive(Debug, Default, Clone)]
struct Scope {
  locals: HashMap<String, i32>,
  params: HashMap<String, i32>,
  /// Slot of the most recently declared local; locals grow downwards.
  last_local: i32,
}

impl Scope {
  fn with_params(params: &[String]) -> Self {
    let params = params
      .iter()
      .zip(FIRST_PARAM_SLOT..)
      .map(|(name, slot)| (name.clone(), slot))
      .collect();
    Self {
      params,
      ..Self::default()
    }
  }

  fn local(&self, name: &str) -> Option<i32> {
    self.locals.get(name).copied()
  }

  fn declare_local(&mut self, name: &str) -> i32 {
    self.last_local -= 1;
    self.locals.insert(name.to_string(), self.last_local);
    self.last_local
  }

  /// Locals shadow parameters.
  fn lookup(&self, name: &str) -> Option<i32> {
    self.local(name).or_else(|| self.params.get(name).copied())
  }
}

#[derive(Debug)]
pub(crate) struct LowerCtx {
  /// One scope per function being lowered; only the innermost is visible.
  scopes: Vec<Scope>,
  loops: Vec<LoopLabels>,
  /// Number of enclosing branch or loop bodies within the current function.
  block_depth: usize,
  /// Label `return` jumps to; `None` outside any function body.
  epilogue: Option<String>,
  functions: HashMap<String, usize>,
}

impl LowerCtx {
  fn new(functions: HashMap<String, usize>) -> Self {
    Self {
      scopes: Vec::new(),
      loops: Vec::new(),
      block_depth: 0,
      epilogue: None,
      functions,
    }
  }

  fn scope(&self) -> Option<&Scope> {
    self.scopes.last()
  }

  /// Enter a function body, returning the enclosing epilogue label to restore
  /// on exit.
  fn enter_function(&mut self, scope: Scope, epilogue: String) -> Option<String> {
    self.scopes.push(scope);
    tracing::trace!(depth = self.scopes.len(), "entered function scope");
    self.epilogue.replace(epilogue)
  }

  fn leave_function(&mut self, saved_epilogue: Option<String>) {
    self.scopes.pop();
    tracing::trace!(depth = self.scopes.len(), "left function scope");
    self.epilogue = saved_epilogue;
  }
}

fn lower_function(cg: &mut CodeGen, cx: &mut LowerCtx, func: &Function) -> CompileResult<()> {
  let entry = function_label(&func.name);
  let epilogue = epilogue_label(&func.name);
  let skip = skip_label(&func.name);

  let saved = cx.enter_function(Scope::with_params(&func.params), epilogue.clone());

  // Straight-line top-level code must not fall into the body.
  cg.emit(Instr::Jmp(skip.clone()));
  cg.label(entry);
  cg.emit(Instr::Push(Operand::Reg(Reg::Bp)));
  cg.emit(Instr::Mov(Operand::Reg(Reg::Bp), Operand::Reg(Reg::Sp)));

  lower_block(cg, cx, &func.body)?;

  cg.label(epilogue);
  cg.emit(Instr::Mov(Operand::Reg(Reg::Sp), Operand::Reg(Reg::Bp)));
  cg.emit(Instr::Pop(Reg::Bp));
  cg.emit(Instr::Ret(func.params.len() as u32));
  cg.label(skip);

  cx.leave_function(saved);
  Ok(())
}

/// Push arguments right to left, then call. The result is left in `Ax`.
fn lower_call(cg: &mut CodeGen, cx: &mut LowerCtx, call: &Call) -> CompileResult<()> {
  let expected = *cx.functions.get(&call.name).context(UndefinedFunctionSnafu {
    name: call.name.as_str(),
  })?;
  ensure!(
    expected == call.args.len(),
    ArityMismatchSnafu {
      name: call.name.as_str(),
      expected,
      found: call.args.len(),
    }
  );

  for arg in call.args.iter().rev() {
    match arg {
      // `push` only takes a sign-extended 32-bit immediate.
      Expr::Number { value, .. } if i32::try_from(*value).is_ok() => {
        cg.emit(Instr::Push(Operand::Imm(*value)))
      }
      other => {
        lower_expr(cg, cx, other)?;
        cg.emit(Instr::Push(Operand::Reg(Reg::Ax)));
      }
    }
  }

  cg.emit(Instr::Call(function_label(&call.name)));
  Ok(())
}

fn lower_block(cg: &mut CodeGen, cx: &mut LowerCtx, block: &Block) -> CompileResult<()> {
  for stmt in &block.stmts {
    lower_stmt(cg, cx, stmt)?;
  }
  Ok(())
}

/// Lower a branch or loop body.
fn lower_nested_block(cg: &mut CodeGen, cx: &mut LowerCtx, block: &Block) -> CompileResult<()> {
  cx.block_depth += 1;
  let result = lower_block(cg, cx, block);
  cx.block_depth -= 1;
  result
}

fn lower_stmt(cg: &mut CodeGen, cx: &mut LowerCtx, stmt: &Stmt) -> CompileResult<()> {
  match stmt {
    Stmt::Assign { name, value } => lower_assign(cg, cx, name, value),
    Stmt::If {
      cond,
      then_block,
      else_block,
    } => cg.if_statement(
      cx,
      |cg, cx| lower_expr(cg, cx, cond),
      |cg, cx| lower_nested_block(cg, cx, then_block),
      |cg, cx| lower_nested_block(cg, cx, else_block),
    ),
    Stmt::While { cond, body } => {
      cg.while_statement(
        cx,
        |cg, cx| lower_expr(cg, cx, cond),
        |cg, cx| lower_nested_block(cg, cx, body),
        |cx, labels| cx.loops.push(labels),
      )?;
      cx.loops.pop();
      Ok(())
    }
    Stmt::Break => {
      let labels = cx
        .loops
        .last()
        .context(BreakOrContinueOutsideLoopSnafu { statement: "break" })?;
      cg.emit(Instr::Jmp(labels.end.clone()));
      Ok(())
    }
    Stmt::Continue => {
      let labels = cx
        .loops
        .last()
        .context(BreakOrContinueOutsideLoopSnafu {
          statement: "continue",
        })?;
      cg.emit(Instr::Jmp(labels.start.clone()));
      Ok(())
    }
    Stmt::Return(value) => {
      lower_expr(cg, cx, value)?;
      if let Some(label) = &cx.epilogue {
        cg.emit(Instr::Jmp(label.clone()));
      }
      Ok(())
    }
    Stmt::Call(call) => lower_call(cg, cx, call),
  }
}

/// The first assignment to a name grows the frame by one pushed slot; later
/// assignments store into that slot.
fn lower_assign(cg: &mut CodeGen, cx: &mut LowerCtx, name: &str, value: &Expr) -> CompileResult<()> {
  lower_expr(cg, cx, value)?;

  let Some(scope) = cx.scopes.last_mut() else {
    return UndefinedVariableSnafu { name }.fail();
  };
  match scope.local(name) {
    Some(slot) => cg.emit(Instr::Mov(Operand::Frame(slot), Operand::Reg(Reg::Ax))),
    None => {
      if cx.block_depth > 0 {
        tracing::warn!(
          name,
          "local first assigned inside a branch or loop; its slot is pushed each time, and only when, that assignment runs"
        );
      }
      cg.emit(Instr::Push(Operand::Reg(Reg::Ax)));
      scope.declare_local(name);
    }
  }
  Ok(())
}

/// Right operand of one binary node, with the operator applied to it.
enum Step<'a> {
  Binary(BinaryOp, &'a Expr),
  Compare(CompareOp, &'a Expr),
}

fn split_left(expr: &Expr) -> Option<(&Expr, Step<'_>)> {
  match expr {
    Expr::Binary { op, lhs, rhs } => Some((&**lhs, Step::Binary(*op, &**rhs))),
    Expr::Compare { op, lhs, rhs } => Some((&**lhs, Step::Compare(*op, &**rhs))),
    _ => None,
  }
}

/// Operand callback for a left operand that is already in `Ax`.
fn already_in_ax(_: &mut CodeGen, _: &mut LowerCtx) -> CompileResult<()> {
  Ok(())
}

/// Operator chains fold to the left, so the left spine is walked with a loop
/// and only right operands recurse.
fn lower_expr(cg: &mut CodeGen, cx: &mut LowerCtx, expr: &Expr) -> CompileResult<()> {
  let mut steps = Vec::new();
  let mut leftmost = expr;
  while let Some((lhs, step)) = split_left(leftmost) {
    steps.push(step);
    leftmost = lhs;
  }

  lower_operand(cg, cx, leftmost)?;
  for step in steps.into_iter().rev() {
    lower_step(cg, cx, step)?;
  }
  Ok(())
}

fn lower_step(cg: &mut CodeGen, cx: &mut LowerCtx, step: Step<'_>) -> CompileResult<()> {
  let lhs = already_in_ax;
  match step {
    Step::Binary(op, rhs) => {
      let rhs = |cg: &mut CodeGen, cx: &mut LowerCtx| lower_expr(cg, cx, rhs);
      match op {
        BinaryOp::Add => cg.add(cx, lhs, rhs),
        BinaryOp::Sub => cg.sub(cx, lhs, rhs),
        BinaryOp::Mul => cg.mul(cx, lhs, rhs),
        BinaryOp::Div => cg.div(cx, lhs, rhs),
        BinaryOp::Mod => cg.modulo(cx, lhs, rhs),
        BinaryOp::Or => cg.logical_or(cx, lhs, rhs),
      }
    }
    Step::Compare(op, rhs) => {
      let rhs = |cg: &mut CodeGen, cx: &mut LowerCtx| lower_expr(cg, cx, rhs);
      match op {
        CompareOp::Eq => cg.eq(cx, lhs, rhs),
        CompareOp::Ne => cg.neq(cx, lhs, rhs),
        CompareOp::Gt => cg.gt(cx, lhs, rhs),
        CompareOp::Lt => cg.lt(cx, lhs, rhs),
        CompareOp::Ge => cg.ge(cx, lhs, rhs),
        CompareOp::Le => cg.le(cx, lhs, rhs),
      }
    }
  }
}

/// Lower anything that is not a binary node.
fn lower_operand(cg: &mut CodeGen, cx: &mut LowerCtx, expr: &Expr) -> CompileResult<()> {
  match expr {
    Expr::Binary { .. } | Expr::Compare { .. } => lower_expr(cg, cx, expr),
    Expr::Neg(operand) => {
      lower_expr(cg, cx, operand)?;
      cg.negate();
      Ok(())
    }
    Expr::Number { value, .. } => {
      cg.load_immediate(*value);
      Ok(())
    }
    Expr::Str(text) => {
      tracing::warn!(%text, "string literal has no runtime value; emitting nothing");
      Ok(())
    }
    Expr::Ident(name) => {
      let slot = cx
        .scope()
        .and_then(|scope| scope.lookup(name))
        .context(UndefinedVariableSnafu { name: name.as_str() })?;
      cg.emit(Instr::Mov(Operand::Reg(Reg::Ax), Operand::Frame(slot)));
      Ok(())
    }
    Expr::Call(call) => lower_call(cg, cx, call),
  }
}
