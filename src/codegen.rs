//! Code generation backend: an append-only instruction buffer plus the
//! composable emitters the lowering pass drives.
//!
//! The emitter is a simple stack machine: every expression leaves its value in
//! the primary register and binary operators spill operands through the
//! stack. Locals and parameters live in the frame and are addressed relative
//! to the frame pointer.
//!
//! Instructions are kept structured rather than as text. Register names,
//! frame offsets, and return pop counts are only turned into text by
//! [`Assembly::lines`], so the 64-bit output is the very same instruction
//! list rendered with wider registers and doubled slot sizes.

use std::fmt;
use std::str::FromStr;

use snafu::ensure;

use crate::error::{CompileError, CompileResult, ImmediateOutOfRangeSnafu, UnsupportedWidthSnafu};

/// Register and stack-slot model of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Width {
  #[default]
  W32,
  W64,
}

impl Width {
  pub fn bits(self) -> u32 {
    match self {
      Self::W32 => 32,
      Self::W64 => 64,
    }
  }

  /// Size in bytes of one stack slot.
  pub fn word_bytes(self) -> i64 {
    match self {
      Self::W32 => 4,
      Self::W64 => 8,
    }
  }
}

impl TryFrom<u32> for Width {
  type Error = CompileError;

  fn try_from(bits: u32) -> CompileResult<Self> {
    match bits {
      32 => Ok(Self::W32),
      64 => Ok(Self::W64),
      other => UnsupportedWidthSnafu {
        value: other.to_string(),
      }
      .fail(),
    }
  }
}

impl FromStr for Width {
  type Err = CompileError;

  fn from_str(s: &str) -> CompileResult<Self> {
    match s.trim().parse::<u32>() {
      Ok(bits) => Self::try_from(bits),
      Err(_) => UnsupportedWidthSnafu { value: s }.fail(),
    }
  }
}

impl fmt::Display for Width {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-bit", self.bits())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
  /// Primary register: expression results and return values.
  Ax,
  Bx,
  Dx,
  Bp,
  Sp,
  /// Low byte of `Ax`, target of flag-based sets.
  Al,
}

impl Reg {
  pub fn name(self, width: Width) -> &'static str {
    match (self, width) {
      (Self::Ax, Width::W32) => "eax",
      (Self::Ax, Width::W64) => "rax",
      (Self::Bx, Width::W32) => "ebx",
      (Self::Bx, Width::W64) => "rbx",
      (Self::Dx, Width::W32) => "edx",
      (Self::Dx, Width::W64) => "rdx",
      (Self::Bp, Width::W32) => "ebp",
      (Self::Bp, Width::W64) => "rbp",
      (Self::Sp, Width::W32) => "esp",
      (Self::Sp, Width::W64) => "rsp",
      (Self::Al, _) => "al",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
  Reg(Reg),
  Imm(i64),
  /// Stack slot relative to the frame base, in words. Negative slots are
  /// locals, positive slots are parameters.
  Frame(i32),
}

impl Operand {
  pub fn render(self, width: Width) -> String {
    match self {
      Self::Reg(reg) => reg.name(width).to_string(),
      Self::Imm(value) => value.to_string(),
      Self::Frame(slot) => {
        let base = Reg::Bp.name(width);
        let bytes = i64::from(slot) * width.word_bytes();
        if bytes < 0 {
          format!("[{base} - {}]", -bytes)
        } else {
          format!("[{base} + {bytes}]")
        }
      }
    }
  }
}

/// Condition codes used by `set` and conditional jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
  E,
  Ne,
  G,
  L,
  Ge,
  Le,
}

impl Cond {
  fn suffix(self) -> &'static str {
    match self {
      Self::E => "e",
      Self::Ne => "ne",
      Self::G => "g",
      Self::L => "l",
      Self::Ge => "ge",
      Self::Le => "le",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
  Label(String),
  Mov(Operand, Operand),
  Push(Operand),
  Pop(Reg),
  Add(Reg, Reg),
  Sub(Reg, Reg),
  Imul(Reg, Reg),
  /// Sign-extend the primary register into `Dx` ahead of a division.
  SignExtend,
  Idiv(Reg),
  Neg(Reg),
  Cmp(Operand, Operand),
  Set(Cond, Reg),
  Jmp(String),
  Jcc(Cond, String),
  Call(String),
  /// Return, popping this many argument slots.
  Ret(u32),
}

impl Instr {
  pub fn render(&self, width: Width) -> String {
    let r = |reg: &Reg| reg.name(width);
    match self {
      Self::Label(name) => format!("{name}:"),
      Self::Mov(dst, src) => format!("mov {}, {}", dst.render(width), src.render(width)),
      Self::Push(op) => format!("push {}", op.render(width)),
      Self::Pop(reg) => format!("pop {}", r(reg)),
      Self::Add(dst, src) => format!("add {}, {}", r(dst), r(src)),
      Self::Sub(dst, src) => format!("sub {}, {}", r(dst), r(src)),
      Self::Imul(dst, src) => format!("imul {}, {}", r(dst), r(src)),
      Self::SignExtend => match width {
        Width::W32 => "cdq".to_string(),
        Width::W64 => "cqo".to_string(),
      },
      Self::Idiv(reg) => format!("idiv {}", r(reg)),
      Self::Neg(reg) => format!("neg {}", r(reg)),
      Self::Cmp(lhs, rhs) => format!("cmp {}, {}", lhs.render(width), rhs.render(width)),
      Self::Set(cond, reg) => format!("set{} {}", cond.suffix(), r(reg)),
      Self::Jmp(label) => format!("jmp {label}"),
      Self::Jcc(cond, label) => format!("j{} {label}", cond.suffix()),
      Self::Call(label) => format!("call {label}"),
      Self::Ret(0) => "ret".to_string(),
      Self::Ret(slots) => format!("ret {}", i64::from(*slots) * width.word_bytes()),
    }
  }
}

/// Start and end labels of one active loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopLabels {
  pub start: String,
  pub end: String,
}

/// Finished instruction sequence of one compilation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assembly {
  instrs: Vec<Instr>,
}

impl Assembly {
  pub fn instrs(&self) -> &[Instr] {
    &self.instrs
  }

  /// Render one text line per instruction at the requested width.
  pub fn lines(&self, width: Width) -> Vec<String> {
    self.instrs.iter().map(|instr| instr.render(width)).collect()
  }

  /// The width conversion: the same code with 64-bit registers, doubled frame
  /// offsets, and doubled return pop counts.
  pub fn widen(&self) -> Vec<String> {
    self.lines(Width::W64)
  }

  pub fn text(&self, width: Width) -> String {
    self.lines(width).join("\n")
  }

  /// Lines quoted and terminated for embedding into a harness source file.
  pub fn quoted_lines(&self, width: Width) -> Vec<String> {
    self
      .lines(width)
      .iter()
      .map(|line| quote_line(line))
      .collect()
  }

  /// Fail on any immediate the target cannot encode. Only a 64-bit `mov`
  /// takes a full 64-bit immediate; everything else is limited to 32 bits.
  pub fn check_immediates(&self, width: Width) -> CompileResult<()> {
    for instr in &self.instrs {
      let (value, wide_mov) = match instr {
        Instr::Mov(_, Operand::Imm(value)) => (*value, true),
        Instr::Push(Operand::Imm(value)) | Instr::Cmp(_, Operand::Imm(value)) => (*value, false),
        _ => continue,
      };
      let encodable = i32::try_from(value).is_ok() || (wide_mov && width == Width::W64);
      ensure!(encodable, ImmediateOutOfRangeSnafu { value, width });
    }
    Ok(())
  }

  pub fn labels(&self) -> impl Iterator<Item = &str> {
    self.instrs.iter().filter_map(|instr| match instr {
      Instr::Label(name) => Some(name.as_str()),
      _ => None,
    })
  }
}

/// Quote one assembly line as a string literal holding a `;`-terminated
/// statement.
pub fn quote_line(line: &str) -> String {
  let escaped = line.replace('\\', "\\\\").replace('"', "\\\"");
  format!("\"{escaped};\"")
}

/// Append-only instruction accumulator with a per-compilation label counter.
///
/// The operand emitters take callbacks that receive the generator back along
/// with a caller-owned context `C`, so the caller decides how (and in which
/// order) operand code is produced while keeping its own traversal state.
#[derive(Debug, Default)]
pub struct CodeGen {
  instrs: Vec<Instr>,
  next_label_id: usize,
}

impl CodeGen {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn emit(&mut self, instr: Instr) {
    self.instrs.push(instr);
  }

  pub fn label(&mut self, name: impl Into<String>) {
    self.emit(Instr::Label(name.into()));
  }

  pub fn finish(self) -> Assembly {
    tracing::debug!(instructions = self.instrs.len(), "finished code generation");
    Assembly {
      instrs: self.instrs,
    }
  }

  /// Fresh id for one control construct; all of its labels derive from it.
  pub fn allocate_label_id(&mut self) -> usize {
    let id = self.next_label_id;
    self.next_label_id += 1;
    tracing::trace!(id, "allocated label id");
    id
  }

  pub fn load_immediate(&mut self, value: i64) {
    self.emit(Instr::Mov(Operand::Reg(Reg::Ax), Operand::Imm(value)));
  }

  pub fn negate(&mut self) {
    self.emit(Instr::Neg(Reg::Ax));
  }

  /// Evaluate both operands through the stack, leaving the left operand in
  /// `Ax` and the right one in `Bx`.
  fn operands<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    lhs(self, cx)?;
    self.emit(Instr::Push(Operand::Reg(Reg::Ax)));
    rhs(self, cx)?;
    self.emit(Instr::Push(Operand::Reg(Reg::Ax)));
    self.emit(Instr::Pop(Reg::Bx));
    self.emit(Instr::Pop(Reg::Ax));
    Ok(())
  }

  pub fn add<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.operands(cx, lhs, rhs)?;
    self.emit(Instr::Add(Reg::Ax, Reg::Bx));
    Ok(())
  }

  pub fn sub<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.operands(cx, lhs, rhs)?;
    self.emit(Instr::Sub(Reg::Ax, Reg::Bx));
    Ok(())
  }

  pub fn mul<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.operands(cx, lhs, rhs)?;
    self.emit(Instr::Imul(Reg::Ax, Reg::Bx));
    Ok(())
  }

  /// Signed division; the quotient ends up in `Ax` and the remainder in `Dx`.
  pub fn div<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.operands(cx, lhs, rhs)?;
    self.emit(Instr::SignExtend);
    self.emit(Instr::Idiv(Reg::Bx));
    Ok(())
  }

  pub fn modulo<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.div(cx, lhs, rhs)?;
    self.emit(Instr::Mov(Operand::Reg(Reg::Ax), Operand::Reg(Reg::Dx)));
    Ok(())
  }

  /// Compare the operands and leave 1 or 0 in `Ax`. The register is cleared
  /// with `mov` (which keeps the flags) before the byte-wide set.
  pub fn compare<C, L, R>(&mut self, cx: &mut C, cond: Cond, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.operands(cx, lhs, rhs)?;
    self.emit(Instr::Cmp(Operand::Reg(Reg::Ax), Operand::Reg(Reg::Bx)));
    self.emit(Instr::Mov(Operand::Reg(Reg::Ax), Operand::Imm(0)));
    self.emit(Instr::Set(cond, Reg::Al));
    Ok(())
  }

  pub fn eq<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.compare(cx, Cond::E, lhs, rhs)
  }

  pub fn neq<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.compare(cx, Cond::Ne, lhs, rhs)
  }

  pub fn gt<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.compare(cx, Cond::G, lhs, rhs)
  }

  pub fn lt<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.compare(cx, Cond::L, lhs, rhs)
  }

  pub fn ge<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.compare(cx, Cond::Ge, lhs, rhs)
  }

  pub fn le<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    self.compare(cx, Cond::Le, lhs, rhs)
  }

  /// Logical or yielding 1 or 0. Code for both operands is always emitted;
  /// the right one is only skipped at run time when the left one is truthy.
  pub fn logical_or<C, L, R>(&mut self, cx: &mut C, lhs: L, rhs: R) -> CompileResult<()>
  where
    L: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    R: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    let id = self.allocate_label_id();
    let right = format!("_or_right_{id}");
    let truthy = format!("_or_true_{id}");
    let falsy = format!("_or_false_{id}");
    let end = format!("_or_end_{id}");

    lhs(self, cx)?;
    self.emit(Instr::Cmp(Operand::Reg(Reg::Ax), Operand::Imm(0)));
    self.emit(Instr::Jcc(Cond::E, right.clone()));
    self.emit(Instr::Jmp(truthy.clone()));

    self.label(right);
    rhs(self, cx)?;
    self.emit(Instr::Cmp(Operand::Reg(Reg::Ax), Operand::Imm(0)));
    self.emit(Instr::Jcc(Cond::E, falsy.clone()));
    self.emit(Instr::Jmp(truthy.clone()));

    self.label(truthy);
    self.load_immediate(1);
    self.emit(Instr::Jmp(end.clone()));
    self.label(falsy);
    self.load_immediate(0);
    self.label(end);
    Ok(())
  }

  pub fn if_statement<C, P, T, E>(
    &mut self,
    cx: &mut C,
    cond: P,
    then_branch: T,
    else_branch: E,
  ) -> CompileResult<()>
  where
    P: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    T: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    E: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
  {
    let id = self.allocate_label_id();
    let else_label = format!("_if_else_{id}");
    let end = format!("_if_end_{id}");

    cond(self, cx)?;
    self.emit(Instr::Cmp(Operand::Reg(Reg::Ax), Operand::Imm(0)));
    self.emit(Instr::Jcc(Cond::E, else_label.clone()));
    then_branch(self, cx)?;
    self.emit(Instr::Jmp(end.clone()));
    self.label(else_label);
    else_branch(self, cx)?;
    self.label(end);
    Ok(())
  }

  /// Emit a loop skeleton. `register` receives the loop's labels before the
  /// body is emitted so `break`/`continue` inside the body can target them.
  pub fn while_statement<C, P, B, G>(
    &mut self,
    cx: &mut C,
    cond: P,
    body: B,
    register: G,
  ) -> CompileResult<()>
  where
    P: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    B: FnOnce(&mut Self, &mut C) -> CompileResult<()>,
    G: FnOnce(&mut C, LoopLabels),
  {
    let id = self.allocate_label_id();
    let labels = LoopLabels {
      start: format!("_while_start_{id}"),
      end: format!("_while_end_{id}"),
    };

    self.label(labels.start.clone());
    cond(self, cx)?;
    self.emit(Instr::Cmp(Operand::Reg(Reg::Ax), Operand::Imm(0)));
    self.emit(Instr::Jcc(Cond::E, labels.end.clone()));

    let LoopLabels { start, end } = labels.clone();
    register(cx, labels);
    body(self, cx)?;
    self.emit(Instr::Jmp(start));
    self.label(end);
    Ok(())
  }
}
