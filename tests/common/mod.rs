//! Tiny executor for emitted instruction sequences, so end-to-end tests can
//! check what a program returns without an external assembler.
#![allow(dead_code)]

use std::collections::HashMap;

use snakec::codegen::{Cond, Instr, Operand, Reg};
use snakec::{Assembly, Width, compile_to_assembly};

const STACK_TOP: i64 = 0x10_0000;
const STEP_LIMIT: usize = 1_000_000;

struct Machine<'a> {
  instrs: &'a [Instr],
  labels: HashMap<&'a str, usize>,
  width: Width,
  ax: i64,
  bx: i64,
  dx: i64,
  bp: i64,
  sp: i64,
  flags: (i64, i64),
  memory: HashMap<i64, i64>,
}

impl<'a> Machine<'a> {
  fn new(asm: &'a Assembly, width: Width) -> Self {
    let instrs = asm.instrs();
    let labels = instrs
      .iter()
      .enumerate()
      .filter_map(|(i, instr)| match instr {
        Instr::Label(name) => Some((name.as_str(), i)),
        _ => None,
      })
      .collect();
    Self {
      instrs,
      labels,
      width,
      ax: 0,
      bx: 0,
      dx: 0,
      bp: STACK_TOP,
      sp: STACK_TOP,
      flags: (0, 0),
      memory: HashMap::new(),
    }
  }

  fn wrap(&self, value: i64) -> i64 {
    match self.width {
      Width::W32 => i64::from(value as i32),
      Width::W64 => value,
    }
  }

  fn reg(&self, reg: Reg) -> i64 {
    match reg {
      Reg::Ax => self.ax,
      Reg::Bx => self.bx,
      Reg::Dx => self.dx,
      Reg::Bp => self.bp,
      Reg::Sp => self.sp,
      Reg::Al => self.ax & 0xff,
    }
  }

  fn set_reg(&mut self, reg: Reg, value: i64) {
    let value = self.wrap(value);
    match reg {
      Reg::Ax => self.ax = value,
      Reg::Bx => self.bx = value,
      Reg::Dx => self.dx = value,
      Reg::Bp => self.bp = value,
      Reg::Sp => self.sp = value,
      Reg::Al => self.ax = (self.ax & !0xff) | (value & 0xff),
    }
  }

  fn slot_address(&self, slot: i32) -> i64 {
    self.bp + i64::from(slot) * self.width.word_bytes()
  }

  fn read(&self, operand: Operand) -> i64 {
    match operand {
      Operand::Reg(reg) => self.reg(reg),
      Operand::Imm(value) => value,
      Operand::Frame(slot) => {
        let address = self.slot_address(slot);
        *self
          .memory
          .get(&address)
          .unwrap_or_else(|| panic!("read of uninitialised frame slot {slot}"))
      }
    }
  }

  fn write(&mut self, operand: Operand, value: i64) {
    match operand {
      Operand::Reg(reg) => self.set_reg(reg, value),
      Operand::Frame(slot) => {
        let address = self.slot_address(slot);
        self.memory.insert(address, value);
      }
      Operand::Imm(_) => panic!("cannot write to an immediate"),
    }
  }

  fn push(&mut self, value: i64) {
    self.sp -= self.width.word_bytes();
    self.memory.insert(self.sp, value);
  }

  fn pop(&mut self) -> i64 {
    let value = *self
      .memory
      .get(&self.sp)
      .unwrap_or_else(|| panic!("pop from empty stack at {:#x}", self.sp));
    self.sp += self.width.word_bytes();
    value
  }

  fn target(&self, label: &str) -> usize {
    *self
      .labels
      .get(label)
      .unwrap_or_else(|| panic!("jump to unknown label {label}"))
  }

  fn holds(&self, cond: Cond) -> bool {
    let (a, b) = self.flags;
    match cond {
      Cond::E => a == b,
      Cond::Ne => a != b,
      Cond::G => a > b,
      Cond::L => a < b,
      Cond::Ge => a >= b,
      Cond::Le => a <= b,
    }
  }

  fn run(mut self) -> i64 {
    let instrs = self.instrs;
    let mut pc = 0;
    let mut steps = 0;
    while pc < instrs.len() {
      steps += 1;
      assert!(steps < STEP_LIMIT, "program did not terminate");

      let mut next = pc + 1;
      match &instrs[pc] {
        Instr::Label(_) => {}
        Instr::Mov(dst, src) => {
          let value = self.read(*src);
          self.write(*dst, value);
        }
        Instr::Push(op) => {
          let value = self.read(*op);
          self.push(value);
        }
        Instr::Pop(reg) => {
          let value = self.pop();
          self.set_reg(*reg, value);
        }
        Instr::Add(dst, src) => self.set_reg(*dst, self.reg(*dst).wrapping_add(self.reg(*src))),
        Instr::Sub(dst, src) => self.set_reg(*dst, self.reg(*dst).wrapping_sub(self.reg(*src))),
        Instr::Imul(dst, src) => self.set_reg(*dst, self.reg(*dst).wrapping_mul(self.reg(*src))),
        Instr::SignExtend => self.dx = if self.ax < 0 { -1 } else { 0 },
        Instr::Idiv(reg) => {
          let divisor = self.reg(*reg);
          assert_ne!(divisor, 0, "division by zero");
          let dividend = self.ax;
          self.set_reg(Reg::Ax, dividend.wrapping_div(divisor));
          self.set_reg(Reg::Dx, dividend.wrapping_rem(divisor));
        }
        Instr::Neg(reg) => self.set_reg(*reg, self.reg(*reg).wrapping_neg()),
        Instr::Cmp(lhs, rhs) => self.flags = (self.read(*lhs), self.read(*rhs)),
        Instr::Set(cond, reg) => self.set_reg(*reg, i64::from(self.holds(*cond))),
        Instr::Jmp(label) => next = self.target(label),
        Instr::Jcc(cond, label) => {
          if self.holds(*cond) {
            next = self.target(label);
          }
        }
        Instr::Call(label) => {
          self.push(next as i64);
          next = self.target(label);
        }
        Instr::Ret(slots) => {
          next = self.pop() as usize;
          self.sp += i64::from(*slots) * self.width.word_bytes();
        }
      }
      pc = next;
    }
    self.ax
  }
}

/// Execute an assembly at one width and return the primary register.
pub fn run(asm: &Assembly, width: Width) -> i64 {
  Machine::new(asm, width).run()
}

/// Compile and execute `source` at both widths, which must agree.
pub fn eval(source: &str) -> i64 {
  let asm = compile_to_assembly(source).unwrap_or_else(|err| panic!("{}", err.render(source)));
  let narrow = run(&asm, Width::W32);
  let wide = run(&asm, Width::W64);
  assert_eq!(narrow, wide, "32- and 64-bit runs disagree");
  narrow
}

/// Frame offset of a `[ebp ± n]` / `[rbp ± n]` operand, signed.
pub fn frame_offset(line: &str) -> Option<i64> {
  let start = line.find("bp ")? + 3;
  let rest = &line[start..];
  let sign = if rest.starts_with('-') { -1 } else { 1 };
  let digits: String = rest[2..].chars().take_while(char::is_ascii_digit).collect();
  digits.parse::<i64>().ok().map(|n| sign * n)
}

/// Pop count of a `ret n` line.
pub fn ret_count(line: &str) -> Option<i64> {
  line.strip_prefix("ret ")?.parse().ok()
}

/// Check the 32- to 64-bit relationship line by line.
pub fn assert_widened(asm: &Assembly) {
  let narrow = asm.lines(Width::W32);
  let wide = asm.widen();
  assert_eq!(narrow.len(), wide.len());

  for (n, w) in narrow.iter().zip(&wide) {
    if n.ends_with(':') {
      assert_eq!(n, w, "labels must not move or change");
      continue;
    }
    for reg in ["eax", "ebx", "edx", "ebp", "esp", "cdq"] {
      assert!(!w.contains(reg), "{w} still mentions {reg}");
    }
    assert_eq!(frame_offset(n).map(|o| o * 2), frame_offset(w), "{n} -> {w}");
    assert_eq!(ret_count(n).map(|c| c * 2), ret_count(w), "{n} -> {w}");
    assert_eq!(n.split(' ').next(), w.split(' ').next().map(|m| if m == "cqo" { "cdq" } else { m }));
  }
}
