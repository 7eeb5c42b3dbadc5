//! Shared error type for every stage of the compilation pipeline.
//!
//! Lexer and parser errors carry a source position. The `Display` output stays
//! on one line; `CompileError::render` adds the offending source line with a
//! caret under the column.

use std::fmt;
use std::num::ParseIntError;

use snafu::Snafu;

use crate::codegen::Width;

pub type CompileResult<T> = Result<T, CompileError>;

/// 1-based row and column of a character in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
  pub row: usize,
  pub col: usize,
}

impl Position {
  pub fn new(row: usize, col: usize) -> Self {
    Self { row, col }
  }
}

impl fmt::Display for Position {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.row, self.col)
  }
}

/// Coarse classification of [`CompileError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Lex,
  Syntax,
  Semantic,
  Config,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CompileError {
  #[snafu(display("{position}: unrecognized lexeme \"{lexeme}\""))]
  UnrecognizedLexeme { lexeme: String, position: Position },

  #[snafu(display("{position}: invalid identifier name \"{name}\""))]
  InvalidIdentifierName { name: String, position: Position },

  #[snafu(display("{position}: invalid number literal \"{literal}\": {source}"))]
  InvalidNumber {
    literal: String,
    position: Position,
    source: ParseIntError,
  },

  #[snafu(display("{position}: expected {expected}, but got \"{found}\""))]
  UnexpectedToken {
    expected: String,
    found: String,
    position: Position,
  },

  #[snafu(display("{position}: expressions or blocks nested deeper than {limit} levels"))]
  NestingTooDeep { limit: usize, position: Position },

  #[snafu(display("expected {expected}, but reached end of input"))]
  PrematureEndOfInput { expected: String },

  #[snafu(display("no such variable \"{name}\""))]
  UndefinedVariable { name: String },

  #[snafu(display("\"{statement}\" used outside of a loop"))]
  BreakOrContinueOutsideLoop { statement: &'static str },

  #[snafu(display("call to undefined function \"{name}\""))]
  UndefinedFunction { name: String },

  #[snafu(display("function \"{name}\" is defined more than once"))]
  DuplicateFunction { name: String },

  #[snafu(display("function \"{name}\" takes {expected} argument(s), but {found} were given"))]
  ArityMismatch {
    name: String,
    expected: usize,
    found: usize,
  },

  #[snafu(display("immediate {value} does not fit a {width} instruction"))]
  ImmediateOutOfRange { value: i64, width: Width },

  #[snafu(display("unsupported target width \"{value}\", expected 32 or 64"))]
  UnsupportedWidth { value: String },
}

impl CompileError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::UnrecognizedLexeme { .. }
      | Self::InvalidIdentifierName { .. }
      | Self::InvalidNumber { .. } => ErrorKind::Lex,
      Self::UnexpectedToken { .. }
      | Self::NestingTooDeep { .. }
      | Self::PrematureEndOfInput { .. } => ErrorKind::Syntax,
      Self::UndefinedVariable { .. }
      | Self::BreakOrContinueOutsideLoop { .. }
      | Self::UndefinedFunction { .. }
      | Self::DuplicateFunction { .. }
      | Self::ArityMismatch { .. }
      | Self::ImmediateOutOfRange { .. } => ErrorKind::Semantic,
      Self::UnsupportedWidth { .. } => ErrorKind::Config,
    }
  }

  /// Source position of the error, if the stage that raised it knew one.
  pub fn position(&self) -> Option<Position> {
    match self {
      Self::UnrecognizedLexeme { position, .. }
      | Self::InvalidIdentifierName { position, .. }
      | Self::InvalidNumber { position, .. }
      | Self::UnexpectedToken { position, .. }
      | Self::NestingTooDeep { position, .. } => Some(*position),
      _ => None,
    }
  }

  /// Format the error against the source it was raised for, pointing at the
  /// offending column with a caret when a position is known.
  pub fn render(&self, source: &str) -> String {
    let Some(position) = self.position() else {
      return self.to_string();
    };
    // Rows advance on real line breaks and on the escaped `\n` alike.
    let line = source
      .split('\n')
      .flat_map(|line| line.split("\\n"))
      .nth(position.row.saturating_sub(1))
      .unwrap_or_default()
      .trim_end_matches('\r');
    let marker = " ".repeat(position.col.saturating_sub(1));
    format!("{line}\n{marker}^ {self}")
  }
}
