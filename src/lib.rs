//! Crate root: wires together the compilation pipeline.
//!
//! The stages are small and composable:
//! - `tokenizer` turns source text into tokens, indentation included.
//! - `parser` owns all syntactic knowledge and returns the program AST.
//! - `lower` walks the AST, tracking scopes and loops, and drives `codegen`.
//! - `codegen` accumulates structured instructions and renders them as Intel
//!   syntax assembly for a 32- or 64-bit target.
//! - `error` centralises the error type shared by the other modules.

pub mod ast;
pub mod codegen;
pub mod error;
pub mod lower;
pub mod parser;
pub mod tokenizer;

pub use codegen::{Assembly, Width};
pub use error::{CompileError, CompileResult, ErrorKind, Position};

/// Placeholder in a harness template that receives the quoted instructions.
pub const HARNESS_PLACEHOLDER: &str = "{{ASM}}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
  pub width: Width,
}

impl CompileOptions {
  pub fn with_width(width: Width) -> Self {
    Self { width }
  }
}

/// Rendered artifacts of one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
  pub width: Width,
  /// Assembly lines, labels included.
  pub lines: Vec<String>,
  /// The same lines quoted for embedding into a harness.
  pub quoted: Vec<String>,
}

impl Output {
  pub fn assembly_text(&self) -> String {
    self.lines.join("\n")
  }

  pub fn harness_text(&self) -> String {
    self.quoted.join(",\n")
  }

  /// Substitute the harness text for [`HARNESS_PLACEHOLDER`] in `template`.
  pub fn embed(&self, template: &str) -> String {
    template.replace(HARNESS_PLACEHOLDER, &self.harness_text())
  }
}

/// Run the front-end and lowering pass, returning the width-neutral
/// instruction sequence.
pub fn compile_to_assembly(source: &str) -> CompileResult<Assembly> {
  let tokens = tokenizer::tokenize(source)?;
  let program = parser::parse(&tokens)?;
  lower::lower(&program)
}

/// Compile a source string into assembly text for the selected width.
pub fn compile(source: &str, options: CompileOptions) -> CompileResult<Output> {
  let assembly = compile_to_assembly(source)?;
  let width = options.width;
  assembly.check_immediates(width)?;
  tracing::debug!(%width, instructions = assembly.instrs().len(), "rendering assembly");
  Ok(Output {
    width,
    lines: assembly.lines(width),
    quoted: assembly.quoted_lines(width),
  })
}
