//! Lexical analysis: turns the source text into a flat vector of tokens.
//!
//! Indentation is never left to the parser as raw whitespace. Right after a
//! line break the tokenizer consumes whole four-space units and emits one
//! `Indent` token per unit, so block depth is simply a count of tokens.
//! Compound punctuators are matched before single-character ones.

use snafu::ResultExt;

use crate::error::{
  CompileResult, InvalidIdentifierNameSnafu, InvalidNumberSnafu, Position,
  UnrecognizedLexemeSnafu,
};

/// Number of spaces forming one level of block nesting.
pub const INDENT_WIDTH: usize = 4;

pub const KEYWORDS: &[&str] = &[
  "def", "return", "if", "else", "while", "break", "continue",
];

/// Operator lexemes, two-character forms first.
pub const OPERATORS: &[&str] = &[
  "==", "!=", ">=", "<=", "+", "-", "*", "/", "%", ">", "<", "or",
];

/// Assignment lexemes, compound forms first.
pub const ASSIGN_OPS: &[&str] = &["*=", "+=", "="];

/// Kinds of tokens recognised by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
  LParen,
  RParen,
  Colon,
  Comma,
  Ident,
  Keyword,
  Operator,
  Assign,
  Decimal,
  Binary,
  Hex,
  Str,
  Newline,
  Indent,
  Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
  pub kind: TokenKind,
  pub text: String,
  /// Parsed value of numeric literals.
  pub value: Option<i64>,
  pub pos: Position,
}

impl Token {
  pub fn new(kind: TokenKind, text: impl Into<String>, pos: Position) -> Self {
    Self {
      kind,
      text: text.into(),
      value: None,
      pos,
    }
  }

  fn number(kind: TokenKind, text: impl Into<String>, value: i64, pos: Position) -> Self {
    Self {
      value: Some(value),
      ..Self::new(kind, text, pos)
    }
  }

  /// Whether this token has the given kind and exact source text.
  pub fn is(&self, kind: TokenKind, text: &str) -> bool {
    self.kind == kind && self.text == text
  }
}

/// Human-friendly description used in diagnostics.
pub fn describe_token(token: Option<&Token>) -> String {
  match token.map(|t| t.kind) {
    None | Some(TokenKind::Eof) => "EOF".to_string(),
    Some(TokenKind::Newline) => "newline".to_string(),
    Some(TokenKind::Indent) => "indent".to_string(),
    Some(_) => token.map(|t| t.text.clone()).unwrap_or_default(),
  }
}

/// Lex the input into a flat vector of tokens terminated by an `Eof` marker.
pub fn tokenize(input: &str) -> CompileResult<Vec<Token>> {
  let mut lexer = Lexer::new(input);
  lexer.run()?;
  tracing::debug!(tokens = lexer.tokens.len(), "tokenized source");
  Ok(lexer.tokens)
}

struct Lexer {
  chars: Vec<char>,
  pos: usize,
  row: usize,
  line_start: usize,
  tokens: Vec<Token>,
}

impl Lexer {
  fn new(input: &str) -> Self {
    Self {
      chars: input.chars().collect(),
      pos: 0,
      row: 1,
      line_start: 0,
      tokens: Vec::new(),
    }
  }

  fn peek(&self, ahead: usize) -> Option<char> {
    self.chars.get(self.pos + ahead).copied()
  }

  fn position(&self) -> Position {
    Position::new(self.row, self.pos - self.line_start + 1)
  }

  fn slice(&self, start: usize) -> String {
    self.chars[start..self.pos].iter().collect()
  }

  fn starts_with(&self, lexeme: &str) -> bool {
    lexeme
      .chars()
      .enumerate()
      .all(|(i, c)| self.peek(i) == Some(c))
  }

  fn run(&mut self) -> CompileResult<()> {
    while let Some(c) = self.peek(0) {
      match c {
        ' ' | '\r' => self.pos += 1,
        '\n' => self.newline(1),
        '\\' => self.escape()?,
        '#' => self.comment(),
        '"' => self.string()?,
        '(' => self.single(TokenKind::LParen),
        ')' => self.single(TokenKind::RParen),
        ':' => self.single(TokenKind::Colon),
        ',' => self.single(TokenKind::Comma),
        c if c.is_ascii_digit() => self.number()?,
        c if c.is_alphabetic() || c == '_' => self.word()?,
        _ => self.punctuator()?,
      }
    }

    let pos = self.position();
    self.tokens.push(Token::new(TokenKind::Eof, "", pos));
    Ok(())
  }

  fn single(&mut self, kind: TokenKind) {
    let pos = self.position();
    let text = self.chars[self.pos].to_string();
    self.tokens.push(Token::new(kind, text, pos));
    self.pos += 1;
  }

  /// Emit a newline token for a line break spelled with `width` characters,
  /// then count the indent units opening the next line.
  fn newline(&mut self, width: usize) {
    let pos = self.position();
    self.tokens.push(Token::new(TokenKind::Newline, "\n", pos));
    self.pos += width;
    self.row += 1;
    self.line_start = self.pos;

    let unit = " ".repeat(INDENT_WIDTH);
    while self.starts_with(&unit) {
      let pos = self.position();
      self.tokens.push(Token::new(TokenKind::Indent, unit.clone(), pos));
      self.pos += INDENT_WIDTH;
    }
  }

  /// Backslash escapes: `\n` is a line break and `\r` is dropped.
  fn escape(&mut self) -> CompileResult<()> {
    match self.peek(1) {
      Some('n') => self.newline(2),
      Some('r') => self.pos += 2,
      next => {
        let lexeme = format!("\\{}", next.map(String::from).unwrap_or_default());
        return UnrecognizedLexemeSnafu {
          lexeme,
          position: self.position(),
        }
        .fail();
      }
    }
    Ok(())
  }

  fn comment(&mut self) {
    while let Some(c) = self.peek(0) {
      if c == '\n' || self.starts_with("\\n") {
        break;
      }
      self.pos += 1;
    }
  }

  fn string(&mut self) -> CompileResult<()> {
    let pos = self.position();
    let start = self.pos;
    self.pos += 1;
    while let Some(c) = self.peek(0) {
      self.pos += 1;
      if c == '"' {
        let text = self.slice(start);
        self.tokens.push(Token::new(TokenKind::Str, text, pos));
        return Ok(());
      }
    }
    UnrecognizedLexemeSnafu {
      lexeme: self.slice(start),
      position: pos,
    }
    .fail()
  }

  fn number(&mut self) -> CompileResult<()> {
    let pos = self.position();
    let start = self.pos;
    let (kind, radix) = match (self.peek(0), self.peek(1)) {
      (Some('0'), Some('b')) => (TokenKind::Binary, 2),
      (Some('0'), Some('x')) => (TokenKind::Hex, 16),
      _ => (TokenKind::Decimal, 10),
    };
    if radix != 10 {
      self.pos += 2;
    }
    let digits_start = self.pos;
    while self.peek(0).is_some_and(|c| c.is_digit(radix)) {
      self.pos += 1;
    }

    // `12abc` or `0b102` is neither a number nor an identifier.
    let trailing = self.peek(0).is_some_and(|c| c.is_alphanumeric() || c == '_');
    if trailing || self.pos == digits_start {
      while self.peek(0).is_some_and(|c| c.is_alphanumeric() || c == '_') {
        self.pos += 1;
      }
      return UnrecognizedLexemeSnafu {
        lexeme: self.slice(start),
        position: pos,
      }
      .fail();
    }

    let text = self.slice(start);
    let digits = self.slice(digits_start);
    let value = i64::from_str_radix(&digits, radix).context(InvalidNumberSnafu {
      literal: text.clone(),
      position: pos,
    })?;
    self.tokens.push(Token::number(kind, text, value, pos));
    Ok(())
  }

  fn word(&mut self) -> CompileResult<()> {
    let pos = self.position();
    let start = self.pos;
    while self.peek(0).is_some_and(|c| c.is_alphanumeric() || c == '_') {
      self.pos += 1;
    }
    let text = self.slice(start);

    if !text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
      return InvalidIdentifierNameSnafu {
        name: text,
        position: pos,
      }
      .fail();
    }

    let kind = if KEYWORDS.contains(&text.as_str()) {
      TokenKind::Keyword
    } else if OPERATORS.contains(&text.as_str()) {
      TokenKind::Operator
    } else {
      TokenKind::Ident
    };
    self.tokens.push(Token::new(kind, text, pos));
    Ok(())
  }

  fn punctuator(&mut self) -> CompileResult<()> {
    let pos = self.position();
    let candidates = ASSIGN_OPS
      .iter()
      .map(|op| (TokenKind::Assign, *op))
      .chain(OPERATORS.iter().map(|op| (TokenKind::Operator, *op)))
      .filter(|(_, op)| !op.starts_with(|c: char| c.is_alphabetic()));

    // Longest match wins so `==` is never split into `=` `=`.
    let best = candidates
      .filter(|(_, op)| self.starts_with(op))
      .max_by_key(|(_, op)| op.len());

    match best {
      Some((kind, op)) => {
        self.tokens.push(Token::new(kind, op, pos));
        self.pos += op.chars().count();
        Ok(())
      }
      None => UnrecognizedLexemeSnafu {
        lexeme: self.chars[self.pos].to_string(),
        position: pos,
      }
      .fail(),
    }
  }
}
