//! Recursive-descent parser producing the program AST.
//!
//! Expressions use one helper per precedence level, each folding its operands
//! left-associatively in a loop. Blocks follow the off-side rule: a statement
//! list at depth `n` continues while the next significant token sits on a new
//! line behind exactly `n` indent tokens.

use crate::ast::{Base, BinaryOp, Block, Call, CompareOp, Expr, Function, Item, Program, Stmt};
use crate::error::{CompileError, CompileResult, NestingTooDeepSnafu, Position};
use crate::tokenizer::{Token, TokenKind, describe_token};

/// Deepest nesting of parentheses, unary minus, call arguments and blocks
/// the parser accepts. Flat operator chains of any length do not count.
pub const MAX_NESTING: usize = 256;

/// Parse a token vector (as produced by `tokenize`) into a program.
pub fn parse(tokens: &[Token]) -> CompileResult<Program> {
  let mut stream = TokenStream::new(tokens);
  let program = parse_program(&mut stream)?;
  tracing::debug!(items = program.items.len(), "parsed program");
  Ok(program)
}

fn parse_program(stream: &mut TokenStream<'_>) -> CompileResult<Program> {
  let mut items = Vec::new();

  loop {
    let line = stream.skip_layout();
    if stream.is_eof() {
      break;
    }
    if line.indent != 0 {
      return Err(stream.unexpected("a top-level definition without indentation"));
    }

    if stream.at(TokenKind::Keyword, "def") {
      items.push(Item::Function(parse_function(stream, 0)?));
    } else if stream.peek_kind() == Some(TokenKind::Ident) {
      items.push(Item::Call(parse_call(stream)?));
      stream.expect_line_end()?;
    } else {
      return Err(stream.unexpected("a function definition or call"));
    }
  }

  if items.is_empty() {
    return Err(CompileError::PrematureEndOfInput {
      expected: "a function definition or call".to_string(),
    });
  }

  Ok(Program { items })
}

fn parse_function(stream: &mut TokenStream<'_>, depth: usize) -> CompileResult<Function> {
  stream.skip(TokenKind::Keyword, "def")?;
  let name = stream.get_ident()?;
  stream.skip(TokenKind::LParen, "(")?;

  let mut params = Vec::new();
  if !stream.equal(TokenKind::RParen, ")") {
    loop {
      params.push(stream.get_ident()?);
      if stream.equal(TokenKind::Comma, ",") {
        continue;
      }
      stream.skip(TokenKind::RParen, ")")?;
      break;
    }
  }

  stream.skip(TokenKind::Colon, ":")?;
  let body = parse_block(stream, depth + 1)?;
  Ok(Function { name, params, body })
}

fn parse_block(stream: &mut TokenStream<'_>, depth: usize) -> CompileResult<Block> {
  let expected = || format!("a statement indented by {depth} level(s)");

  let line = stream.next_line();
  if !line.newline || line.indent != depth || stream.is_eof_at(line.start) {
    stream.pos = line.start;
    return Err(stream.unexpected(expected()));
  }
  stream.pos = line.start;

  let mut stmts = vec![parse_stmt(stream, depth)?];

  loop {
    stream.expect_line_end()?;
    let line = stream.next_line();
    if !line.newline || stream.is_eof_at(line.start) || line.indent < depth {
      break;
    }
    stream.pos = line.start;
    if line.indent > depth {
      return Err(stream.unexpected(expected()));
    }
    stmts.push(parse_stmt(stream, depth)?);
  }

  Ok(Block { stmts })
}

fn parse_stmt(stream: &mut TokenStream<'_>, depth: usize) -> CompileResult<Stmt> {
  if stream.equal(TokenKind::Keyword, "return") {
    return Ok(Stmt::Return(parse_or(stream)?));
  }
  if stream.equal(TokenKind::Keyword, "break") {
    return Ok(Stmt::Break);
  }
  if stream.equal(TokenKind::Keyword, "continue") {
    return Ok(Stmt::Continue);
  }
  if stream.equal(TokenKind::Keyword, "if") {
    return parse_if(stream, depth);
  }
  if stream.equal(TokenKind::Keyword, "while") {
    let cond = parse_or(stream)?;
    stream.skip(TokenKind::Colon, ":")?;
    let body = stream.nested(|s| parse_block(s, depth + 1))?;
    return Ok(Stmt::While { cond, body });
  }

  if stream.peek_kind() == Some(TokenKind::Ident) {
    if stream.peek_at(1).is_some_and(|t| t.kind == TokenKind::LParen) {
      return Ok(Stmt::Call(parse_call(stream)?));
    }
    return parse_assignment(stream);
  }

  Err(stream.unexpected("a statement"))
}

fn parse_if(stream: &mut TokenStream<'_>, depth: usize) -> CompileResult<Stmt> {
  let cond = parse_or(stream)?;
  stream.skip(TokenKind::Colon, ":")?;
  let then_block = stream.nested(|s| parse_block(s, depth + 1))?;

  // `else` must line up with its `if`; anything else ends the statement.
  let line = stream.next_line();
  let has_else = line.newline
    && line.indent == depth
    && stream
      .tokens
      .get(line.start)
      .is_some_and(|t| t.is(TokenKind::Keyword, "else"));

  let else_block = if has_else {
    stream.pos = line.start + 1;
    stream.skip(TokenKind::Colon, ":")?;
    stream.nested(|s| parse_block(s, depth + 1))?
  } else {
    Block::default()
  };

  Ok(Stmt::If {
    cond,
    then_block,
    else_block,
  })
}

/// `x = e`, or the compound forms `x += e` / `x *= e` which desugar to
/// `x = x + e` / `x = x * e`.
fn parse_assignment(stream: &mut TokenStream<'_>) -> CompileResult<Stmt> {
  let name = stream.get_ident()?;

  let op = match stream.peek() {
    Some(token) if token.is(TokenKind::Assign, "=") => None,
    Some(token) if token.is(TokenKind::Assign, "+=") => Some(BinaryOp::Add),
    Some(token) if token.is(TokenKind::Assign, "*=") => Some(BinaryOp::Mul),
    _ => return Err(stream.unexpected("an assignment operator")),
  };
  stream.pos += 1;

  let rhs = parse_or(stream)?;
  let value = match op {
    Some(op) => Expr::binary(op, Expr::ident(name.clone()), rhs),
    None => rhs,
  };
  Ok(Stmt::Assign { name, value })
}

fn parse_call(stream: &mut TokenStream<'_>) -> CompileResult<Call> {
  let name = stream.get_ident()?;
  stream.skip(TokenKind::LParen, "(")?;

  let mut args = Vec::new();
  if !stream.equal(TokenKind::RParen, ")") {
    loop {
      args.push(stream.nested(parse_or)?);
      if stream.equal(TokenKind::Comma, ",") {
        continue;
      }
      stream.skip(TokenKind::RParen, ")")?;
      break;
    }
  }

  Ok(Call { name, args })
}

fn parse_or(stream: &mut TokenStream<'_>) -> CompileResult<Expr> {
  let mut node = parse_compare(stream)?;

  while stream.equal(TokenKind::Operator, "or") {
    let rhs = parse_compare(stream)?;
    node = Expr::binary(BinaryOp::Or, node, rhs);
  }

  Ok(node)
}

fn parse_compare(stream: &mut TokenStream<'_>) -> CompileResult<Expr> {
  let mut node = parse_add(stream)?;

  loop {
    let op = match stream.peek_operator() {
      Some("==") => CompareOp::Eq,
      Some("!=") => CompareOp::Ne,
      Some(">") => CompareOp::Gt,
      Some("<") => CompareOp::Lt,
      Some(">=") => CompareOp::Ge,
      Some("<=") => CompareOp::Le,
      _ => break,
    };

    stream.pos += 1;
    let rhs = parse_add(stream)?;
    node = Expr::compare(op, node, rhs);
  }

  Ok(node)
}

fn parse_add(stream: &mut TokenStream<'_>) -> CompileResult<Expr> {
  let mut node = parse_mul(stream)?;

  loop {
    let op = match stream.peek_operator() {
      Some("+") => BinaryOp::Add,
      Some("-") => BinaryOp::Sub,
      _ => break,
    };

    stream.pos += 1;
    let rhs = parse_mul(stream)?;
    node = Expr::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_mul(stream: &mut TokenStream<'_>) -> CompileResult<Expr> {
  let mut node = parse_unary(stream)?;

  loop {
    let op = match stream.peek_operator() {
      Some("*") => BinaryOp::Mul,
      Some("/") => BinaryOp::Div,
      Some("%") => BinaryOp::Mod,
      _ => break,
    };

    stream.pos += 1;
    let rhs = parse_unary(stream)?;
    node = Expr::binary(op, node, rhs);
  }

  Ok(node)
}

fn parse_unary(stream: &mut TokenStream<'_>) -> CompileResult<Expr> {
  if stream.equal(TokenKind::Operator, "-") {
    let operand = stream.nested(parse_unary)?;
    return Ok(Expr::neg(operand));
  }

  parse_primary(stream)
}

fn parse_primary(stream: &mut TokenStream<'_>) -> CompileResult<Expr> {
  if stream.equal(TokenKind::LParen, "(") {
    let node = stream.nested(parse_or)?;
    stream.skip(TokenKind::RParen, ")")?;
    return Ok(node);
  }

  let Some(token) = stream.peek() else {
    return Err(stream.unexpected("an expression"));
  };

  let base = match token.kind {
    TokenKind::Decimal => Base::Decimal,
    TokenKind::Binary => Base::Binary,
    TokenKind::Hex => Base::Hex,
    TokenKind::Str => {
      let text = token.text.trim_matches('"').to_string();
      stream.pos += 1;
      return Ok(Expr::Str(text));
    }
    TokenKind::Ident => {
      if stream.peek_at(1).is_some_and(|t| t.kind == TokenKind::LParen) {
        return Ok(Expr::Call(parse_call(stream)?));
      }
      let name = stream.get_ident()?;
      return Ok(Expr::Ident(name));
    }
    _ => return Err(stream.unexpected("an expression")),
  };

  let Some(value) = token.value else {
    return Err(stream.unexpected("a number literal with a value"));
  };
  stream.pos += 1;
  Ok(Expr::Number { value, base })
}

/// Where the next significant token sits relative to line structure.
#[derive(Debug, Clone, Copy)]
struct Line {
  /// Whether at least one line break precedes the token.
  newline: bool,
  /// Indent tokens between the last line break and the token.
  indent: usize,
  /// Index of the token.
  start: usize,
}

/// Lightweight cursor over the token vector.
struct TokenStream<'a> {
  tokens: &'a [Token],
  pos: usize,
  nesting: usize,
}

impl<'a> TokenStream<'a> {
  fn new(tokens: &'a [Token]) -> Self {
    Self {
      tokens,
      pos: 0,
      nesting: 0,
    }
  }

  fn peek(&self) -> Option<&'a Token> {
    self.tokens.get(self.pos)
  }

  fn peek_at(&self, offset: usize) -> Option<&'a Token> {
    self.tokens.get(self.pos + offset)
  }

  fn peek_kind(&self) -> Option<TokenKind> {
    self.peek().map(|token| token.kind)
  }

  fn peek_operator(&self) -> Option<&'a str> {
    self
      .peek()
      .filter(|token| token.kind == TokenKind::Operator)
      .map(|token| token.text.as_str())
  }

  fn at(&self, kind: TokenKind, text: &str) -> bool {
    self.peek().is_some_and(|token| token.is(kind, text))
  }

  /// Consume the current token if it matches.
  fn equal(&mut self, kind: TokenKind, text: &str) -> bool {
    if self.at(kind, text) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn skip(&mut self, kind: TokenKind, text: &str) -> CompileResult<()> {
    if self.equal(kind, text) {
      Ok(())
    } else {
      Err(self.unexpected(format!("\"{text}\"")))
    }
  }

  fn get_ident(&mut self) -> CompileResult<String> {
    match self.peek() {
      Some(token) if token.kind == TokenKind::Ident => {
        self.pos += 1;
        Ok(token.text.clone())
      }
      _ => Err(self.unexpected("an identifier")),
    }
  }

  fn is_eof_at(&self, index: usize) -> bool {
    self
      .tokens
      .get(index)
      .is_none_or(|token| token.kind == TokenKind::Eof)
  }

  fn is_eof(&self) -> bool {
    self.is_eof_at(self.pos)
  }

  /// Look past newline and indent tokens without consuming them.
  fn next_line(&self) -> Line {
    let mut line = Line {
      newline: false,
      indent: 0,
      start: self.pos,
    };
    while let Some(token) = self.tokens.get(line.start) {
      match token.kind {
        TokenKind::Newline => {
          line.newline = true;
          line.indent = 0;
        }
        TokenKind::Indent => line.indent += 1,
        _ => break,
      }
      line.start += 1;
    }
    line
  }

  /// Consume newline and indent tokens up to the next significant token.
  fn skip_layout(&mut self) -> Line {
    let line = self.next_line();
    self.pos = line.start;
    line
  }

  /// A statement must be followed by a line break or the end of input.
  fn expect_line_end(&self) -> CompileResult<()> {
    match self.peek_kind() {
      None | Some(TokenKind::Newline | TokenKind::Eof) => Ok(()),
      Some(_) => Err(self.unexpected("a line break")),
    }
  }

  /// Run `parse` one nesting level deeper.
  fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> CompileResult<T>) -> CompileResult<T> {
    if self.nesting >= MAX_NESTING {
      let position = self.peek().map_or(Position::new(1, 1), |t| t.pos);
      return NestingTooDeepSnafu {
        limit: MAX_NESTING,
        position,
      }
      .fail();
    }
    self.nesting += 1;
    let result = parse(self);
    self.nesting -= 1;
    result
  }

  fn unexpected(&self, expected: impl Into<String>) -> CompileError {
    let expected = expected.into();
    match self.peek() {
      Some(token) if token.kind != TokenKind::Eof => CompileError::UnexpectedToken {
        expected,
        found: describe_token(Some(token)),
        position: token.pos,
      },
      _ => CompileError::PrematureEndOfInput { expected },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tokenizer::tokenize;

  fn parse_src(src: &str) -> CompileResult<Program> {
    parse(&tokenize(src)?)
  }

  fn body(src: &str) -> Vec<Stmt> {
    match parse_src(src).unwrap().items.remove(0) {
      Item::Function(func) => func.body.stmts,
      Item::Call(call) => panic!("expected a function, got call {call:?}"),
    }
  }

  fn returned(src: &str) -> Expr {
    match body(src).remove(0) {
      Stmt::Return(expr) => expr,
      other => panic!("expected return, got {other:?}"),
    }
  }

  #[test]
  fn function_with_params() {
    let program = parse_src("def add(a, b):\n    return a + b").unwrap();
    let Item::Function(func) = &program.items[0] else {
      panic!("expected function");
    };
    assert_eq!(func.name, "add");
    assert_eq!(func.params, vec!["a", "b"]);
    assert_eq!(
      func.body.stmts,
      vec![Stmt::Return(Expr::binary(
        BinaryOp::Add,
        Expr::ident("a"),
        Expr::ident("b")
      ))]
    );
  }

  #[test]
  fn precedence_or_below_compare_below_add_below_mul() {
    let expr = returned("def f():\n    return 1 + 2 * 3 == 7 or 0");
    let expected = Expr::binary(
      BinaryOp::Or,
      Expr::compare(
        CompareOp::Eq,
        Expr::binary(
          BinaryOp::Add,
          Expr::number(1),
          Expr::binary(BinaryOp::Mul, Expr::number(2), Expr::number(3)),
        ),
        Expr::number(7),
      ),
      Expr::number(0),
    );
    assert_eq!(expr, expected);
  }

  #[test]
  fn binary_operators_fold_left() {
    let expr = returned("def f():\n    return 10 - 4 - 3");
    let expected = Expr::binary(
      BinaryOp::Sub,
      Expr::binary(BinaryOp::Sub, Expr::number(10), Expr::number(4)),
      Expr::number(3),
    );
    assert_eq!(expr, expected);
  }

  #[test]
  fn unary_minus_and_parentheses() {
    let expr = returned("def f():\n    return -(2 - 5) % 0b11");
    let expected = Expr::binary(
      BinaryOp::Mod,
      Expr::neg(Expr::binary(BinaryOp::Sub, Expr::number(2), Expr::number(5))),
      Expr::Number {
        value: 3,
        base: Base::Binary,
      },
    );
    assert_eq!(expr, expected);
  }

  #[test]
  fn compound_assignment_desugars() {
    let stmts = body("def f():\n    x = 1\n    x += 2\n    x *= 3\n    return x");
    assert_eq!(
      stmts[1],
      Stmt::Assign {
        name: "x".to_string(),
        value: Expr::binary(BinaryOp::Add, Expr::ident("x"), Expr::number(2)),
      }
    );
    assert_eq!(
      stmts[2],
      Stmt::Assign {
        name: "x".to_string(),
        value: Expr::binary(BinaryOp::Mul, Expr::ident("x"), Expr::number(3)),
      }
    );
  }

  #[test]
  fn nested_blocks_end_on_dedent() {
    let src = "\
def f(n):
    i = 0
    while i < n:
        if i == 2:
            break
        else:
            i = i + 1
    return i
";
    let stmts = body(src);
    assert_eq!(stmts.len(), 3);
    let Stmt::While { body, .. } = &stmts[1] else {
      panic!("expected while");
    };
    assert_eq!(body.stmts.len(), 1);
    let Stmt::If {
      then_block,
      else_block,
      ..
    } = &body.stmts[0]
    else {
      panic!("expected if");
    };
    assert_eq!(then_block.stmts, vec![Stmt::Break]);
    assert_eq!(else_block.stmts.len(), 1);
  }

  #[test]
  fn if_without_else_has_empty_else_block() {
    let stmts = body("def f():\n    if 1:\n        x = 1\n    return 0");
    assert!(matches!(&stmts[0], Stmt::If { else_block, .. } if else_block.stmts.is_empty()));
    assert_eq!(stmts.len(), 2);
  }

  #[test]
  fn blank_and_comment_lines_are_skipped() {
    let src = "def f():\n    x = 1\n\n    # note\n    return x\n";
    assert_eq!(body(src).len(), 2);
  }

  #[test]
  fn calls_in_statements_expressions_and_top_level() {
    let src = "\
def g(a):
    return a

def f():
    g(1)
    return g(2) + 1

f()
";
    let program = parse_src(src).unwrap();
    assert_eq!(program.items.len(), 3);
    assert_eq!(
      program.items[2],
      Item::Call(Call {
        name: "f".to_string(),
        args: vec![],
      })
    );
    let Item::Function(f) = &program.items[1] else {
      panic!("expected function");
    };
    assert!(matches!(&f.body.stmts[0], Stmt::Call(call) if call.name == "g"));
    assert!(matches!(
      &f.body.stmts[1],
      Stmt::Return(Expr::Binary { lhs, .. }) if matches!(**lhs, Expr::Call(_))
    ));
  }

  #[test]
  fn string_literal_is_unquoted() {
    assert_eq!(returned("def f():\n    return \"hey\""), Expr::Str("hey".to_string()));
  }

  #[test]
  fn wrong_indentation_is_rejected() {
    let err = parse_src("def f():\nreturn 1").unwrap_err();
    assert!(matches!(err, CompileError::UnexpectedToken { position, .. } if position.row == 2));

    let err = parse_src("def f():\n    x = 1\n        return x").unwrap_err();
    assert!(matches!(err, CompileError::UnexpectedToken { .. }));
  }

  #[test]
  fn missing_pieces_report_expected_token() {
    let err = parse_src("def f(:\n    return 1").unwrap_err();
    assert!(matches!(
      err,
      CompileError::UnexpectedToken { ref expected, ref found, .. }
        if expected == "an identifier" && found == ":"
    ));

    let err = parse_src("def f():\n    return 1 +").unwrap_err();
    assert!(matches!(err, CompileError::PrematureEndOfInput { .. }));

    let err = parse_src("def f():\n    x = 1 y = 2").unwrap_err();
    assert!(matches!(err, CompileError::UnexpectedToken { ref expected, .. } if expected == "a line break"));
  }

  #[test]
  fn empty_program_is_premature_end() {
    assert!(matches!(
      parse_src("\n\n").unwrap_err(),
      CompileError::PrematureEndOfInput { .. }
    ));
  }

  #[test]
  fn flat_chains_have_no_depth_but_nesting_is_bounded() {
    let sum = vec!["1"; 20_000].join(" + ");
    assert!(parse_src(&format!("def f():\n    return {sum}")).is_ok());

    let parens = |depth: usize| {
      format!(
        "def f():\n    return {}1{}",
        "(".repeat(depth),
        ")".repeat(depth)
      )
    };
    assert!(parse_src(&parens(MAX_NESTING - 1)).is_ok());
    let err = parse_src(&parens(MAX_NESTING + 1)).unwrap_err();
    assert!(matches!(
      err,
      CompileError::NestingTooDeep {
        limit: MAX_NESTING,
        ..
      }
    ));
  }
}
