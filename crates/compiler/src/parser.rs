//! Recursive-descent parser with precedence climbing for binary message
//! operators, producing the [`crate::ast`] tree.
//!
//! Two call shapes are supported for message sends: binary operator
//! sends (`1 + 2`, parsed by precedence) and keyword sends (`r foo a, b`,
//! a bare identifier message followed by comma-separated arguments, the
//! shape user-defined messages typically take). `=` and `=>` are parsed
//! as their own node kinds rather than generic sends (spec §4.3).

use crate::ast::{AssignTarget, BlockLiteral, Expr, Literal, Program, SourceLocation, SplatKind};
use crate::lexer::{Lexer, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type PResult<T> = Result<T, String>;

fn binary_precedence(message: &str) -> Option<u8> {
    Some(match message {
        "*" | "/" | "%" => 7,
        "+" | "-" => 6,
        "<" | ">" | "<=" | ">=" => 5,
        "==" | "!=" => 4,
        "&&" | "&" => 3,
        "||" | "|" => 2,
        _ => return None,
    })
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    pub fn parse_source(src: &str) -> PResult<Program> {
        let tokens = Lexer::new(src).tokenize()?;
        Parser::new(tokens).parse()
    }

    pub fn parse(mut self) -> PResult<Program> {
        let mut body = Vec::new();
        self.skip_newlines();
        while !self.is_at_end() {
            body.push(self.expression(0)?);
            self.skip_terminators()?;
        }
        Ok(Program { body })
    }

    fn is_at_end(&self) -> bool {
        self.check(TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(format!(
                "expected {what} at {}:{}, found {:?}",
                self.peek().line,
                self.peek().column,
                self.peek().kind
            ))
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_terminators(&mut self) -> PResult<()> {
        if self.is_at_end() {
            return Ok(());
        }
        if !self.check(TokenKind::Newline) {
            return Err(format!(
                "expected end of statement at {}:{}, found {:?}",
                self.peek().line,
                self.peek().column,
                self.peek().kind
            ));
        }
        self.skip_newlines();
        Ok(())
    }

    fn loc(&self, tok: &Token) -> SourceLocation {
        SourceLocation {
            line: tok.line,
            column: tok.column,
            offset: tok.offset,
        }
    }

    /// Top-level expression entry: assignment binds loosest.
    fn expression(&mut self, min_bp: u8) -> PResult<Expr> {
        if let Some(assign) = self.try_multi_assignment(min_bp)? {
            return Ok(assign);
        }

        let mut lhs = self.keyword_send()?;

        if self.check(TokenKind::Assign) {
            let tok = self.advance();
            // `try_multi_assignment` above already handles every LHS
            // shape that's actually assignable (one target, many
            // targets, with or without a splat); reaching here means
            // the LHS was something else entirely (a send, a literal).
            return Err(format!(
                "the expression on the left is not assignable at {}:{}",
                tok.line, tok.column
            ));
        }

        loop {
            let Token { kind, text, .. } = self.peek().clone();
            if kind != TokenKind::Message {
                break;
            }
            let Some(prec) = binary_precedence(&text) else { break };
            if prec < min_bp {
                break;
            }
            let tok = self.advance();
            let rhs = self.expression(prec + 1)?;
            lhs = Expr::Send {
                receiver: Box::new(lhs),
                message: text,
                args: vec![rhs],
                loc: self.loc(&tok),
            };
        }

        Ok(lhs)
    }

    /// Speculatively parses the LHS of `a = 1`, `a, b = 1, 2`, or
    /// `a, *rest = 1, 2, 3` — a comma-separated run of assignment
    /// targets followed by `=`. Rolls back to the token where it
    /// started and returns `Ok(None)` the moment the lookahead doesn't
    /// actually pan out (no `=` follows, or the first token isn't even
    /// a target), so an ordinary expression starting with an identifier
    /// is never mis-parsed as a one-target assignment list.
    ///
    /// Only gathers more than one target at statement position
    /// (`min_bp == 0`); inside an argument list (`min_bp == u8::MAX`)
    /// a bare `,` belongs to the enclosing `keyword_send`'s argument
    /// separator, not to this target list, so a lone-target assignment
    /// is still recognized there but the list stops at the first comma.
    fn try_multi_assignment(&mut self, min_bp: u8) -> PResult<Option<Expr>> {
        let start = self.pos;
        let mut targets = Vec::new();
        loop {
            match self.try_parse_target() {
                Some(target) => targets.push(target),
                None => {
                    self.pos = start;
                    return Ok(None);
                }
            }
            if min_bp == 0 && self.check(TokenKind::Comma) {
                self.advance();
                self.skip_newlines();
                continue;
            }
            break;
        }

        if !self.check(TokenKind::Assign) {
            self.pos = start;
            return Ok(None);
        }
        let tok = self.advance();

        let splats = targets.iter().filter(|t| t.splat.is_some()).count();
        if splats > 1 {
            return Err(format!("at most one splat target is allowed at {}:{}", tok.line, tok.column));
        }

        self.skip_newlines();
        let mut values = vec![self.expression(u8::MAX)?];
        while self.check(TokenKind::Comma) {
            self.advance();
            self.skip_newlines();
            values.push(self.expression(u8::MAX)?);
        }
        Ok(Some(Expr::Assign {
            targets,
            values,
            loc: self.loc(&tok),
        }))
    }

    /// One assignment-target pattern: an optional `*`/`**` splat marker
    /// followed by a bare identifier. Returns `None` without consuming
    /// anything durable if the current token isn't the start of a
    /// target (the caller rolls the whole speculative parse back).
    fn try_parse_target(&mut self) -> Option<AssignTarget> {
        let splat = if self.check(TokenKind::Message) && matches!(self.peek().text.as_str(), "*" | "**") {
            let tok = self.advance();
            Some(if tok.text == "*" { SplatKind::List } else { SplatKind::Record })
        } else {
            None
        };
        if !self.check(TokenKind::Identifier) {
            return None;
        }
        let tok = self.advance();
        let loc = self.loc(&tok);
        Some(AssignTarget {
            name: tok.text,
            splat,
            loc,
        })
    }

    /// `receiver bare_ident arg, arg, ...` — a keyword-style message
    /// send. Falls through to a bare primary when no message follows.
    fn keyword_send(&mut self) -> PResult<Expr> {
        let mut receiver = self.primary()?;
        while self.check(TokenKind::Identifier) {
            let tok = self.advance();
            let mut args = Vec::new();
            if self.starts_argument() {
                args.push(self.expression(u8::MAX)?);
                while self.check(TokenKind::Comma) {
                    self.advance();
                    args.push(self.expression(u8::MAX)?);
                }
            }
            let loc = self.loc(&tok);
            receiver = Expr::Send {
                receiver: Box::new(receiver),
                message: tok.text,
                args,
                loc,
            };
        }
        Ok(receiver)
    }

    fn starts_argument(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Number
                | TokenKind::String
                | TokenKind::Identifier
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::Pipe
                | TokenKind::Colon
        )
    }

    /// `0x1F`/`-0x1F` hex literals parse as an integer; everything else
    /// (decimal, optionally `-`-prefixed, optionally `e`-exponented) is
    /// exactly what `f64::from_str` already accepts.
    fn parse_number_literal(text: &str) -> Option<f64> {
        let (negative, rest) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
            let n = i64::from_str_radix(hex, 16).ok()? as f64;
            return Some(if negative { -n } else { n });
        }
        text.parse().ok()
    }

    fn primary(&mut self) -> PResult<Expr> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Number => {
                self.advance();
                let n = Self::parse_number_literal(&tok.text)
                    .ok_or_else(|| format!("bad number literal {:?}", tok.text))?;
                Ok(Expr::Literal(Literal::Number(n), self.loc(&tok)))
            }
            TokenKind::String => {
                self.advance();
                let loc = self.loc(&tok);
                Ok(Expr::Literal(Literal::String(tok.text), loc))
            }
            TokenKind::Colon => {
                self.advance();
                let name = self.expect(TokenKind::Identifier, "a sigil name")?;
                Ok(Expr::Literal(Literal::Sigil(name.text), self.loc(&tok)))
            }
            TokenKind::Identifier => {
                self.advance();
                let loc = self.loc(&tok);
                Ok(Expr::Ident(tok.text, loc))
            }
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                let mut items = vec![self.expression(0)?];
                self.skip_newlines();
                while self.check(TokenKind::Comma) {
                    self.advance();
                    self.skip_newlines();
                    items.push(self.expression(0)?);
                    self.skip_newlines();
                }
                self.expect(TokenKind::RParen, "')'")?;
                if items.len() == 1 {
                    Ok(items.pop().unwrap())
                } else {
                    Ok(Expr::Tuple(items, self.loc(&tok)))
                }
            }
            TokenKind::LBracket => self.record_literal(),
            TokenKind::Pipe => self.block_literal(),
            other => Err(format!(
                "unexpected token {other:?} at {}:{}",
                tok.line, tok.column
            )),
        }
    }

    fn record_literal(&mut self) -> PResult<Expr> {
        let open = self.advance(); // '['
        self.skip_newlines();
        let mut fields = Vec::new();
        while !self.check(TokenKind::RBracket) {
            let key = self.expect(TokenKind::Identifier, "a field name")?;
            self.expect(TokenKind::Colon, "':'")?;
            let value = self.expression(0)?;
            fields.push((key.text, value));
            self.skip_newlines();
            if self.check(TokenKind::Comma) {
                self.advance();
                self.skip_newlines();
            } else {
                break;
            }
        }
        self.skip_newlines();
        self.expect(TokenKind::RBracket, "']'")?;
        Ok(Expr::RecordLiteral {
            fields,
            loc: self.loc(&open),
        })
    }

    fn block_literal(&mut self) -> PResult<Expr> {
        let open = self.advance(); // '|'
        let mut params = Vec::new();
        if !self.check(TokenKind::Pipe) {
            params.push(self.expect(TokenKind::Identifier, "a parameter name")?.text);
            while self.check(TokenKind::Comma) {
                self.advance();
                params.push(self.expect(TokenKind::Identifier, "a parameter name")?.text);
            }
        }
        self.expect(TokenKind::Pipe, "'|'")?;
        self.skip_newlines();
        let mut body = Vec::new();
        while !self.is_end_keyword() {
            body.push(self.expression(0)?);
            self.skip_terminators()?;
        }
        self.expect_end()?;
        Ok(Expr::Block(BlockLiteral {
            params,
            body,
            loc: self.loc(&open),
        }))
    }

    fn is_end_keyword(&self) -> bool {
        self.check(TokenKind::End)
    }

    fn expect_end(&mut self) -> PResult<()> {
        if self.is_end_keyword() {
            self.advance();
            Ok(())
        } else {
            Err(format!(
                "block needs a corresponding 'end' at {}:{}",
                self.peek().line,
                self.peek().column
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_number() {
        let program = Parser::parse_source("42").unwrap();
        assert!(matches!(program.body[0], Expr::Literal(Literal::Number(n), _) if n == 42.0));
    }

    #[test]
    fn parses_a_hex_number() {
        let program = Parser::parse_source("0xFF").unwrap();
        assert!(matches!(program.body[0], Expr::Literal(Literal::Number(n), _) if n == 255.0));
    }

    #[test]
    fn parses_an_exponent_number() {
        let program = Parser::parse_source("1e3").unwrap();
        assert!(matches!(program.body[0], Expr::Literal(Literal::Number(n), _) if n == 1000.0));
    }

    #[test]
    fn parses_a_negative_number_literal() {
        let program = Parser::parse_source("-5").unwrap();
        assert!(matches!(program.body[0], Expr::Literal(Literal::Number(n), _) if n == -5.0));
    }

    #[test]
    fn parses_a_block_closed_by_the_end_keyword_token() {
        let program = Parser::parse_source("|x|\nx\nend").unwrap();
        assert!(matches!(program.body[0], Expr::Block(_)));
    }

    #[test]
    fn parses_binary_send_with_precedence() {
        let program = Parser::parse_source("1 + 2 * 3").unwrap();
        let Expr::Send { message, args, receiver, .. } = &program.body[0] else {
            panic!("expected a send");
        };
        assert_eq!(message, "+");
        assert!(matches!(receiver.as_ref(), Expr::Literal(Literal::Number(n), _) if *n == 1.0));
        let Expr::Send { message: inner_msg, .. } = &args[0] else {
            panic!("expected nested send for higher precedence operator");
        };
        assert_eq!(inner_msg, "*");
    }

    #[test]
    fn parses_assignment() {
        let program = Parser::parse_source("x = 1").unwrap();
        assert!(matches!(program.body[0], Expr::Assign { .. }));
    }

    #[test]
    fn rejects_assignment_to_non_identifier() {
        assert!(Parser::parse_source("1 = 2").is_err());
    }

    #[test]
    fn parses_a_multi_target_assignment() {
        let program = Parser::parse_source("a, b = 1, 2").unwrap();
        let Expr::Assign { targets, .. } = &program.body[0] else {
            panic!("expected an assignment");
        };
        assert_eq!(targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(targets.iter().all(|t| t.splat.is_none()));
    }

    #[test]
    fn parses_a_splat_target() {
        let program = Parser::parse_source("a, *rest = 1, 2, 3").unwrap();
        let Expr::Assign { targets, .. } = &program.body[0] else {
            panic!("expected an assignment");
        };
        assert_eq!(targets.len(), 2);
        assert!(targets[0].splat.is_none());
        assert_eq!(targets[1].name, "rest");
        assert_eq!(targets[1].splat, Some(SplatKind::List));
    }

    #[test]
    fn parses_a_record_splat_target() {
        let program = Parser::parse_source("**rest = 1, 2").unwrap();
        let Expr::Assign { targets, .. } = &program.body[0] else {
            panic!("expected an assignment");
        };
        assert_eq!(targets[0].splat, Some(SplatKind::Record));
    }

    #[test]
    fn rejects_more_than_one_splat_target() {
        assert!(Parser::parse_source("*a, **b = 1, 2").is_err());
    }

    #[test]
    fn keyword_send_arguments_are_not_swallowed_by_speculative_multi_assignment() {
        let program = Parser::parse_source("point make x, y").unwrap();
        let Expr::Send { args, .. } = &program.body[0] else {
            panic!("expected a send");
        };
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn parses_block_literal() {
        let program = Parser::parse_source("|a, b|\n a + b\nend").unwrap();
        let Expr::Block(block) = &program.body[0] else {
            panic!("expected a block literal");
        };
        assert_eq!(block.params, vec!["a", "b"]);
        assert_eq!(block.body.len(), 1);
    }

    #[test]
    fn block_without_end_is_an_error() {
        assert!(Parser::parse_source("|a|\n a").is_err());
    }

    #[test]
    fn parses_tuple() {
        let program = Parser::parse_source("(1, 2, 3)").unwrap();
        assert!(matches!(&program.body[0], Expr::Tuple(items, _) if items.len() == 3));
    }

    #[test]
    fn parses_record_literal() {
        let program = Parser::parse_source("[x: 1, y: 2]").unwrap();
        let Expr::RecordLiteral { fields, .. } = &program.body[0] else {
            panic!("expected a record literal");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].0, "x");
    }

    #[test]
    fn parses_keyword_send() {
        let program = Parser::parse_source("point make 1, 2").unwrap();
        let Expr::Send { message, args, .. } = &program.body[0] else {
            panic!("expected a send");
        };
        assert_eq!(message, "make");
        assert_eq!(args.len(), 2);
    }
}
