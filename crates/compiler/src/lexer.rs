//! Byte-stream tokenizer.
//!
//! Produces a flat token list with a `(line, column)` attached to each
//! token, the shape this workspace's existing combined lexer/parser has
//! always tracked spans in, generalized here to Gab's grammar: message
//! sends (`receiver message arg1, arg2`), tuples, and the two special
//! forms `=` (assignment) and `=>` (block literal).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Number,
    String,
    Identifier,
    Message, // +, -, *, /, ==, <, >, :=, a bare word used as a send, etc.
    Do,
    End,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Assign,    // =
    FatArrow,  // =>
    Pipe,      // | (parameter list delimiter inside a block literal)
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:?})", self.kind, self.text)
    }
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'?' || c == b'!'
}

const MESSAGE_CHARS: &[u8] = b"+-*/%<>=!&|^~";

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            let tok = self.next_token()?;
            let is_eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.advance();
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn make(&self, kind: TokenKind, text: String, line: u32, column: u32, offset: u32) -> Token {
        Token {
            kind,
            text,
            line,
            column,
            offset,
        }
    }

    fn next_token(&mut self) -> Result<Token, String> {
        let (line, column, offset) = (self.line, self.column, self.pos as u32);
        let Some(c) = self.peek() else {
            return Ok(self.make(TokenKind::Eof, String::new(), line, column, offset));
        };

        if c == b'\n' {
            self.advance();
            return Ok(self.make(TokenKind::Newline, "\\n".into(), line, column, offset));
        }

        if c.is_ascii_digit() {
            return Ok(self.number(line, column, offset));
        }

        if c == b'-' && matches!(self.peek_at(1), Some(d) if d.is_ascii_digit()) {
            return Ok(self.number(line, column, offset));
        }

        if c == b'"' || c == b'\'' {
            return self.string(line, column, offset);
        }

        if is_ident_start(c) {
            return Ok(self.identifier(line, column, offset));
        }

        if MESSAGE_CHARS.contains(&c) {
            return Ok(self.message_symbol(line, column, offset));
        }

        self.advance();
        let kind = match c {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b',' => TokenKind::Comma,
            b':' => TokenKind::Colon,
            b'.' => TokenKind::Dot,
            b'|' => TokenKind::Pipe,
            other => return Err(format!("unrecognized character '{}' at {line}:{column}", other as char)),
        };
        Ok(self.make(kind, (c as char).to_string(), line, column, offset))
    }

    /// Numbers: optional leading `-`, `0x` hex, a decimal mantissa, and
    /// an optional `e`/`E` exponent with its own optional sign.
    fn number(&mut self, line: u32, column: u32, offset: u32) -> Token {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.advance();
        }
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.advance();
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.advance();
            }
            let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
            return self.make(TokenKind::Number, text, line, column, offset);
        }

        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E'))
            && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit() || c == b'+' || c == b'-')
        {
            self.advance();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.advance();
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        self.make(TokenKind::Number, text, line, column, offset)
    }

    /// `"..."` is raw: no escape processing, terminated only by the next
    /// `"`, and may span multiple lines. `'...'` processes escape
    /// sequences (including `\u[hex]` codepoints) and cannot contain a
    /// literal newline.
    fn string(&mut self, line: u32, column: u32, offset: u32) -> Result<Token, String> {
        let quote = self.peek().expect("string() called at a quote byte");
        self.advance();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(format!("unterminated string starting at {line}:{column}")),
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some(b'\n') if quote == b'\'' => {
                    return Err(format!("unterminated string starting at {line}:{column}"));
                }
                Some(b'\\') if quote == b'\'' => {
                    self.advance();
                    self.single_quote_escape(&mut text, line, column)?;
                }
                Some(c) => {
                    self.advance();
                    text.push(c as char);
                }
            }
        }
        Ok(self.make(TokenKind::String, text, line, column, offset))
    }

    fn single_quote_escape(&mut self, text: &mut String, line: u32, column: u32) -> Result<(), String> {
        match self.advance() {
            Some(b'n') => text.push('\n'),
            Some(b't') => text.push('\t'),
            Some(b'r') => text.push('\r'),
            Some(b'0') => text.push('\0'),
            Some(b'e') => text.push('\u{1b}'),
            Some(b'\'') => text.push('\''),
            Some(b'"') => text.push('"'),
            Some(b'{') => text.push('{'),
            Some(b'\\') => text.push('\\'),
            Some(b'u') => {
                if self.advance() != Some(b'[') {
                    return Err(format!("expected '[' after \\u at {line}:{column}"));
                }
                let mut digits = String::new();
                loop {
                    match self.advance() {
                        Some(b']') => break,
                        Some(c) => digits.push(c as char),
                        None => return Err(format!("unterminated \\u escape at {line}:{column}")),
                    }
                }
                let cp = u32::from_str_radix(&digits, 16)
                    .map_err(|_| format!("bad unicode escape '{digits}' at {line}:{column}"))?;
                let ch = char::from_u32(cp).ok_or_else(|| format!("invalid codepoint {cp:#x} at {line}:{column}"))?;
                text.push(ch);
            }
            Some(other) => return Err(format!("unknown escape '\\{}' at {line}:{column}", other as char)),
            None => return Err(format!("unterminated escape at {line}:{column}")),
        }
        Ok(())
    }

    fn identifier(&mut self, line: u32, column: u32, offset: u32) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_continue(c)) {
            self.advance();
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        let kind = match text.as_str() {
            "do" => TokenKind::Do,
            "end" => TokenKind::End,
            _ => TokenKind::Identifier,
        };
        self.make(kind, text, line, column, offset)
    }

    fn message_symbol(&mut self, line: u32, column: u32, offset: u32) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if MESSAGE_CHARS.contains(&c)) {
            self.advance();
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        let kind = match text.as_str() {
            "=" => TokenKind::Assign,
            "=>" => TokenKind::FatArrow,
            _ => TokenKind::Message,
        };
        self.make(kind, text, line, column, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_a_simple_send() {
        let tokens = Lexer::new("1 + 2").tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[1].kind, TokenKind::Message);
        assert_eq!(tokens[1].text, "+");
        assert_eq!(tokens[2].kind, TokenKind::Number);
        assert_eq!(tokens[3].kind, TokenKind::Eof);
    }

    #[test]
    fn recognizes_fat_arrow_and_assign_distinctly() {
        assert_eq!(kinds("=>"), vec![TokenKind::FatArrow, TokenKind::Eof]);
        assert_eq!(kinds("="), vec![TokenKind::Assign, TokenKind::Eof]);
    }

    #[test]
    fn single_quoted_strings_process_escapes() {
        let tokens = Lexer::new(r#"'a\nb'"#).tokenize().unwrap();
        assert_eq!(tokens[0].text, "a\nb");
    }

    #[test]
    fn single_quoted_strings_decode_unicode_escapes() {
        let tokens = Lexer::new(r#"'\u[2502]'"#).tokenize().unwrap();
        assert_eq!(tokens[0].text, "\u{2502}");
    }

    #[test]
    fn double_quoted_strings_are_raw() {
        let tokens = Lexer::new(r#""a\nb""#).tokenize().unwrap();
        assert_eq!(tokens[0].text, r"a\nb");
    }

    #[test]
    fn double_quoted_strings_may_span_lines() {
        let tokens = Lexer::new("\"a\nb\"").tokenize().unwrap();
        assert_eq!(tokens[0].text, "a\nb");
    }

    #[test]
    fn single_quoted_strings_reject_a_literal_newline() {
        assert!(Lexer::new("'a\nb'").tokenize().is_err());
    }

    #[test]
    fn tokenizes_hex_numbers() {
        let tokens = Lexer::new("0xFF").tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].text, "0xFF");
    }

    #[test]
    fn tokenizes_exponent_numbers() {
        let tokens = Lexer::new("1.5e-10").tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].text, "1.5e-10");
    }

    #[test]
    fn tokenizes_a_minus_prefixed_number_as_one_token() {
        let tokens = Lexer::new("-5").tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].text, "-5");
    }

    #[test]
    fn a_minus_send_with_a_space_stays_a_message() {
        let tokens = Lexer::new("3 - 4").tokenize().unwrap();
        assert_eq!(kinds("3 - 4"), vec![
            TokenKind::Number,
            TokenKind::Message,
            TokenKind::Number,
            TokenKind::Eof
        ]);
        assert_eq!(tokens[1].text, "-");
    }

    #[test]
    fn recognizes_do_and_end_as_distinct_keywords() {
        assert_eq!(kinds("do end"), vec![TokenKind::Do, TokenKind::End, TokenKind::Eof]);
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = Lexer::new("1 # comment\n2").tokenize().unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![
            TokenKind::Number,
            TokenKind::Newline,
            TokenKind::Number,
            TokenKind::Eof
        ]);
    }

    #[test]
    fn malformed_token_is_an_error() {
        assert!(Lexer::new("1 @ 2").tokenize().is_err());
    }
}
