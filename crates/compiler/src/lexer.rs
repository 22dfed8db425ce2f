//! Single-pass, byte-oriented lexer.
//!
//! Emits newline tokens (the parser treats them as soft statement
//! terminators); all other whitespace is skipped. `//` starts a line
//! comment. Two-character operators are recognized with one byte of
//! lookahead. Unterminated string-family literals produce an `Illegal`
//! token whose literal describes the problem; line numbers keep counting
//! across newlines inside string bodies.

use crate::token::{lookup_keyword, Token, TokenKind};

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> u8 {
        self.src.get(self.pos).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.src.get(self.pos + 1).copied().unwrap_or(0)
    }

    fn advance(&mut self) -> u8 {
        let byte = self.peek();
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        byte
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    /// Skip spaces, tabs, carriage returns, and line comments. Newlines are
    /// significant and left for `next_token`.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' => {
                    self.advance();
                }
                b'/' if self.peek_next() == b'/' => {
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_trivia();

        let line = self.line;
        let col = self.col;

        if self.is_at_end() {
            return Token::new(TokenKind::Eof, "", line, col);
        }

        let byte = self.advance();
        match byte {
            b'\n' => Token::new(TokenKind::Newline, "\n", line, col),
            b'(' => Token::new(TokenKind::LParen, "(", line, col),
            b')' => Token::new(TokenKind::RParen, ")", line, col),
            b'[' => Token::new(TokenKind::LBracket, "[", line, col),
            b']' => Token::new(TokenKind::RBracket, "]", line, col),
            b'{' => Token::new(TokenKind::LBrace, "{", line, col),
            b'}' => Token::new(TokenKind::RBrace, "}", line, col),
            b',' => Token::new(TokenKind::Comma, ",", line, col),
            b'.' => Token::new(TokenKind::Dot, ".", line, col),
            b':' => Token::new(TokenKind::Colon, ":", line, col),
            b'+' => Token::new(TokenKind::Plus, "+", line, col),
            b'*' => Token::new(TokenKind::Star, "*", line, col),
            b'/' => Token::new(TokenKind::Slash, "/", line, col),
            b'%' => Token::new(TokenKind::Percent, "%", line, col),
            b'^' => Token::new(TokenKind::Caret, "^", line, col),
            b'~' => Token::new(TokenKind::Tilde, "~", line, col),
            b'-' => {
                if self.peek() == b'>' {
                    self.advance();
                    Token::new(TokenKind::Arrow, "->", line, col)
                } else {
                    Token::new(TokenKind::Minus, "-", line, col)
                }
            }
            b'=' => {
                if self.peek() == b'=' {
                    self.advance();
                    Token::new(TokenKind::EqEq, "==", line, col)
                } else {
                    Token::new(TokenKind::Eq, "=", line, col)
                }
            }
            b'!' => {
                if self.peek() == b'=' {
                    self.advance();
                    Token::new(TokenKind::BangEq, "!=", line, col)
                } else {
                    Token::new(TokenKind::Bang, "!", line, col)
                }
            }
            b'<' => match self.peek() {
                b'=' => {
                    self.advance();
                    Token::new(TokenKind::LtEq, "<=", line, col)
                }
                b'<' => {
                    self.advance();
                    Token::new(TokenKind::Shl, "<<", line, col)
                }
                _ => Token::new(TokenKind::Lt, "<", line, col),
            },
            b'>' => match self.peek() {
                b'=' => {
                    self.advance();
                    Token::new(TokenKind::GtEq, ">=", line, col)
                }
                b'>' => {
                    self.advance();
                    Token::new(TokenKind::Shr, ">>", line, col)
                }
                _ => Token::new(TokenKind::Gt, ">", line, col),
            },
            b'&' => {
                if self.peek() == b'&' {
                    self.advance();
                    Token::new(TokenKind::AmpAmp, "&&", line, col)
                } else {
                    Token::new(TokenKind::Amp, "&", line, col)
                }
            }
            b'|' => {
                if self.peek() == b'|' {
                    self.advance();
                    Token::new(TokenKind::PipePipe, "||", line, col)
                } else {
                    Token::new(TokenKind::Pipe, "|", line, col)
                }
            }
            b'"' | b'\'' => self.string(byte, TokenKind::Str, line, col),
            b'0'..=b'9' => self.number(byte, line, col),
            b'b' if self.peek() == b'"' || self.peek() == b'\'' => {
                let quote = self.advance();
                self.string(quote, TokenKind::Bytes, line, col)
            }
            b'f' if self.peek() == b'"' || self.peek() == b'\'' => {
                let quote = self.advance();
                self.fstring(quote, line, col)
            }
            b if b.is_ascii_alphabetic() || b == b'_' => self.identifier(b, line, col),
            other => Token::new(
                TokenKind::Illegal,
                format!("unexpected character '{}'", other as char),
                line,
                col,
            ),
        }
    }

    fn identifier(&mut self, first: u8, line: u32, col: u32) -> Token {
        let mut text = String::new();
        text.push(first as char);
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            text.push(self.advance() as char);
        }
        match lookup_keyword(&text) {
            Some(kind) => Token::new(kind, text, line, col),
            None => Token::new(TokenKind::Ident, text, line, col),
        }
    }

    fn number(&mut self, first: u8, line: u32, col: u32) -> Token {
        let mut text = String::new();
        text.push(first as char);

        // 0x / 0X prefix: hexadecimal integer.
        if first == b'0' && (self.peek() == b'x' || self.peek() == b'X') {
            text.push(self.advance() as char);
            while self.peek().is_ascii_hexdigit() {
                text.push(self.advance() as char);
            }
            if text.len() == 2 {
                return Token::new(
                    TokenKind::Illegal,
                    "hexadecimal literal requires at least one digit",
                    line,
                    col,
                );
            }
            return Token::new(TokenKind::Int, text, line, col);
        }

        while self.peek().is_ascii_digit() {
            text.push(self.advance() as char);
        }

        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            text.push(self.advance() as char);
            while self.peek().is_ascii_digit() {
                text.push(self.advance() as char);
            }
            return Token::new(TokenKind::Float, text, line, col);
        }

        Token::new(TokenKind::Int, text, line, col)
    }

    /// Scan a `"…"`/`'…'` body with escape decoding. Used for plain strings
    /// and (after the `b` prefix) bytes literals.
    fn string(&mut self, quote: u8, kind: TokenKind, line: u32, col: u32) -> Token {
        // Accumulate raw bytes so multi-byte UTF-8 sequences survive intact.
        let mut buf: Vec<u8> = Vec::new();
        loop {
            if self.is_at_end() {
                return Token::new(TokenKind::Illegal, "unterminated string literal", line, col);
            }
            let byte = self.advance();
            if byte == quote {
                return Token::new(kind, String::from_utf8_lossy(&buf).into_owned(), line, col);
            }
            if byte == b'\\' {
                if self.is_at_end() {
                    return Token::new(
                        TokenKind::Illegal,
                        "unterminated string literal",
                        line,
                        col,
                    );
                }
                let escaped = self.advance();
                match escaped {
                    b'n' => buf.push(b'\n'),
                    b'r' => buf.push(b'\r'),
                    b't' => buf.push(b'\t'),
                    b'\\' => buf.push(b'\\'),
                    b'"' => buf.push(b'"'),
                    b'\'' => buf.push(b'\''),
                    // Unknown escapes keep the backslash.
                    other => {
                        buf.push(b'\\');
                        buf.push(other);
                    }
                }
            } else {
                buf.push(byte);
            }
        }
    }

    /// Scan an f-string body, keeping the raw interior for the parser.
    /// Escapes are left intact so the parser can decode literal runs after
    /// splitting out `{…}` holes.
    fn fstring(&mut self, quote: u8, line: u32, col: u32) -> Token {
        let mut raw: Vec<u8> = Vec::new();
        loop {
            if self.is_at_end() {
                return Token::new(
                    TokenKind::Illegal,
                    "unterminated f-string literal",
                    line,
                    col,
                );
            }
            let byte = self.advance();
            if byte == quote {
                return Token::new(
                    TokenKind::FStr,
                    String::from_utf8_lossy(&raw).into_owned(),
                    line,
                    col,
                );
            }
            if byte == b'\\' && !self.is_at_end() {
                raw.push(b'\\');
                raw.push(self.advance());
            } else {
                raw.push(byte);
            }
        }
    }
}

/// Convenience: lex an entire source into a token vector ending with Eof.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token();
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return tokens;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_operators_and_lookahead() {
        use TokenKind::*;
        assert_eq!(
            kinds("== != <= >= << >> && || -> = < > - !"),
            vec![
                EqEq, BangEq, LtEq, GtEq, Shl, Shr, AmpAmp, PipePipe, Arrow, Eq, Lt, Gt, Minus,
                Bang, Eof
            ]
        );
    }

    #[test]
    fn test_keywords_vs_identifiers() {
        let tokens = tokenize("let letter func fn");
        assert_eq!(tokens[0].kind, TokenKind::Let);
        assert_eq!(tokens[1].kind, TokenKind::Ident);
        assert_eq!(tokens[1].literal, "letter");
        assert_eq!(tokens[2].kind, TokenKind::Func);
        assert_eq!(tokens[3].kind, TokenKind::Ident);
    }

    #[test]
    fn test_numbers() {
        let tokens = tokenize("42 3.14 0x1F 0");
        assert_eq!(tokens[0].kind, TokenKind::Int);
        assert_eq!(tokens[0].literal, "42");
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert_eq!(tokens[1].literal, "3.14");
        assert_eq!(tokens[2].kind, TokenKind::Int);
        assert_eq!(tokens[2].literal, "0x1F");
        assert_eq!(tokens[3].kind, TokenKind::Int);
    }

    #[test]
    fn test_member_access_is_not_float() {
        use TokenKind::*;
        assert_eq!(kinds("a.b 1.x"), vec![Ident, Dot, Ident, Int, Dot, Ident, Eof]);
    }

    #[test]
    fn test_string_escapes() {
        let tokens = tokenize(r#""a\nb" 'c\'d' "\q""#);
        assert_eq!(tokens[0].literal, "a\nb");
        assert_eq!(tokens[1].literal, "c'd");
        // Unknown escape keeps the backslash.
        assert_eq!(tokens[2].literal, "\\q");
    }

    #[test]
    fn test_bytes_and_fstring_prefixes() {
        let tokens = tokenize(r#"b"ab" f"x={x}" body"#);
        assert_eq!(tokens[0].kind, TokenKind::Bytes);
        assert_eq!(tokens[0].literal, "ab");
        assert_eq!(tokens[1].kind, TokenKind::FStr);
        assert_eq!(tokens[1].literal, "x={x}");
        assert_eq!(tokens[2].kind, TokenKind::Ident);
        assert_eq!(tokens[2].literal, "body");
    }

    #[test]
    fn test_unterminated_string_is_illegal() {
        let tokens = tokenize("\"abc");
        assert_eq!(tokens[0].kind, TokenKind::Illegal);
        assert!(tokens[0].literal.contains("unterminated"));
    }

    #[test]
    fn test_line_counting_across_strings() {
        let tokens = tokenize("\"a\nb\"\nx");
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].line, 1);
        // Newline token after the string body is on line 2.
        assert_eq!(tokens[1].kind, TokenKind::Newline);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].literal, "x");
        assert_eq!(tokens[2].line, 3);
    }

    #[test]
    fn test_comments_skipped() {
        use TokenKind::*;
        assert_eq!(kinds("1 // comment\n2"), vec![Int, Newline, Int, Eof]);
    }

    #[test]
    fn test_newline_tokens() {
        use TokenKind::*;
        assert_eq!(kinds("a\n\nb"), vec![Ident, Newline, Newline, Ident, Eof]);
    }
}
