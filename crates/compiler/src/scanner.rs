//! The scanner.
//!
//! Consumes UTF-8 source and produces tokens carrying their source slice and
//! line. Whitespace and `//` / `/* */` comments are skipped; `\r\n` folds to
//! `\n`; an optional BOM is accepted silently. Identifiers accept ASCII
//! letters, underscore, and the Greek ranges U+0391–U+03A9 and
//! U+03B1–U+03C9. Blocks are indentation-based: at the start of each logical
//! line (outside brackets) the scanner compares leading whitespace against
//! its indent stack and emits `Indent`/`Dedent` tokens; every logical line
//! end yields a `Newline` token.

use std::collections::VecDeque;

use crate::token::{Token, TokenKind};

#[derive(Clone)]
pub struct Scanner<'src> {
    source: &'src str,
    bytes: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
    /// Indentation levels; always starts with 0.
    indents: Vec<usize>,
    /// Queued layout tokens (several dedents can fire at once).
    pending: VecDeque<Token<'src>>,
    at_line_start: bool,
    /// Depth of open `(`, `[`, `{`. Layout tokens are suppressed inside.
    bracket_depth: usize,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Scanner<'src> {
        // Accept (and skip) a UTF-8 BOM.
        let source = source.strip_prefix('\u{FEFF}').unwrap_or(source);
        Scanner {
            source,
            bytes: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
            indents: vec![0],
            pending: VecDeque::new(),
            at_line_start: true,
            bracket_depth: 0,
        }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        if let Some(token) = self.pending.pop_front() {
            return token;
        }

        if self.at_line_start && self.bracket_depth == 0 {
            if let Some(token) = self.handle_indentation() {
                return token;
            }
        }

        if let Some(newline) = self.skip_whitespace() {
            return newline;
        }
        self.start = self.current;

        if self.is_at_end() {
            return self.finish_at_eof();
        }

        let c = self.advance_char();

        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            '(' | '[' | '{' => {
                self.bracket_depth += 1;
                self.make_token(match c {
                    '(' => TokenKind::LeftParen,
                    '[' => TokenKind::LeftSquare,
                    _ => TokenKind::LeftBrace,
                })
            }
            ')' | ']' | '}' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.make_token(match c {
                    ')' => TokenKind::RightParen,
                    ']' => TokenKind::RightSquare,
                    _ => TokenKind::RightBrace,
                })
            }
            ',' => self.make_token(TokenKind::Comma),
            '.' => {
                if self.peek() == '.' && self.peek_next() == '.' {
                    self.advance_char();
                    self.advance_char();
                    self.make_token(TokenKind::Ellipsis)
                } else {
                    self.make_token(TokenKind::Dot)
                }
            }
            '+' => self.make_token(TokenKind::Plus),
            '*' => self.make_token(TokenKind::Asterisk),
            '/' => self.make_token(TokenKind::Slash),
            '^' => self.make_token(TokenKind::Caret),
            '%' => self.make_token(TokenKind::Percent),
            ';' => self.make_token(TokenKind::Semicolon),
            '|' => self.make_token(TokenKind::Pipe),
            '#' => self.make_token(TokenKind::Hash),
            '\\' => self.make_token(TokenKind::Backslash),
            '-' => {
                if self.match_char('>') {
                    self.make_token(TokenKind::MapsTo)
                } else {
                    self.make_token(TokenKind::Minus)
                }
            }
            ':' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::Assign)
                } else {
                    self.make_token(TokenKind::Colon)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::EqualEqual)
                } else if self.match_char('>') {
                    self.make_token(TokenKind::Implies)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            '"' => self.string(),

            // Mathematical operators
            '\u{2208}' => self.make_token(TokenKind::In),        // ∈
            '\u{2227}' => self.make_token(TokenKind::And),       // ∧
            '\u{2228}' => self.make_token(TokenKind::Or),        // ∨
            '\u{2260}' => self.make_token(TokenKind::NotEqual),  // ≠
            '\u{2264}' => self.make_token(TokenKind::LessEqual), // ≤
            '\u{2265}' => self.make_token(TokenKind::GreaterEqual), // ≥
            '\u{2192}' => self.make_token(TokenKind::MapsTo),    // →
            '\u{21D2}' => self.make_token(TokenKind::Implies),   // ⇒
            '\u{2211}' => self.make_token(TokenKind::Summation), // ∑
            '\u{2229}' => self.make_token(TokenKind::Intersect), // ∩
            '\u{222A}' => self.make_token(TokenKind::Union),     // ∪
            '\u{2282}' => self.make_token(TokenKind::Subset),    // ⊂
            '\u{2286}' => self.make_token(TokenKind::SubsetEq),  // ⊆
            '\u{2026}' => self.make_token(TokenKind::Ellipsis),  // …
            '\u{2212}' => self.make_token(TokenKind::Minus),     // − (minus sign)
            '\u{00AC}' => {
                // ¬ or ¬=
                if self.match_char('=') {
                    self.make_token(TokenKind::NotEqual)
                } else {
                    self.make_token(TokenKind::Not)
                }
            }

            _ => self.error_token("Unexpected character"),
        }
    }

    // --- Layout ---

    /// Measure the indentation of a fresh line and queue layout tokens.
    /// Blank and comment-only lines do not affect indentation.
    fn handle_indentation(&mut self) -> Option<Token<'src>> {
        loop {
            let line_start = self.current;
            let mut width = 0usize;
            while matches!(self.peek(), ' ' | '\t') {
                width += 1;
                self.advance_char();
            }

            match self.peek() {
                // Blank line: swallow it and measure the next one.
                '\n' => {
                    self.advance_char();
                    self.line += 1;
                    continue;
                }
                '\r' => {
                    self.advance_char();
                    continue;
                }
                '\0' => {
                    // EOF: leave dedent flushing to the EOF path.
                    self.at_line_start = false;
                    self.current = line_start;
                    return None;
                }
                '/' if self.peek_next() == '/' => {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance_char();
                    }
                    continue;
                }
                _ => {
                    self.at_line_start = false;
                    self.start = self.current;
                    return self.apply_indent(width);
                }
            }
        }
    }

    fn apply_indent(&mut self, width: usize) -> Option<Token<'src>> {
        let top = *self.indents.last().unwrap_or(&0);
        if width > top {
            self.indents.push(width);
            return Some(self.make_token(TokenKind::Indent));
        }

        while width < *self.indents.last().unwrap_or(&0) {
            self.indents.pop();
            self.pending.push_back(self.make_token(TokenKind::Dedent));
        }
        if width != *self.indents.last().unwrap_or(&0) {
            return Some(self.error_token("Inconsistent indentation"));
        }
        self.pending.pop_front()
    }

    fn finish_at_eof(&mut self) -> Token<'src> {
        while self.indents.len() > 1 {
            self.indents.pop();
            self.pending.push_back(self.make_token(TokenKind::Dedent));
        }
        self.pending.push_back(self.make_token(TokenKind::Eof));
        // The queue is non-empty: we just pushed Eof.
        self.pending.pop_front().unwrap_or_else(|| Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: self.line,
        })
    }

    /// Skip spaces, tabs, carriage returns, and comments. Returns a Newline
    /// token at a logical line end outside brackets.
    fn skip_whitespace(&mut self) -> Option<Token<'src>> {
        loop {
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance_char();
                }
                '\n' => {
                    self.start = self.current;
                    self.advance_char();
                    self.line += 1;
                    if self.bracket_depth == 0 {
                        self.at_line_start = true;
                        let mut token = self.make_token(TokenKind::Newline);
                        token.line -= 1;
                        return Some(token);
                    }
                }
                '/' => {
                    if self.peek_next() == '/' {
                        while self.peek() != '\n' && !self.is_at_end() {
                            self.advance_char();
                        }
                    } else if self.peek_next() == '*' {
                        self.advance_char();
                        self.advance_char();
                        while !(self.peek() == '*' && self.peek_next() == '/')
                            && !self.is_at_end()
                        {
                            if self.peek() == '\n' {
                                self.line += 1;
                            }
                            self.advance_char();
                        }
                        if !self.is_at_end() {
                            self.advance_char();
                            self.advance_char();
                        }
                    } else {
                        return None;
                    }
                }
                _ => return None,
            }
        }
    }

    // --- Literals and identifiers ---

    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.advance_char();
        }
        self.make_token(self.identifier_kind())
    }

    /// Keyword lookup over the identifier's first characters. Any prefix
    /// that fails to match yields an identifier.
    fn identifier_kind(&self) -> TokenKind {
        let text = &self.source[self.start..self.current];
        match text.as_bytes()[0] {
            b'a' => match text {
                "and" => TokenKind::And,
                "arb" => TokenKind::Arb,
                _ => TokenKind::Identifier,
            },
            b'd' => self.check_keyword(text, "do", TokenKind::Do),
            b'e' => self.check_keyword(text, "else", TokenKind::Else),
            b'f' => match text {
                "false" => TokenKind::False,
                "func" => TokenKind::Func,
                _ => TokenKind::Identifier,
            },
            b'i' => match text {
                "if" => TokenKind::If,
                "in" => TokenKind::In,
                _ => TokenKind::Identifier,
            },
            b'l' => self.check_keyword(text, "let", TokenKind::Let),
            b'n' => self.check_keyword(text, "null", TokenKind::Null),
            b'o' => match text {
                "or" => TokenKind::Or,
                "out" => TokenKind::Out,
                _ => TokenKind::Identifier,
            },
            b'r' => self.check_keyword(text, "return", TokenKind::Return),
            b't' => match text {
                "then" => TokenKind::Then,
                "true" => TokenKind::True,
                _ => TokenKind::Identifier,
            },
            b'w' => self.check_keyword(text, "while", TokenKind::While),
            b'x' => self.check_keyword(text, "xor", TokenKind::Xor),
            b'S' => self.check_keyword(text, "Sum", TokenKind::Summation),
            _ => TokenKind::Identifier,
        }
    }

    fn check_keyword(&self, text: &str, keyword: &str, kind: TokenKind) -> TokenKind {
        if text == keyword {
            kind
        } else {
            TokenKind::Identifier
        }
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance_char();
        }

        // Optional fractional part.
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance_char();
            while self.peek().is_ascii_digit() {
                self.advance_char();
            }
        }

        self.make_token(TokenKind::Number)
    }

    /// Scan a double-quoted string. Escapes are recognised here (so `\"`
    /// does not terminate) but decoded by the compiler.
    fn string(&mut self) -> Token<'src> {
        while self.peek() != '"' && !self.is_at_end() {
            match self.peek() {
                '\n' => {
                    self.line += 1;
                    self.advance_char();
                }
                '\\' => {
                    self.advance_char();
                    if !self.is_at_end() {
                        self.advance_char();
                    }
                }
                _ => {
                    self.advance_char();
                }
            }
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string");
        }

        // The closing quote.
        self.advance_char();
        self.make_token(TokenKind::String)
    }

    // --- Low-level cursor ---

    fn is_at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn advance_char(&mut self) -> char {
        let c = self.peek();
        if self.current < self.bytes.len() {
            self.current += c.len_utf8();
        }
        c
    }

    fn peek(&self) -> char {
        self.source[self.current.min(self.source.len())..]
            .chars()
            .next()
            .unwrap_or('\0')
    }

    /// The character after the current one, or `\0` at end of input.
    fn peek_next(&self) -> char {
        let mut chars = self.source[self.current.min(self.source.len())..].chars();
        chars.next();
        chars.next().unwrap_or('\0')
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() != expected {
            return false;
        }
        self.advance_char();
        true
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic()
        || c == '_'
        || ('\u{0391}'..='\u{03A9}').contains(&c)
        || ('\u{03B1}'..='\u{03C9}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let token = scanner.scan_token();
            let kind = token.kind;
            out.push(kind);
            if kind == TokenKind::Eof {
                return out;
            }
        }
    }

    #[test]
    fn test_operators_and_keywords() {
        use TokenKind::*;
        assert_eq!(
            kinds("let x := 1 + 2 * 3"),
            vec![Let, Identifier, Assign, Number, Plus, Number, Asterisk, Number, Eof]
        );
    }

    #[test]
    fn test_unicode_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("a \u{2208} b \u{222A} c \u{2229} d"),
            vec![Identifier, In, Identifier, Union, Identifier, Intersect, Identifier, Eof]
        );
        assert_eq!(
            kinds("\u{00AC}= \u{2260} <= \u{2264} >= \u{2265}"),
            vec![NotEqual, NotEqual, LessEqual, LessEqual, GreaterEqual, GreaterEqual, Eof]
        );
        assert_eq!(kinds("-> \u{2192} => \u{21D2}"), vec![
            MapsTo, MapsTo, Implies, Implies, Eof
        ]);
    }

    #[test]
    fn test_greek_identifiers() {
        use TokenKind::*;
        assert_eq!(kinds("\u{03B1} := \u{03C9}2"), vec![
            Identifier, Assign, Identifier, Eof
        ]);
    }

    #[test]
    fn test_ellipsis_forms() {
        use TokenKind::*;
        assert_eq!(kinds("1 \u{2026} 5"), vec![Number, Ellipsis, Number, Eof]);
        assert_eq!(kinds("1 ... 5"), vec![Number, Ellipsis, Number, Eof]);
        assert_eq!(kinds("a.b"), vec![Identifier, Dot, Identifier, Eof]);
    }

    #[test]
    fn test_comments_do_not_produce_tokens() {
        use TokenKind::*;
        assert_eq!(kinds("1 // comment\n2"), vec![Number, Newline, Number, Eof]);
        assert_eq!(kinds("1 /* mid */ 2"), vec![Number, Number, Eof]);
    }

    #[test]
    fn test_indentation_layout() {
        use TokenKind::*;
        let source = "if a then\n    out 1\nout 2\n";
        assert_eq!(
            kinds(source),
            vec![
                If, Identifier, Then, Newline, Indent, Out, Number, Newline, Dedent, Out,
                Number, Newline, Eof
            ]
        );
    }

    #[test]
    fn test_dedents_flush_at_eof() {
        use TokenKind::*;
        let source = "while a do\n    out 1";
        assert_eq!(
            kinds(source),
            vec![While, Identifier, Do, Newline, Indent, Out, Number, Dedent, Eof]
        );
    }

    #[test]
    fn test_newlines_suppressed_inside_brackets() {
        use TokenKind::*;
        assert_eq!(
            kinds("f(\n  1,\n  2\n)"),
            vec![Identifier, LeftParen, Number, Comma, Number, RightParen, Eof]
        );
    }

    #[test]
    fn test_string_scanning() {
        use TokenKind::*;
        assert_eq!(kinds("\"hi\\\"there\""), vec![String, Eof]);
        let mut scanner = Scanner::new("\"open");
        let token = scanner.scan_token();
        assert_eq!(token.kind, Error);
        assert_eq!(token.lexeme, "Unterminated string");
    }

    #[test]
    fn test_crlf_is_folded() {
        use TokenKind::*;
        assert_eq!(kinds("1\r\n2"), vec![Number, Newline, Number, Eof]);
    }

    #[test]
    fn test_bom_is_skipped() {
        use TokenKind::*;
        assert_eq!(kinds("\u{FEFF}let"), vec![Let, Eof]);
    }
}
