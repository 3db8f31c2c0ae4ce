use crate::error::{ErrorKind, ErrorReporter};
use crate::frontend::span::Span;
use crate::frontend::token::{Token, TokenKind};

/// Streaming scanner: source bytes in, tokens out.
///
/// The scanner is total. Bad input produces an `Error` token and a
/// diagnostic in the shared reporter, then scanning resumes at the next
/// byte, so one pass reports every lexical error in the source. The token
/// stream always ends with a single `Eof` token.
pub struct Lexer<'src, 'r> {
    source: &'src [u8],
    text: &'src str,
    start: usize,
    current: usize,
    line: usize,
    line_start: usize,
    reporter: &'r mut ErrorReporter,
}

fn keyword(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "let" => TokenKind::Let,
        "var" => TokenKind::Var,
        "fn" => TokenKind::Fn,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "for" => TokenKind::For,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "return" => TokenKind::Return,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "nil" => TokenKind::Nil,
        "print" => TokenKind::Print,
        _ => return None,
    };
    Some(kind)
}

impl<'src, 'r> Lexer<'src, 'r> {
    pub fn new(source: &'src str, reporter: &'r mut ErrorReporter) -> Self {
        Lexer {
            source: source.as_bytes(),
            text: source,
            start: 0,
            current: 0,
            line: 1,
            line_start: 0,
            reporter,
        }
    }

    /// Scans the entire source and returns the token stream.
    pub fn scan_all(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.scan_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn scan_token(&mut self) -> Token {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b';' => self.make_token(TokenKind::Semicolon),
            b'+' => self.make_token(TokenKind::Plus),
            b'-' => self.make_token(TokenKind::Minus),
            b'*' => self.make_token(TokenKind::Star),
            b'/' => self.make_token(TokenKind::Slash),
            b'%' => self.make_token(TokenKind::Percent),
            b'!' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }
            b'=' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            b'<' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            b'>' => {
                if self.match_byte(b'=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }
            b'&' => {
                if self.match_byte(b'&') {
                    self.make_token(TokenKind::AndAnd)
                } else {
                    self.error_token("Unexpected character '&'.")
                }
            }
            b'|' => {
                if self.match_byte(b'|') {
                    self.make_token(TokenKind::OrOr)
                } else {
                    self.error_token("Unexpected character '|'.")
                }
            }
            b'"' => self.string(),
            b'0'..=b'9' => self.number(),
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => self.identifier(),
            _ => self.error_token(format!("Unexpected character '{}'.", c as char)),
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.current += 1;
                }
                Some(b'\n') => {
                    self.current += 1;
                    self.new_line();
                }
                Some(b'/') => match self.peek_next() {
                    Some(b'/') => {
                        while let Some(c) = self.peek() {
                            if c == b'\n' {
                                break;
                            }
                            self.current += 1;
                        }
                    }
                    Some(b'*') => {
                        if !self.block_comment() {
                            return;
                        }
                    }
                    _ => return,
                },
                _ => return,
            }
        }
    }

    /// Consumes a `/* ... */` comment (single nesting level only).
    ///
    /// Returns false if the comment never terminates; the error has
    /// already been reported in that case.
    fn block_comment(&mut self) -> bool {
        let open_span = self.span_at(self.current, self.current + 2);
        self.current += 2;

        while let Some(c) = self.peek() {
            if c == b'*' && self.peek_next() == Some(b'/') {
                self.current += 2;
                return true;
            }
            if c == b'\n' {
                self.current += 1;
                self.new_line();
            } else {
                self.current += 1;
            }
        }

        self.reporter
            .report(ErrorKind::Lexical, "Unterminated block comment.", open_span);
        false
    }

    fn string(&mut self) -> Token {
        let mut value = String::new();

        loop {
            match self.peek() {
                Some(b'"') => {
                    self.current += 1;
                    return Token::string(self.lexeme(), self.token_span(), value);
                }
                Some(b'\\') => {
                    self.current += 1;
                    match self.peek() {
                        Some(b'n') => value.push('\n'),
                        Some(b't') => value.push('\t'),
                        Some(b'r') => value.push('\r'),
                        Some(b'\\') => value.push('\\'),
                        Some(b'"') => value.push('"'),
                        // Unknown escapes pass the character through.
                        Some(c) => value.push(c as char),
                        None => break,
                    }
                    if self.peek() == Some(b'\n') {
                        self.new_line_after_advance();
                    } else {
                        self.current += 1;
                    }
                }
                Some(b'\n') => {
                    value.push('\n');
                    self.new_line_after_advance();
                }
                Some(c) => {
                    value.push(c as char);
                    self.current += 1;
                }
                None => break,
            }
        }

        self.error_token("Unterminated string.")
    }

    fn number(&mut self) -> Token {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.current += 1;
        }

        if self.peek() == Some(b'.') && matches!(self.peek_next(), Some(b'0'..=b'9')) {
            self.current += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.current += 1;
            }
        }

        let lexeme = self.lexeme();
        // The lexeme is digits with an optional fraction; it always parses.
        let value: f64 = lexeme.parse().unwrap_or(0.0);
        Token::number(lexeme, self.token_span(), value)
    }

    fn identifier(&mut self) -> Token {
        while matches!(self.peek(), Some(b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_')) {
            self.current += 1;
        }

        let lexeme = self.lexeme();
        match keyword(&lexeme) {
            Some(kind) => self.make_token(kind),
            None => self.make_token(TokenKind::Identifier),
        }
    }

    // Cursor helpers

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.source[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.current).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.get(self.current + 1).copied()
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn new_line(&mut self) {
        self.line += 1;
        self.line_start = self.current;
    }

    fn new_line_after_advance(&mut self) {
        self.current += 1;
        self.new_line();
    }

    // Token construction

    fn lexeme(&self) -> String {
        self.text[self.start..self.current].to_string()
    }

    fn token_span(&self) -> Span {
        self.span_at(self.start, self.current)
    }

    fn span_at(&self, start: usize, end: usize) -> Span {
        let column = start.saturating_sub(self.line_start) + 1;
        Span::new(start, end, self.line, column)
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.lexeme(), self.token_span())
    }

    fn error_token(&mut self, message: impl Into<String>) -> Token {
        let span = self.token_span();
        self.reporter
            .report(ErrorKind::Lexical, message, span.clone());
        Token::new(TokenKind::Error, self.lexeme(), span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> (Vec<Token>, ErrorReporter) {
        let mut reporter = ErrorReporter::new();
        reporter.set_source(source);
        let tokens = Lexer::new(source, &mut reporter).scan_all();
        (tokens, reporter)
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_source_yields_eof() {
        let (tokens, reporter) = scan("");
        assert_eq!(kinds(&tokens), vec![TokenKind::Eof]);
        assert!(!reporter.has_errors());
    }

    #[test]
    fn test_operators_and_punctuation() {
        let (tokens, reporter) = scan("( ) { } , . ; + - * / % ! = == != < <= > >= && ||");
        assert!(!reporter.has_errors());
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Semicolon,
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::Bang,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let (tokens, _) = scan("let letter fn fnord print");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Let,
                TokenKind::Identifier,
                TokenKind::Fn,
                TokenKind::Identifier,
                TokenKind::Print,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_literals() {
        let (tokens, _) = scan("0 42 3.25 1.");
        assert_eq!(tokens[0].literal, crate::frontend::token::Literal::Number(0.0));
        assert_eq!(tokens[1].literal, crate::frontend::token::Literal::Number(42.0));
        assert_eq!(tokens[2].literal, crate::frontend::token::Literal::Number(3.25));
        // "1." scans as the number 1 followed by a dot.
        assert_eq!(tokens[3].kind, TokenKind::Number);
        assert_eq!(tokens[4].kind, TokenKind::Dot);
    }

    #[test]
    fn test_string_escapes() {
        let (tokens, reporter) = scan(r#""a\nb\t\"c\\" "\q""#);
        assert!(!reporter.has_errors());
        assert_eq!(
            tokens[0].literal,
            crate::frontend::token::Literal::Str("a\nb\t\"c\\".to_string())
        );
        // Unknown escape passes the character through.
        assert_eq!(
            tokens[1].literal,
            crate::frontend::token::Literal::Str("q".to_string())
        );
    }

    #[test]
    fn test_unterminated_string_reports_error() {
        let (tokens, reporter) = scan("\"abc");
        assert!(reporter.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
        assert!(reporter.errors()[0].message.contains("Unterminated string"));
    }

    #[test]
    fn test_line_comment_is_skipped() {
        let (tokens, _) = scan("1 // rest of line\n2");
        assert_eq!(
            kinds(&tokens),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
        assert_eq!(tokens[1].span.line, 2);
    }

    #[test]
    fn test_block_comment_spans_lines() {
        let (tokens, reporter) = scan("1 /* two\nlines */ 2");
        assert!(!reporter.has_errors());
        assert_eq!(tokens[1].span.line, 2);
    }

    #[test]
    fn test_unterminated_block_comment_reports_error() {
        let (_, reporter) = scan("1 /* never closed");
        assert!(reporter.has_errors());
        assert!(reporter.errors()[0]
            .message
            .contains("Unterminated block comment"));
    }

    #[test]
    fn test_unexpected_character() {
        let (tokens, reporter) = scan("let @ = 1;");
        assert!(reporter.has_errors());
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Error));
        assert!(reporter.errors()[0].message.contains("'@'"));
    }

    #[test]
    fn test_lone_ampersand_is_error() {
        let (_, reporter) = scan("a & b");
        assert!(reporter.has_errors());
        assert!(reporter.errors()[0].message.contains("'&'"));
    }

    #[test]
    fn test_line_count_matches_newlines() {
        let source = "1\n\"a\nb\"\n/* c\nd */\n2\n";
        let (tokens, reporter) = scan(source);
        assert!(!reporter.has_errors());
        let newlines = source.bytes().filter(|&b| b == b'\n').count();
        // Eof sits after the final newline.
        assert_eq!(tokens.last().unwrap().span.line, newlines + 1);
    }

    #[test]
    fn test_columns_are_one_based() {
        let (tokens, _) = scan("ab cd\n  ef");
        assert_eq!(tokens[0].span.column, 1);
        assert_eq!(tokens[1].span.column, 4);
        assert_eq!(tokens[2].span.column, 3);
        assert_eq!(tokens[2].span.line, 2);
    }
}
