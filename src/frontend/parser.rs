use crate::error::{ErrorKind, ErrorReporter};
use crate::frontend::span::Span;
use crate::frontend::token::{Literal, Token, TokenKind};
use crate::lang::ast::{BinaryOp, Expr, LiteralValue, Program, Stmt, UnaryOp};

/// Marker for an already-reported parse failure.
///
/// Every syntax error is pushed into the shared reporter at the point of
/// detection; the `Err` value only unwinds to the nearest synchronization
/// point.
struct ParseFail;

type ParseResult<T> = Result<T, ParseFail>;

const MAX_PARAMETERS: usize = 255;

/// Binding power for infix operators, lowest to highest. `Unary` is
/// never an operator's own level; it only serves as the right-operand
/// minimum above `Factor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
}

impl Precedence {
    /// The next-tighter level, used as the right operand's minimum so
    /// that binary operators associate to the left.
    fn next(self) -> Precedence {
        match self {
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor | Precedence::Unary => Precedence::Unary,
        }
    }
}

fn infix_operator(kind: TokenKind) -> Option<(BinaryOp, Precedence)> {
    let entry = match kind {
        TokenKind::OrOr => (BinaryOp::Or, Precedence::Or),
        TokenKind::AndAnd => (BinaryOp::And, Precedence::And),
        TokenKind::EqualEqual => (BinaryOp::Equal, Precedence::Equality),
        TokenKind::BangEqual => (BinaryOp::NotEqual, Precedence::Equality),
        TokenKind::Less => (BinaryOp::Less, Precedence::Comparison),
        TokenKind::LessEqual => (BinaryOp::LessEqual, Precedence::Comparison),
        TokenKind::Greater => (BinaryOp::Greater, Precedence::Comparison),
        TokenKind::GreaterEqual => (BinaryOp::GreaterEqual, Precedence::Comparison),
        TokenKind::Plus => (BinaryOp::Add, Precedence::Term),
        TokenKind::Minus => (BinaryOp::Subtract, Precedence::Term),
        TokenKind::Star => (BinaryOp::Multiply, Precedence::Factor),
        TokenKind::Slash => (BinaryOp::Divide, Precedence::Factor),
        TokenKind::Percent => (BinaryOp::Modulo, Precedence::Factor),
        _ => return None,
    };
    Some(entry)
}

/// Recursive-descent parser with Pratt-style expression precedence.
///
/// Statement recognition is driven by the leading token; expressions go
/// through a precedence ladder (assignment is handled separately because
/// it is right-associative and restricted to bare-variable targets).
///
/// On a syntax error the parser reports, then discards tokens until it
/// has just consumed a `;` or sits before a statement-starting keyword,
/// so a single pass can report several independent errors.
pub struct Parser<'r> {
    tokens: Vec<Token>,
    pos: usize,
    reporter: &'r mut ErrorReporter,
}

impl<'r> Parser<'r> {
    pub fn new(tokens: Vec<Token>, reporter: &'r mut ErrorReporter) -> Self {
        // Error tokens were already reported by the scanner.
        let tokens: Vec<Token> = tokens
            .into_iter()
            .filter(|t| t.kind != TokenKind::Error)
            .collect();
        Parser {
            tokens,
            pos: 0,
            reporter,
        }
    }

    pub fn parse(mut self) -> Program {
        let mut statements = Vec::new();

        while !self.check(TokenKind::Eof) {
            match self.declaration() {
                Ok(stmt) => statements.push(stmt),
                Err(ParseFail) => self.synchronize(),
            }
        }

        Program { statements }
    }

    // Statements

    fn declaration(&mut self) -> ParseResult<Stmt> {
        if self.check(TokenKind::Fn) {
            return self.function_declaration();
        }
        if self.check(TokenKind::Let) || self.check(TokenKind::Var) {
            return self.var_declaration();
        }
        self.statement()
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        match self.peek().kind {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::LeftBrace => {
                self.advance();
                Ok(Stmt::Block {
                    statements: self.block_body()?,
                })
            }
            _ => self.expression_statement(),
        }
    }

    fn var_declaration(&mut self) -> ParseResult<Stmt> {
        let keyword = self.advance().clone();
        let mutable = keyword.kind == TokenKind::Var;

        let name = self.consume(TokenKind::Identifier, "Expected variable name.")?;
        let name_text = name.lexeme.clone();
        let span = name.span.clone();

        let initializer = if self.match_kind(TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };

        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after variable declaration.",
        )?;

        Ok(Stmt::VarDecl {
            name: name_text,
            initializer,
            mutable,
            span,
        })
    }

    fn function_declaration(&mut self) -> ParseResult<Stmt> {
        self.advance(); // 'fn'

        let name = self.consume(TokenKind::Identifier, "Expected function name after 'fn'.")?;
        let name_text = name.lexeme.clone();
        let span = name.span.clone();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.")?;

        let mut parameters = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                if parameters.len() >= MAX_PARAMETERS {
                    let span = self.peek().span.clone();
                    self.reporter.report(
                        ErrorKind::Semantic,
                        "Can't have more than 255 parameters.",
                        span,
                    );
                }
                let param = self.consume(TokenKind::Identifier, "Expected parameter name.")?;
                parameters.push(param.lexeme.clone());
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters.")?;

        self.consume(TokenKind::LeftBrace, "Expected '{' before function body.")?;
        let body = self.block_body()?;

        Ok(Stmt::Function {
            name: name_text,
            parameters,
            body,
            span,
        })
    }

    fn block_body(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut statements = Vec::new();

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            match self.declaration() {
                Ok(stmt) => statements.push(stmt),
                Err(ParseFail) => self.synchronize(),
            }
        }

        self.consume(TokenKind::RightBrace, "Expected '}' after block.")?;
        Ok(statements)
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        self.advance(); // 'if'
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.")?;
        let condition = self.expression()?;
        self.consume(TokenKind::RightParen, "Expected ')' after condition.")?;

        let then_branch = Box::new(self.statement()?);
        let else_branch = if self.match_kind(TokenKind::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };

        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn while_statement(&mut self) -> ParseResult<Stmt> {
        self.advance(); // 'while'
        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.")?;
        let condition = self.expression()?;
        self.consume(TokenKind::RightParen, "Expected ')' after condition.")?;
        let body = Box::new(self.statement()?);

        Ok(Stmt::While { condition, body })
    }

    /// Desugars `for (init; cond; incr) body` into
    /// `{ init; while (cond) { body; incr; } }` at parse time; the
    /// compiler never sees a `for` node.
    fn for_statement(&mut self) -> ParseResult<Stmt> {
        let for_span = self.advance().span.clone();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.")?;

        let initializer = if self.match_kind(TokenKind::Semicolon) {
            None
        } else if self.check(TokenKind::Let) || self.check(TokenKind::Var) {
            Some(self.var_declaration()?)
        } else {
            Some(self.expression_statement()?)
        };

        let condition = if self.check(TokenKind::Semicolon) {
            Expr::Literal {
                value: LiteralValue::Bool(true),
                span: for_span.clone(),
            }
        } else {
            self.expression()?
        };
        self.consume(TokenKind::Semicolon, "Expected ';' after loop condition.")?;

        let increment = if self.check(TokenKind::RightParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(TokenKind::RightParen, "Expected ')' after for clauses.")?;

        let body = self.statement()?;

        let mut while_body = vec![body];
        if let Some(increment) = increment {
            while_body.push(Stmt::Expression { expr: increment });
        }

        let while_stmt = Stmt::While {
            condition,
            body: Box::new(Stmt::Block {
                statements: while_body,
            }),
        };

        let mut outer = Vec::new();
        if let Some(initializer) = initializer {
            outer.push(initializer);
        }
        outer.push(while_stmt);

        Ok(Stmt::Block { statements: outer })
    }

    fn break_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.advance().span.clone();
        self.consume(TokenKind::Semicolon, "Expected ';' after 'break'.")?;
        Ok(Stmt::Break { span })
    }

    fn continue_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.advance().span.clone();
        self.consume(TokenKind::Semicolon, "Expected ';' after 'continue'.")?;
        Ok(Stmt::Continue { span })
    }

    fn return_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.advance().span.clone();
        let value = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(TokenKind::Semicolon, "Expected ';' after return value.")?;
        Ok(Stmt::Return { value, span })
    }

    fn expression_statement(&mut self) -> ParseResult<Stmt> {
        let expr = self.expression()?;
        self.consume(TokenKind::Semicolon, "Expected ';' after expression.")?;
        Ok(Stmt::Expression { expr })
    }

    // Expressions

    fn expression(&mut self) -> ParseResult<Expr> {
        self.assignment()
    }

    /// Assignment is right-associative and the target must be a bare
    /// variable reference; anything else is a syntax error at the `=`.
    fn assignment(&mut self) -> ParseResult<Expr> {
        let expr = self.binary(Precedence::Or)?;

        if self.check(TokenKind::Equal) {
            let equals_span = self.advance().span.clone();
            let value = self.assignment()?;

            if let Expr::Variable { name, span } = expr {
                let full = Span::new(span.start, value.span().end, span.line, span.column);
                return Ok(Expr::Assign {
                    name,
                    value: Box::new(value),
                    span: full,
                });
            }

            self.reporter.report(
                ErrorKind::Syntax,
                "Invalid assignment target.",
                equals_span,
            );
            return Err(ParseFail);
        }

        Ok(expr)
    }

    fn binary(&mut self, min_prec: Precedence) -> ParseResult<Expr> {
        let mut expr = self.unary()?;

        while let Some((op, prec)) = infix_operator(self.peek().kind) {
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.binary(prec.next())?;
            let span = Span::new(
                expr.span().start,
                right.span().end,
                expr.span().line,
                expr.span().column,
            );
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(right),
                span,
            };
        }

        Ok(expr)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Negate),
            TokenKind::Bang => Some(UnaryOp::Not),
            _ => None,
        };

        if let Some(op) = op {
            let op_span = self.advance().span.clone();
            let operand = self.unary()?;
            let span = Span::new(
                op_span.start,
                operand.span().end,
                op_span.line,
                op_span.column,
            );
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                span,
            });
        }

        self.call()
    }

    fn call(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;

        while self.check(TokenKind::LeftParen) {
            self.advance();
            expr = self.finish_call(expr)?;
        }

        Ok(expr)
    }

    fn finish_call(&mut self, callee: Expr) -> ParseResult<Expr> {
        let mut arguments = Vec::new();

        if !self.check(TokenKind::RightParen) {
            loop {
                if arguments.len() >= MAX_PARAMETERS {
                    let span = self.peek().span.clone();
                    self.reporter.report(
                        ErrorKind::Semantic,
                        "Can't have more than 255 arguments.",
                        span,
                    );
                }
                arguments.push(self.expression()?);
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }

        let close = self.consume(TokenKind::RightParen, "Expected ')' after arguments.")?;
        let span = Span::new(
            callee.span().start,
            close.span.end,
            callee.span().line,
            callee.span().column,
        );

        Ok(Expr::Call {
            callee: Box::new(callee),
            arguments,
            span,
        })
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Number => {
                self.advance();
                let value = match token.literal {
                    Literal::Number(n) => n,
                    _ => 0.0,
                };
                Ok(Expr::Literal {
                    value: LiteralValue::Number(value),
                    span: token.span,
                })
            }
            TokenKind::Str => {
                self.advance();
                let value = match token.literal {
                    Literal::Str(s) => s,
                    _ => String::new(),
                };
                Ok(Expr::Literal {
                    value: LiteralValue::Str(value),
                    span: token.span,
                })
            }
            TokenKind::True | TokenKind::False => {
                self.advance();
                Ok(Expr::Literal {
                    value: LiteralValue::Bool(token.kind == TokenKind::True),
                    span: token.span,
                })
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::Literal {
                    value: LiteralValue::Nil,
                    span: token.span,
                })
            }
            TokenKind::Identifier => {
                self.advance();
                Ok(Expr::Variable {
                    name: token.lexeme,
                    span: token.span,
                })
            }
            // `print` is a reserved word, but as an expression it simply
            // names the built-in, so `print(a, b)` is an ordinary call.
            TokenKind::Print => {
                self.advance();
                Ok(Expr::Variable {
                    name: "print".to_string(),
                    span: token.span,
                })
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.consume(TokenKind::RightParen, "Expected ')' after expression.")?;
                Ok(expr)
            }
            _ => {
                self.reporter.report(
                    ErrorKind::Syntax,
                    format!("Unexpected token '{}'.", token.kind),
                    token.span,
                );
                Err(ParseFail)
            }
        }
    }

    // Token stream helpers

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1).min(self.tokens.len() - 1)]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn advance(&mut self) -> &Token {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
            &self.tokens[self.pos - 1]
        } else {
            // Stay parked on Eof.
            &self.tokens[self.tokens.len() - 1]
        }
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> ParseResult<Token> {
        if self.check(kind) {
            return Ok(self.advance().clone());
        }
        let span = self.peek().span.clone();
        self.reporter.report(ErrorKind::Syntax, message, span);
        Err(ParseFail)
    }

    /// Discards tokens until a statement boundary: just past a `;`, or
    /// sitting before a token that can begin a statement.
    fn synchronize(&mut self) {
        while !self.check(TokenKind::Eof) {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            if self.peek().starts_statement() {
                return;
            }
            self.advance();
        }
    }
}
