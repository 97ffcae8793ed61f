use std::ops::Range;

use crate::code::ErrorCode;
use crate::expression::template_string::{TemplateString, TemplateStringPart};
use crate::expression::{
    AssignmentOperator, BinaryOperator, Expression, Statement, UnaryOperator,
};
use crate::parser::error::ParseError;

// ---------------------------------------------------------------------------
// Token types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    // Literals
    Number(f64),
    StringLit(String),
    True,
    False,
    Null,

    Ident(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,         // =
    EqEq,       // == and ===
    BangEq,     // != and !==
    Gt,
    Lt,
    GtEq,
    LtEq,
    AmpAmp,     // &&
    PipePipe,   // ||
    QuestionQuestion, // ??
    Bang,       // !
    Question,   // ?
    Colon,      // :
    Comma,
    Dot,

    // Compound assignment
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,

    // Grouping
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

type Spanned = (Token, Range<usize>);

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse a standalone expression. `offset` is the byte position of `text` in the template.
pub fn parse_expression(text: &str, offset: usize, file_id: usize) -> Result<Expression, ParseError> {
    let tokens = tokenize(text, offset, file_id)?;
    let mut parser = ExprParser::new(tokens, offset..offset + text.len(), file_id);
    let expr = parser.parse_expr(0)?;
    parser.expect_end()?;
    Ok(expr)
}

/// Parse the contents of a `{{ }}` tag: an assignment or an expression.
pub fn parse_statement(text: &str, offset: usize, file_id: usize) -> Result<Statement, ParseError> {
    let tokens = tokenize(text, offset, file_id)?;
    let span = offset..offset + text.len();

    if let Some(pos) = tokens.iter().position(|(t, _)| assignment_operator(t).is_some()) {
        let target = match (&tokens[0].0, pos) {
            (Token::Ident(name), 1) => name.clone(),
            _ => {
                return Err(ParseError::new(
                    ErrorCode::InvalidAssignmentTarget,
                    "only plain variables can be assigned",
                    tokens[pos].1.clone(),
                    file_id,
                ));
            }
        };
        let operator = assignment_operator(&tokens[1].0).unwrap_or(AssignmentOperator::Assign);
        let mut parser = ExprParser::new(tokens[2..].to_vec(), span, file_id);
        let value = parser.parse_expr(0)?;
        parser.expect_end()?;
        return Ok(Statement::Assignment {
            target,
            operator,
            value,
        });
    }

    let mut parser = ExprParser::new(tokens, span, file_id);
    let expr = parser.parse_expr(0)?;
    parser.expect_end()?;
    Ok(Statement::Expression(expr))
}

/// Parse a loop header (the text after `for`): `item in expr` or `item, index in expr`.
pub fn parse_for_header(
    text: &str,
    offset: usize,
    file_id: usize,
) -> Result<(String, Option<String>, Expression), ParseError> {
    let tokens = tokenize(text, offset, file_id)?;
    let span = offset..offset + text.len();
    let mut parser = ExprParser::new(tokens, span, file_id);

    let binding = parser.expect_ident("loop variable")?;
    let index = if parser.peek() == Some(&Token::Comma) {
        parser.advance();
        Some(parser.expect_ident("loop index variable")?)
    } else {
        None
    };
    match parser.advance() {
        Some((Token::Ident(kw), _)) if kw == "in" => {}
        Some((_, span)) => {
            return Err(ParseError::new(
                ErrorCode::UnexpectedToken,
                "expected 'in' in for loop",
                span,
                file_id,
            ));
        }
        None => return Err(parser.eof_error("expected 'in' in for loop")),
    }
    let iterable = parser.parse_expr(0)?;
    parser.expect_end()?;
    Ok((binding, index, iterable))
}

/// Parse quoted attribute text for `{{ expr }}` interpolations.
pub fn parse_template_string(
    text: &str,
    offset: usize,
    file_id: usize,
) -> Result<TemplateString, ParseError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < text.len() {
        let rest = &text[i..];
        if rest.starts_with("\\{{") {
            literal.push_str("{{");
            i += 3;
        } else if rest.starts_with("{{") {
            if !literal.is_empty() {
                parts.push(TemplateStringPart::Literal(std::mem::take(&mut literal)));
            }
            let end = scan_mustache_end(text, i + 2).ok_or_else(|| {
                ParseError::new(
                    ErrorCode::UnclosedMustache,
                    "unclosed '{{' in attribute value",
                    offset + i..offset + text.len(),
                    file_id,
                )
            })?;
            let inner = &text[i + 2..end];
            let expr = parse_expression(inner, offset + i + 2, file_id)?;
            parts.push(TemplateStringPart::Expression(expr));
            i = end + 2;
        } else {
            let Some(c) = rest.chars().next() else { break };
            literal.push(c);
            i += c.len_utf8();
        }
    }

    if !literal.is_empty() || parts.is_empty() {
        parts.push(TemplateStringPart::Literal(literal));
    }
    Ok(TemplateString { parts })
}

/// Find the byte index of the `}}` closing a mustache whose body starts at `start`.
/// String literals and nested object braces are skipped.
pub(crate) fn scan_mustache_end(source: &str, start: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut i = start;
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'{' => depth += 1,
            b'}' if depth > 0 => depth -= 1,
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Text tokenizer: raw text string → Token stream
// ---------------------------------------------------------------------------

fn tokenize(text: &str, base_offset: usize, file_id: usize) -> Result<Vec<Spanned>, ParseError> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    // Map character indices to byte offsets within the text
    let byte_pos: Vec<usize> = {
        let mut bp = Vec::with_capacity(len + 1);
        let mut offset = 0;
        for c in &chars {
            bp.push(offset);
            offset += c.len_utf8();
        }
        bp.push(offset);
        bp
    };
    let span = |start: usize, end: usize| base_offset + byte_pos[start]..base_offset + byte_pos[end];

    while i < len {
        let c = chars[i];
        let start = i;
        let next = chars.get(i + 1).copied();

        let token = match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }

            // String literal
            '"' | '\'' => {
                i += 1;
                let mut s = String::new();
                let mut closed = false;
                while i < len {
                    match chars[i] {
                        '\\' if i + 1 < len => {
                            s.push(match chars[i + 1] {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                            i += 2;
                        }
                        ch if ch == c => {
                            i += 1;
                            closed = true;
                            break;
                        }
                        ch => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err(ParseError::new(
                        ErrorCode::UnexpectedEof,
                        "unterminated string literal",
                        span(start, i),
                        file_id,
                    ));
                }
                Token::StringLit(s)
            }

            // Numbers
            '0'..='9' => {
                while i < len && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < len && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    i += 1;
                    while i < len && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let num_str: String = chars[start..i].iter().collect();
                let n = num_str.parse::<f64>().map_err(|_| {
                    ParseError::new(
                        ErrorCode::UnexpectedToken,
                        format!("invalid number '{}'", num_str),
                        span(start, i),
                        file_id,
                    )
                })?;
                Token::Number(n)
            }

            // Identifiers and keywords
            'a'..='z' | 'A'..='Z' | '_' | '$' => {
                while i < len && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "undefined" => Token::Null,
                    _ => Token::Ident(ident),
                }
            }

            '=' if next == Some('=') => {
                i += 2;
                if chars.get(i) == Some(&'=') {
                    i += 1;
                }
                Token::EqEq
            }
            '!' if next == Some('=') => {
                i += 2;
                if chars.get(i) == Some(&'=') {
                    i += 1;
                }
                Token::BangEq
            }
            '>' if next == Some('=') => { i += 2; Token::GtEq }
            '<' if next == Some('=') => { i += 2; Token::LtEq }
            '&' if next == Some('&') => { i += 2; Token::AmpAmp }
            '|' if next == Some('|') => { i += 2; Token::PipePipe }
            '?' if next == Some('?') => { i += 2; Token::QuestionQuestion }
            '+' if next == Some('=') => { i += 2; Token::PlusEq }
            '-' if next == Some('=') => { i += 2; Token::MinusEq }
            '*' if next == Some('=') => { i += 2; Token::StarEq }
            '/' if next == Some('=') => { i += 2; Token::SlashEq }
            '%' if next == Some('=') => { i += 2; Token::PercentEq }

            // Single-character operators
            '=' => { i += 1; Token::Eq }
            '!' => { i += 1; Token::Bang }
            '>' => { i += 1; Token::Gt }
            '<' => { i += 1; Token::Lt }
            '+' => { i += 1; Token::Plus }
            '-' => { i += 1; Token::Minus }
            '*' => { i += 1; Token::Star }
            '/' => { i += 1; Token::Slash }
            '%' => { i += 1; Token::Percent }
            '?' => { i += 1; Token::Question }
            ':' => { i += 1; Token::Colon }
            ',' => { i += 1; Token::Comma }
            '.' => { i += 1; Token::Dot }
            '(' => { i += 1; Token::LParen }
            ')' => { i += 1; Token::RParen }
            '[' => { i += 1; Token::LBracket }
            ']' => { i += 1; Token::RBracket }
            '{' => { i += 1; Token::LBrace }
            '}' => { i += 1; Token::RBrace }

            other => {
                return Err(ParseError::new(
                    ErrorCode::UnexpectedToken,
                    format!("unexpected character '{}'", other),
                    span(start, start + 1),
                    file_id,
                ));
            }
        };
        tokens.push((token, span(start, i)));
    }

    Ok(tokens)
}

fn assignment_operator(token: &Token) -> Option<AssignmentOperator> {
    match token {
        Token::Eq => Some(AssignmentOperator::Assign),
        Token::PlusEq => Some(AssignmentOperator::AddAssign),
        Token::MinusEq => Some(AssignmentOperator::SubtractAssign),
        Token::StarEq => Some(AssignmentOperator::MultiplyAssign),
        Token::SlashEq => Some(AssignmentOperator::DivideAssign),
        Token::PercentEq => Some(AssignmentOperator::ModuloAssign),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Pratt parser
// ---------------------------------------------------------------------------

struct ExprParser {
    tokens: Vec<Spanned>,
    pos: usize,
    span: Range<usize>,
    file_id: usize,
    /// Nesting of the expression being built: groups, operands, postfix chains.
    depth: usize,
    /// Binary operators applied so far.
    operators: usize,
}

/// Deepest nesting an expression may have.
pub const MAX_NESTING: usize = 128;

/// Most binary operators one expression may contain.
pub const MAX_OPERATORS: usize = 4096;

// Binding powers (precedence). Higher = tighter binding.
// Left bp, right bp. For left-assoc: right = left + 1. For right-assoc: right = left.
const BP_CONDITIONAL: u8 = 2;   // ? :
const BP_OR: u8 = 4;            // || ??
const BP_AND: u8 = 6;           // &&
const BP_EQUALITY: u8 = 8;      // == !=
const BP_COMPARISON: u8 = 10;   // < > <= >=
const BP_ADDITIVE: u8 = 12;     // + -
const BP_MULTIPLICATIVE: u8 = 14; // * / %
const BP_UNARY: u8 = 16;        // ! - +
const BP_POSTFIX: u8 = 18;      // . [] ()

impl ExprParser {
    fn new(tokens: Vec<Spanned>, span: Range<usize>, file_id: usize) -> Self {
        ExprParser {
            tokens,
            pos: 0,
            span,
            file_id,
            depth: 0,
            operators: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eof_error(&self, msg: impl Into<String>) -> ParseError {
        let end = self.span.end;
        ParseError::new(ErrorCode::UnexpectedEof, msg, end..end, self.file_id)
    }

    fn token_error(&self, msg: impl Into<String>, span: Range<usize>) -> ParseError {
        ParseError::new(ErrorCode::UnexpectedToken, msg, span, self.file_id)
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        match self.tokens.get(self.pos) {
            None => Ok(()),
            Some((t, span)) => Err(self.token_error(
                format!("unexpected {:?} after expression", t),
                span.clone(),
            )),
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<Range<usize>, ParseError> {
        match self.advance() {
            Some((t, span)) if t == expected => Ok(span),
            Some((t, span)) => Err(self.token_error(format!("expected {}, found {:?}", what, t), span)),
            None => Err(self.eof_error(format!("expected {}", what))),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.advance() {
            Some((Token::Ident(name), _)) => Ok(name),
            Some((t, span)) => Err(self.token_error(format!("expected {}, found {:?}", what, t), span)),
            None => Err(self.eof_error(format!("expected {}", what))),
        }
    }

    // ------------------------------------------------------------------
    // Pratt parser core
    // ------------------------------------------------------------------

    /// Span of the next token, or the end of the expression.
    fn current_span(&self) -> Range<usize> {
        match self.tokens.get(self.pos) {
            Some((_, span)) => span.clone(),
            None => self.span.end..self.span.end,
        }
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.token_error(
                format!("expression nested too deeply (limit {})", MAX_NESTING),
                self.current_span(),
            ));
        }
        Ok(())
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expression, ParseError> {
        let depth = self.depth;
        self.descend()?;
        let result = self.parse_operators(min_bp);
        self.depth = depth;
        result
    }

    fn parse_operators(&mut self, min_bp: u8) -> Result<Expression, ParseError> {
        let mut left = self.parse_prefix()?;

        loop {
            let Some(token) = self.peek().cloned() else { break };

            // Postfix: member access, indexing, calls
            if matches!(token, Token::Dot | Token::LBracket | Token::LParen) {
                if BP_POSTFIX < min_bp {
                    break;
                }
                self.descend()?;
                left = self.parse_postfix(left)?;
                continue;
            }

            let Some((l_bp, r_bp)) = infix_bp(&token) else { break };
            if l_bp < min_bp {
                break;
            }

            // Special case: conditional operator (?)
            if token == Token::Question {
                self.advance();
                let consequent = self.parse_expr(0)?;
                self.expect(Token::Colon, "':' in conditional expression")?;
                let alternate = self.parse_expr(BP_CONDITIONAL)?;
                left = Expression::Conditional {
                    condition: Box::new(left),
                    consequent: Box::new(consequent),
                    alternate: Box::new(alternate),
                };
                continue;
            }

            let Some((op, op_span)) = self.advance() else { break };
            self.operators += 1;
            if self.operators > MAX_OPERATORS {
                return Err(self.token_error(
                    format!("expression has more than {} operators", MAX_OPERATORS),
                    op_span,
                ));
            }
            let right = self.parse_expr(r_bp)?;

            let operator = match op {
                Token::Plus => BinaryOperator::Addition,
                Token::Minus => BinaryOperator::Subtraction,
                Token::Star => BinaryOperator::Multiplication,
                Token::Slash => BinaryOperator::Division,
                Token::Percent => BinaryOperator::Modulo,
                Token::EqEq => BinaryOperator::Equality,
                Token::BangEq => BinaryOperator::Inequality,
                Token::Gt => BinaryOperator::GreaterThan,
                Token::Lt => BinaryOperator::LessThan,
                Token::GtEq => BinaryOperator::GreaterThanOrEqual,
                Token::LtEq => BinaryOperator::LessThanOrEqual,
                Token::AmpAmp => BinaryOperator::LogicalAnd,
                Token::PipePipe => BinaryOperator::LogicalOr,
                Token::QuestionQuestion => BinaryOperator::NullishCoalescing,
                _ => return Err(self.token_error("unexpected infix operator", op_span)),
            };

            left = Expression::BinaryOperation {
                operator,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_postfix(&mut self, object: Expression) -> Result<Expression, ParseError> {
        let Some((token, start)) = self.advance() else {
            return Err(self.eof_error("unexpected end of expression"));
        };
        match token {
            Token::Dot => match self.advance() {
                Some((Token::Ident(property), span)) => Ok(Expression::Member {
                    object: Box::new(object),
                    property,
                    span: start.start..span.end,
                }),
                Some((t, span)) => Err(self.token_error(format!("expected property name, found {:?}", t), span)),
                None => Err(self.eof_error("expected property name")),
            },
            Token::LBracket => {
                let index = self.parse_expr(0)?;
                let end = self.expect(Token::RBracket, "']'")?;
                Ok(Expression::Index {
                    object: Box::new(object),
                    index: Box::new(index),
                    span: start.start..end.end,
                })
            }
            Token::LParen => {
                let (arguments, end) = self.parse_list(Token::RParen, "')'")?;
                Ok(Expression::Call {
                    callee: Box::new(object),
                    arguments,
                    span: start.start..end.end,
                })
            }
            other => Err(self.token_error(format!("unexpected {:?}", other), start)),
        }
    }

    /// Comma-separated expressions up to `close`; trailing comma allowed.
    fn parse_list(&mut self, close: Token, what: &str) -> Result<(Vec<Expression>, Range<usize>), ParseError> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&close) {
                let end = self.expect(close, what)?;
                return Ok((items, end));
            }
            items.push(self.parse_expr(0)?);
            match self.peek() {
                Some(Token::Comma) => {
                    self.advance();
                }
                _ => {
                    let end = self.expect(close, what)?;
                    return Ok((items, end));
                }
            }
        }
    }

    fn parse_object(&mut self) -> Result<Expression, ParseError> {
        let mut entries = Vec::new();
        loop {
            let key = match self.advance() {
                Some((Token::RBrace, _)) => break,
                Some((Token::Ident(name), span)) => {
                    // Shorthand `{ name }`
                    if matches!(self.peek(), Some(Token::Comma) | Some(Token::RBrace)) {
                        entries.push((name.clone(), Expression::Identifier(name, span)));
                        if self.peek() == Some(&Token::Comma) {
                            self.advance();
                        }
                        continue;
                    }
                    name
                }
                Some((Token::StringLit(s), _)) => s,
                Some((Token::Number(n), _)) => number_key(n),
                Some((t, span)) => return Err(self.token_error(format!("expected object key, found {:?}", t), span)),
                None => return Err(self.eof_error("expected '}'")),
            };
            self.expect(Token::Colon, "':' after object key")?;
            let value = self.parse_expr(0)?;
            entries.push((key, value));
            match self.advance() {
                Some((Token::Comma, _)) => continue,
                Some((Token::RBrace, _)) => break,
                Some((t, span)) => return Err(self.token_error(format!("expected ',' or '}}', found {:?}", t), span)),
                None => return Err(self.eof_error("expected '}'")),
            }
        }
        Ok(Expression::ObjectLiteral(entries))
    }

    fn parse_prefix(&mut self) -> Result<Expression, ParseError> {
        let (token, span) = self
            .advance()
            .ok_or_else(|| self.eof_error("unexpected end of expression"))?;

        match token {
            // Literals
            Token::Number(n) => Ok(Expression::NumberLiteral(n)),
            Token::StringLit(s) => Ok(Expression::StringLiteral(s)),
            Token::True => Ok(Expression::BooleanLiteral(true)),
            Token::False => Ok(Expression::BooleanLiteral(false)),
            Token::Null => Ok(Expression::NullLiteral),

            Token::Ident(name) => Ok(Expression::Identifier(name, span)),

            // Unary operators
            Token::Bang => self.parse_unary(UnaryOperator::LogicalNot),
            Token::Minus => self.parse_unary(UnaryOperator::Negation),
            Token::Plus => self.parse_unary(UnaryOperator::Plus),

            // Parenthesized expression
            Token::LParen => {
                let expr = self.parse_expr(0)?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }

            Token::LBracket => {
                let (items, _) = self.parse_list(Token::RBracket, "']'")?;
                Ok(Expression::ArrayLiteral(items))
            }

            Token::LBrace => self.parse_object(),

            other => Err(self.token_error(format!("unexpected token: {:?}", other), span)),
        }
    }

    fn parse_unary(&mut self, operator: UnaryOperator) -> Result<Expression, ParseError> {
        let operand = self.parse_expr(BP_UNARY)?;
        Ok(Expression::UnaryOperation {
            operator,
            operand: Box::new(operand),
        })
    }
}

/// Infix binding powers: returns (left_bp, right_bp) or None if not infix.
fn infix_bp(token: &Token) -> Option<(u8, u8)> {
    match token {
        Token::Question => Some((BP_CONDITIONAL, BP_CONDITIONAL)),
        Token::PipePipe | Token::QuestionQuestion => Some((BP_OR, BP_OR + 1)),
        Token::AmpAmp => Some((BP_AND, BP_AND + 1)),
        Token::EqEq | Token::BangEq => Some((BP_EQUALITY, BP_EQUALITY + 1)),
        Token::Gt | Token::Lt | Token::GtEq | Token::LtEq => {
            Some((BP_COMPARISON, BP_COMPARISON + 1))
        }
        Token::Plus | Token::Minus => Some((BP_ADDITIVE, BP_ADDITIVE + 1)),
        Token::Star | Token::Slash | Token::Percent => {
            Some((BP_MULTIPLICATIVE, BP_MULTIPLICATIVE + 1))
        }
        _ => None,
    }
}

/// Object key form of a numeric literal (`{ 1: x }` → `"1"`).
fn number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
