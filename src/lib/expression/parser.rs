use super::{Expression, FieldIndex, SelectorKind};
use crate::{
    error::{Result, StoreError},
    val::Val,
};

/// Parses a field expression such as `sum(${amount})` or `nth(${name}, 2)`.
/// Field references are registered in `index` as they are encountered.
pub fn parse_expression(input: &str, index: &mut FieldIndex) -> Result<Expression> {
    let lexer = Lexer::new(input);
    let tokens = lexer.collect::<Result<Vec<_>>>()?;
    if tokens.is_empty() {
        return Err(StoreError::InvalidExpression(
            "expression cannot be empty".into(),
        ));
    }
    let mut parser = Parser::new(tokens, index);
    let expr = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(String),
    Identifier(String),
    String(String),
    Number(String),
    Boolean(bool),
    Null,
    LParen,
    RParen,
    Comma,
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        self.consume_whitespace();
        let ch = self.peek_char()?;
        let token = if ch == '$' {
            self.consume_field()
        } else if is_identifier_start(ch) {
            self.consume_identifier()
        } else if ch == '"' || ch == '\'' {
            self.consume_string()
        } else if ch.is_ascii_digit() || ch == '-' {
            self.consume_number()
        } else {
            self.advance();
            match ch {
                '(' => Ok(Token::LParen),
                ')' => Ok(Token::RParen),
                ',' => Ok(Token::Comma),
                _ => Err(invalid(format!("unexpected character '{ch}'"))),
            }
        };
        Some(token)
    }
}

impl Lexer<'_> {
    fn consume_whitespace(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn consume_field(&mut self) -> Result<Token> {
        self.advance();
        if self.next_char() != Some('{') {
            return Err(invalid("expected '{' after '$'"));
        }
        let start = self.position;
        while let Some(ch) = self.next_char() {
            if ch == '}' {
                let name = self.input[start..self.position - 1].trim();
                if name.is_empty() {
                    return Err(invalid("field reference cannot be empty"));
                }
                return Ok(Token::Field(name.to_string()));
            }
        }
        Err(invalid("unterminated field reference"))
    }

    fn consume_identifier(&mut self) -> Result<Token> {
        let start = self.position;
        self.advance();
        while let Some(ch) = self.peek_char() {
            if is_identifier_part(ch) {
                self.advance();
            } else {
                break;
            }
        }
        let ident = &self.input[start..self.position];
        match ident.to_ascii_lowercase().as_str() {
            "true" => Ok(Token::Boolean(true)),
            "false" => Ok(Token::Boolean(false)),
            "null" => Ok(Token::Null),
            _ => Ok(Token::Identifier(ident.to_string())),
        }
    }

    fn consume_string(&mut self) -> Result<Token> {
        let Some(quote) = self.next_char() else {
            return Err(invalid("unterminated string literal"));
        };
        let mut value = String::new();
        while let Some(ch) = self.next_char() {
            if ch == quote {
                return Ok(Token::String(value));
            }
            if ch == '\\' {
                match self.next_char() {
                    Some(escaped) => value.push(escaped),
                    None => return Err(invalid("unterminated escape sequence")),
                }
            } else {
                value.push(ch);
            }
        }
        Err(invalid("unterminated string literal"))
    }

    fn consume_number(&mut self) -> Result<Token> {
        let start = self.position;
        self.advance();
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(Token::Number(self.input[start..self.position].to_string()))
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn next_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.position += ch.len_utf8();
        Some(ch)
    }

    fn advance(&mut self) {
        self.next_char();
    }
}

fn is_identifier_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_identifier_part(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '.'
}

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::InvalidExpression(message.into())
}

struct Parser<'i> {
    tokens: Vec<Token>,
    position: usize,
    index: &'i mut FieldIndex,
}

impl<'i> Parser<'i> {
    fn new(tokens: Vec<Token>, index: &'i mut FieldIndex) -> Self {
        Self {
            tokens,
            position: 0,
            index,
        }
    }

    fn parse_expression(&mut self) -> Result<Expression> {
        let token = self
            .current_token()
            .cloned()
            .ok_or_else(|| invalid("unexpected end of expression"))?;
        self.advance();
        match token {
            Token::Field(name) => Ok(self.field(name)),
            Token::String(value) => Ok(Expression::Literal(Val::String(value))),
            Token::Number(value) => parse_number(&value).map(Expression::Literal),
            Token::Boolean(value) => Ok(Expression::Literal(Val::Boolean(value))),
            Token::Null => Ok(Expression::Literal(Val::Null)),
            Token::Identifier(name) => {
                if self.match_token(&Token::LParen) {
                    self.advance();
                    self.parse_function(&name)
                } else {
                    Ok(self.field(name))
                }
            }
            other => Err(invalid(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_function(&mut self, name: &str) -> Result<Expression> {
        let mut args = Vec::new();
        if !self.match_token(&Token::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if self.match_token(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen, "')'")?;

        let lowered = name.to_ascii_lowercase();
        let expr = match lowered.as_str() {
            "count" => {
                expect_arity(name, &args, 0)?;
                Expression::Count
            }
            "sum" => Expression::Sum(single_scalar(name, args)?),
            "min" => Expression::Min(single_scalar(name, args)?),
            "max" => Expression::Max(single_scalar(name, args)?),
            "average" | "mean" => Expression::Average(single_scalar(name, args)?),
            "any" => selector(SelectorKind::Any, single_scalar(name, args)?),
            "first" => selector(SelectorKind::First, single_scalar(name, args)?),
            "last" => selector(SelectorKind::Last, single_scalar(name, args)?),
            "nth" => {
                expect_arity(name, &args, 2)?;
                let mut args = args.into_iter();
                let arg = scalar(name, args.next())?;
                let position = integer_literal(name, args.next())?;
                if position == 0 {
                    return Err(invalid("nth position starts at 1"));
                }
                selector(SelectorKind::Nth(position), arg)
            }
            "top" | "bottom" => {
                expect_arity(name, &args, 3)?;
                let mut args = args.into_iter();
                let arg = scalar(name, args.next())?;
                let delimiter = match args.next() {
                    Some(Expression::Literal(Val::String(delimiter))) => delimiter,
                    _ => return Err(invalid(format!("{name} expects a string delimiter"))),
                };
                let limit = integer_literal(name, args.next())?;
                let kind = if lowered == "top" {
                    SelectorKind::Top { delimiter, limit }
                } else {
                    SelectorKind::Bottom { delimiter, limit }
                };
                selector(kind, arg)
            }
            _ => return Err(invalid(format!("unknown function '{name}'"))),
        };
        Ok(expr)
    }

    fn field(&mut self, name: String) -> Expression {
        let index = self.index.create(&name);
        Expression::Field { index, name }
    }

    fn expect(&mut self, token: &Token, label: &str) -> Result<()> {
        if self.match_token(token) {
            self.advance();
            Ok(())
        } else {
            Err(invalid(format!("expected {label}")))
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.position >= self.tokens.len() {
            Ok(())
        } else {
            Err(invalid("unexpected tokens after expression"))
        }
    }

    fn current_token(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn match_token(&self, token: &Token) -> bool {
        self.current_token() == Some(token)
    }
}

fn selector(kind: SelectorKind, arg: Box<Expression>) -> Expression {
    Expression::Selector { kind, arg }
}

fn expect_arity(name: &str, args: &[Expression], expected: usize) -> Result<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(invalid(format!(
            "{name} expects {expected} argument(s), found {}",
            args.len()
        )))
    }
}

fn single_scalar(name: &str, args: Vec<Expression>) -> Result<Box<Expression>> {
    expect_arity(name, &args, 1)?;
    scalar(name, args.into_iter().next())
}

fn scalar(name: &str, arg: Option<Expression>) -> Result<Box<Expression>> {
    match arg {
        Some(arg) if !arg.is_aggregate() => Ok(Box::new(arg)),
        Some(_) => Err(invalid(format!("{name} cannot wrap another aggregate"))),
        None => Err(invalid(format!("{name} is missing its argument"))),
    }
}

fn integer_literal(name: &str, arg: Option<Expression>) -> Result<usize> {
    match arg {
        Some(Expression::Literal(Val::Long(value))) if value >= 0 => Ok(value as usize),
        _ => Err(invalid(format!("{name} expects a non-negative integer"))),
    }
}

fn parse_number(value: &str) -> Result<Val> {
    if let Ok(long) = value.parse::<i64>() {
        return Ok(Val::Long(long));
    }
    value
        .parse::<f64>()
        .map(Val::Double)
        .map_err(|err| invalid(format!("invalid number '{value}': {err}")))
}
