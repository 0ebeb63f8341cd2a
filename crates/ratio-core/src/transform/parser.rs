//! Tokenizer and recursive-descent parser for transform expressions.
//!
//! ```text
//! expr    := call | path | string | number | 'true' | 'false' | 'null'
//!          | '[' (expr (',' expr)*)? ']'
//!          | '{' (key ':' expr (',' key ':' expr)*)? '}'
//! call    := ident '(' (arg (',' arg)*)? ')'
//! arg     := ident '=' expr | expr
//! path    := ident ('.' segment | '[' integer ']')*
//! ```
//!
//! Trailing commas are accepted in argument, list, and object positions.

use std::collections::BTreeMap;
use std::fmt;

use ratio_types::value::Value;

use super::TransformError;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Path),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Call(Call),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: String,
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Positional(Expr),
    Keyword(String, Expr),
}

/// A dotted path rooted at a context name (or `current` inside a pipeline).
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub root: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(i64),
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for segment in &self.segments {
            match segment {
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

impl Expr {
    /// Fold literal-only lists and objects into a single value.
    pub fn as_literal(&self) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v.clone()),
            Expr::List(items) => items
                .iter()
                .map(Expr::as_literal)
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            Expr::Object(entries) => entries
                .iter()
                .map(|(k, e)| Some((k.clone(), e.as_literal()?)))
                .collect::<Option<BTreeMap<_, _>>>()
                .map(Value::Object),
            Expr::Path(_) | Expr::Call(_) => None,
        }
    }
}

/// Parse a complete expression.
pub fn parse(source: &str) -> Result<Expr, TransformError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
    };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error(format!("unexpected {}", parser.tokens[parser.pos])));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Value),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Equals,
    Dot,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier '{s}'"),
            Token::Str(s) => write!(f, "string \"{s}\""),
            Token::Num(n) => write!(f, "number {n}"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::LBracket => f.write_str("'['"),
            Token::RBracket => f.write_str("']'"),
            Token::LBrace => f.write_str("'{'"),
            Token::RBrace => f.write_str("'}'"),
            Token::Comma => f.write_str("','"),
            Token::Colon => f.write_str("':'"),
            Token::Equals => f.write_str("'='"),
            Token::Dot => f.write_str("'.'"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, TransformError> {
    let err = |reason: String| TransformError::Parse {
        expression: source.to_string(),
        reason,
    };
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' | ')' | '[' | ']' | '{' | '}' | ',' | ':' | '=' | '.' => {
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    ',' => Token::Comma,
                    ':' => Token::Colon,
                    '=' => Token::Equals,
                    _ => Token::Dot,
                });
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string".to_string())),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| err("dangling escape".to_string()))?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() && tokens.last() == Some(&Token::Dot) => {
                // Numeric path segment (`items.0`): digits only.
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = if text.contains('.') {
                    text.parse::<f64>().map(Value::from_f64)
                        .map_err(|e| err(format!("bad number '{text}': {e}")))?
                } else {
                    text.parse::<i64>().map(Value::from)
                        .map_err(|e| err(format!("bad number '{text}': {e}")))?
                };
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(err(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'s> {
    source: &'s str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: String) -> TransformError {
        TransformError::Parse {
            expression: self.source.to_string(),
            reason,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), TransformError> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(self.error(format!("expected {expected}, found {t}"))),
            None => Err(self.error(format!("expected {expected}, found end of input"))),
        }
    }

    fn expr(&mut self) -> Result<Expr, TransformError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(n)),
            Some(Token::LBracket) => self.list(),
            Some(Token::LBrace) => self.object(),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let args = self.args()?;
                    Ok(Expr::Call(Call { name, args }))
                }
                _ => self.path(name),
            },
            Some(t) => Err(self.error(format!("unexpected {t}"))),
            None => Err(self.error("unexpected end of input".to_string())),
        }
    }

    fn args(&mut self) -> Result<Vec<Arg>, TransformError> {
        let mut args = Vec::new();
        loop {
            if self.peek() == Some(&Token::RParen) {
                self.pos += 1;
                return Ok(args);
            }
            let keyword = match (self.peek(), self.peek_at(1)) {
                (Some(Token::Ident(name)), Some(Token::Equals)) => Some(name.clone()),
                _ => None,
            };
            let arg = match keyword {
                Some(name) => {
                    self.pos += 2;
                    Arg::Keyword(name, self.expr()?)
                }
                None => Arg::Positional(self.expr()?),
            };
            args.push(arg);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(t) => return Err(self.error(format!("expected ',' or ')', found {t}"))),
                None => return Err(self.error("unclosed '('".to_string())),
            }
        }
    }

    fn list(&mut self) -> Result<Expr, TransformError> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&Token::RBracket) {
                self.pos += 1;
                return Ok(Expr::List(items));
            }
            items.push(self.expr()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => return Ok(Expr::List(items)),
                Some(t) => return Err(self.error(format!("expected ',' or ']', found {t}"))),
                None => return Err(self.error("unclosed '['".to_string())),
            }
        }
    }

    fn object(&mut self) -> Result<Expr, TransformError> {
        let mut entries = Vec::new();
        loop {
            let key = match self.next() {
                Some(Token::RBrace) => return Ok(Expr::Object(entries)),
                Some(Token::Str(k)) | Some(Token::Ident(k)) => k,
                Some(t) => return Err(self.error(format!("expected object key, found {t}"))),
                None => return Err(self.error("unclosed '{'".to_string())),
            };
            self.expect(Token::Colon)?;
            entries.push((key, self.expr()?));
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RBrace) => return Ok(Expr::Object(entries)),
                Some(t) => return Err(self.error(format!("expected ',' or '}}', found {t}"))),
                None => return Err(self.error("unclosed '{'".to_string())),
            }
        }
    }

    fn path(&mut self, root: String) -> Result<Expr, TransformError> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(seg)) => segments.push(match seg.parse::<i64>() {
                            Ok(i) => Segment::Index(i),
                            Err(_) => Segment::Key(seg),
                        }),
                        other => {
                            return Err(self.error(format!(
                                "expected path segment after '.', found {}",
                                other.map(|t| t.to_string()).unwrap_or_else(|| "end of input".to_string())
                            )));
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Num(n)) => {
                            let index = n
                                .as_f64()
                                .filter(|f| f.fract() == 0.0)
                                .ok_or_else(|| self.error(format!("non-integer index {n}")))?;
                            segments.push(Segment::Index(index as i64));
                        }
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        other => {
                            return Err(self.error(format!(
                                "expected index, found {}",
                                other.map(|t| t.to_string()).unwrap_or_else(|| "end of input".to_string())
                            )));
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => return Ok(Expr::Path(Path { root, segments })),
            }
        }
    }
}
