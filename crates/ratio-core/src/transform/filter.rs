//! The boolean condition language used by `filter`.
//!
//! ```text
//! or      := and ('or' and)*
//! and     := unary ('and' unary)*
//! unary   := 'not' unary | '(' or ')' | compare
//! compare := operand (op operand)?
//! op      := '==' | '!=' | '>=' | '<=' | '>' | '<' | 'contains'
//! operand := 'item' ('.' key)* | string | number | true | false | null | word
//! ```
//!
//! A bare word that is not `item...` is a string literal. A comparison
//! without an operator tests the operand's truthiness.

use std::cmp::Ordering;

use ratio_types::value::Value;

/// A parsed filter condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Or(Box<Condition>, Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Compare(Operand, CompareOp, Operand),
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Item(Vec<String>),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Num(Value),
    Op(CompareOp),
    LParen,
    RParen,
}

pub fn parse(source: &str) -> Result<Condition, String> {
    let tokens = tokenize(source)?;
    let mut pos = 0;
    let condition = parse_or(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(format!("unexpected trailing input in '{source}'"));
    }
    Ok(condition)
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            _ if ["==", "!=", ">=", "<="].contains(&two.as_str()) => {
                tokens.push(Token::Op(match two.as_str() {
                    "==" => CompareOp::Eq,
                    "!=" => CompareOp::Ne,
                    ">=" => CompareOp::Ge,
                    _ => CompareOp::Le,
                }));
                i += 2;
            }
            '>' | '<' => {
                tokens.push(Token::Op(if c == '>' { CompareOp::Gt } else { CompareOp::Lt }));
                i += 1;
            }
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|ch| *ch == c)
                    .ok_or_else(|| format!("unterminated string in '{source}'"))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = if text.contains('.') {
                    text.parse::<f64>().map(Value::from_f64).map_err(|e| e.to_string())?
                } else {
                    text.parse::<i64>().map(Value::from).map_err(|e| e.to_string())?
                };
                tokens.push(Token::Num(number));
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | '=' | '!' | '<' | '>' | '"' | '\'')
                {
                    i += 1;
                }
                if start == i {
                    return Err(format!("unexpected character '{c}' in '{source}'"));
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(if word == "contains" {
                    Token::Op(CompareOp::Contains)
                } else {
                    Token::Word(word)
                });
            }
        }
    }
    Ok(tokens)
}

fn is_word(tokens: &[Token], pos: usize, word: &str) -> bool {
    matches!(tokens.get(pos), Some(Token::Word(w)) if w == word)
}

fn parse_or(tokens: &[Token], pos: &mut usize) -> Result<Condition, String> {
    let mut left = parse_and(tokens, pos)?;
    while is_word(tokens, *pos, "or") {
        *pos += 1;
        let right = parse_and(tokens, pos)?;
        left = Condition::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn parse_and(tokens: &[Token], pos: &mut usize) -> Result<Condition, String> {
    let mut left = parse_unary(tokens, pos)?;
    while is_word(tokens, *pos, "and") {
        *pos += 1;
        let right = parse_unary(tokens, pos)?;
        left = Condition::And(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> Result<Condition, String> {
    if is_word(tokens, *pos, "not") {
        *pos += 1;
        return Ok(Condition::Not(Box::new(parse_unary(tokens, pos)?)));
    }
    if tokens.get(*pos) == Some(&Token::LParen) {
        *pos += 1;
        let inner = parse_or(tokens, pos)?;
        if tokens.get(*pos) != Some(&Token::RParen) {
            return Err("unclosed '('".to_string());
        }
        *pos += 1;
        return Ok(inner);
    }

    let left = parse_operand(tokens, pos)?;
    match tokens.get(*pos) {
        Some(Token::Op(op)) => {
            let op = *op;
            *pos += 1;
            let right = parse_operand(tokens, pos)?;
            Ok(Condition::Compare(left, op, right))
        }
        _ => Ok(Condition::Truthy(left)),
    }
}

fn parse_operand(tokens: &[Token], pos: &mut usize) -> Result<Operand, String> {
    let token = tokens
        .get(*pos)
        .ok_or_else(|| "expected operand, found end of condition".to_string())?;
    *pos += 1;
    Ok(match token {
        Token::Str(s) => Operand::Literal(Value::String(s.clone())),
        Token::Num(n) => Operand::Literal(n.clone()),
        Token::Word(w) => match w.as_str() {
            "true" | "True" => Operand::Literal(Value::Bool(true)),
            "false" | "False" => Operand::Literal(Value::Bool(false)),
            "null" | "None" => Operand::Literal(Value::Null),
            "and" | "or" | "not" => return Err(format!("expected operand, found '{w}'")),
            "item" => Operand::Item(Vec::new()),
            _ => match w.strip_prefix("item.") {
                Some(path) => Operand::Item(path.split('.').map(str::to_string).collect()),
                None => Operand::Literal(Value::String(w.clone())),
            },
        },
        Token::Op(_) | Token::LParen | Token::RParen => {
            return Err("expected operand".to_string());
        }
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Condition {
    pub fn evaluate(&self, item: &Value) -> Result<bool, String> {
        match self {
            Condition::Or(a, b) => Ok(a.evaluate(item)? || b.evaluate(item)?),
            Condition::And(a, b) => Ok(a.evaluate(item)? && b.evaluate(item)?),
            Condition::Not(inner) => Ok(!inner.evaluate(item)?),
            Condition::Truthy(operand) => Ok(truthy(&operand.value(item)?)),
            Condition::Compare(left, op, right) => {
                let (l, r) = (left.value(item)?, right.value(item)?);
                let ordered = |accept: fn(Ordering) -> bool| {
                    l.compare(&r).map(accept).ok_or_else(|| {
                        format!("cannot compare {} with {}", l.kind(), r.kind())
                    })
                };
                match op {
                    CompareOp::Eq => Ok(l == r),
                    CompareOp::Ne => Ok(l != r),
                    CompareOp::Gt => ordered(Ordering::is_gt),
                    CompareOp::Lt => ordered(Ordering::is_lt),
                    CompareOp::Ge => ordered(Ordering::is_ge),
                    CompareOp::Le => ordered(Ordering::is_le),
                    CompareOp::Contains => Ok(match (&l, &r) {
                        (Value::String(hay), needle) => hay.contains(&needle.to_display_string()),
                        (Value::List(items), needle) => items.contains(needle),
                        (Value::Object(map), Value::String(key)) => map.contains_key(key),
                        _ => false,
                    }),
                }
            }
        }
    }
}

impl Operand {
    fn value(&self, item: &Value) -> Result<Value, String> {
        match self {
            Operand::Literal(v) => Ok(v.clone()),
            Operand::Item(path) => {
                let mut current = item;
                for key in path {
                    current = match current {
                        Value::Object(map) => map.get(key),
                        Value::List(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                        _ => None,
                    }
                    .ok_or_else(|| format!("item has no property '{}'", path.join(".")))?;
                }
                Ok(current.clone())
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::List(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::File(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn check(condition: &str, item: serde_json::Value) -> Result<bool, String> {
        parse(condition)?.evaluate(&Value::from(item))
    }

    #[test]
    fn comparisons() {
        let item = json!({"error_count": 3, "status": "active", "score": 1.5});
        assert!(check("item.error_count > 0", item.clone()).unwrap());
        assert!(check("item.error_count >= 3", item.clone()).unwrap());
        assert!(!check("item.error_count < 3", item.clone()).unwrap());
        assert!(check("item.status == 'active'", item.clone()).unwrap());
        assert!(check("item.status != \"inactive\"", item.clone()).unwrap());
        assert!(check("item.score <= 1.5", item).unwrap());
    }

    #[test]
    fn boolean_connectives_and_grouping() {
        let item = json!({"a": 1, "b": "x", "c": false});
        assert!(check("item.a == 1 and item.b == 'x'", item.clone()).unwrap());
        assert!(check("item.a == 2 or item.b == 'x'", item.clone()).unwrap());
        assert!(check("not item.c", item.clone()).unwrap());
        assert!(!check("not (item.a == 1 or item.c)", item.clone()).unwrap());
        assert!(check("(item.a == 2 or item.a == 1) and not item.c", item).unwrap());
    }

    #[test]
    fn contains_on_strings_lists_and_objects() {
        let item = json!({"title": "weekly report", "tags": ["x", "y"], "meta": {"k": 1}});
        assert!(check("item.title contains 'report'", item.clone()).unwrap());
        assert!(check("item.tags contains 'y'", item.clone()).unwrap());
        assert!(check("item.meta contains 'k'", item.clone()).unwrap());
        assert!(!check("item.tags contains 'z'", item).unwrap());
    }

    #[test]
    fn bare_words_are_strings() {
        assert!(check("item.status == active", json!({"status": "active"})).unwrap());
    }

    #[test]
    fn missing_property_is_an_error() {
        assert!(check("item.nope == 1", json!({"a": 1})).is_err());
    }

    #[test]
    fn ordering_across_kinds_is_an_error() {
        assert!(check("item.a > 1", json!({"a": "text"})).is_err());
    }

    #[test]
    fn parse_errors() {
        for bad in ["item.a ==", "(item.a == 1", "item.a == 'x", "and"] {
            assert!(parse(bad).is_err(), "{bad} should not parse");
        }
    }
}
