//! Default expression language for step conditions.
//!
//! Small boolean/value language over JSON bindings:
//!
//! ```text
//! order.status == 200 && !is_empty(order.body.items)
//! user.tier in ['gold', 'platinum'] || len(input.request.query.debug) > 0
//! ```
//!
//! Paths whose root binding is absent evaluate to `null`, so a condition over a skipped
//! step behaves as if the binding did not exist. Parsed expressions are cached by text.

use std::{cmp::Ordering, sync::Arc};

use dashmap::DashMap;
use serde_json::{Map, Number, Value as JsonValue};

use crate::core::{EvalError, ExpressionEvaluator};

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(JsonValue),
    Path(Vec<Segment>),
    Array(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Op(CmpOp),
    And,
    Or,
    Not,
}

fn tokenize(src: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let after_dot = matches!(tokens.last(), Some(Token::Dot));
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(EvalError::Syntax(format!("expected `{c}{c}` at {i}")));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, eq) {
                    ('=', true) => Token::Op(CmpOp::Eq),
                    ('!', true) => Token::Op(CmpOp::Ne),
                    ('!', false) => Token::Not,
                    ('<', true) => Token::Op(CmpOp::Le),
                    ('<', false) => Token::Op(CmpOp::Lt),
                    ('>', true) => Token::Op(CmpOp::Ge),
                    ('>', false) => Token::Op(CmpOp::Gt),
                    _ => return Err(EvalError::Syntax(format!("unexpected `=` at {i}"))),
                };
                tokens.push(token);
                i += if eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(EvalError::Syntax("unterminated string".into())),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                value.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '-' && !after_dot && next_is_digit(&chars, i)) => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                // after a dot this is a path index, never a fraction
                if !after_dot
                    && chars.get(i) == Some(&'.')
                    && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())
                {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = parse_number(&text)
                    .ok_or_else(|| EvalError::Syntax(format!("invalid number `{text}`")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '$'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "contains" => Token::Op(CmpOp::Contains),
                    "in" => Token::Op(CmpOp::In),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(EvalError::Syntax(format!(
                    "unexpected character `{other}` at {i}"
                )))
            }
        }
    }

    Ok(tokens)
}

fn next_is_digit(chars: &[char], i: usize) -> bool {
    chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(n) = text.parse::<i64>() {
        return Some(Number::from(n));
    }
    text.parse::<f64>().ok().and_then(Number::from_f64)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse(src: &str) -> Result<Expr, EvalError> {
        let mut parser = Parser {
            tokens: tokenize(src)?,
            pos: 0,
        };
        if parser.tokens.is_empty() {
            return Err(EvalError::Syntax("empty expression".into()));
        }
        let expr = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(EvalError::Syntax(format!(
                "unexpected trailing input {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvalError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            other => Err(EvalError::Syntax(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(JsonValue::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(JsonValue::String(s))),
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                            continue;
                        }
                        break;
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::Array(items))
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(JsonValue::Bool(true))),
                "false" => Ok(Expr::Literal(JsonValue::Bool(false))),
                "null" => Ok(Expr::Literal(JsonValue::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.or()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                                continue;
                            }
                            break;
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(word, args))
                }
                _ => self.path(word),
            },
            other => Err(EvalError::Syntax(format!("unexpected token {other:?}"))),
        }
    }

    fn path(&mut self, root: String) -> Result<Expr, EvalError> {
        let mut segments = vec![Segment::Key(root)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                        Some(Token::Number(n)) => segments.push(index_segment(&n)?),
                        other => {
                            return Err(EvalError::Syntax(format!(
                                "expected path segment, found {other:?}"
                            )))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Number(n)) => segments.push(index_segment(&n)?),
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        other => {
                            return Err(EvalError::Syntax(format!(
                                "expected index, found {other:?}"
                            )))
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => return Ok(Expr::Path(segments)),
            }
        }
    }
}

fn index_segment(n: &Number) -> Result<Segment, EvalError> {
    n.as_u64()
        .map(|i| Segment::Index(i as usize))
        .ok_or_else(|| EvalError::Syntax(format!("invalid index {n}")))
}

/// Parse a bare path such as `order.body.items[0].id`.
pub fn parse_path(src: &str) -> Result<Vec<Segment>, EvalError> {
    match Parser::parse(src)? {
        Expr::Path(segments) => Ok(segments),
        _ => Err(EvalError::Syntax(format!("`{src}` is not a path"))),
    }
}

/// Walk `segments` below an already-resolved root value; missing children yield `None`.
pub fn walk<'a>(root: &'a JsonValue, segments: &[Segment]) -> Option<&'a JsonValue> {
    segments.iter().try_fold(root, |value, segment| match segment {
        Segment::Key(key) => match value {
            JsonValue::Object(map) => map.get(key),
            JsonValue::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        },
        Segment::Index(i) => match value {
            JsonValue::Array(items) => items.get(*i),
            JsonValue::Object(map) => map.get(&i.to_string()),
            _ => None,
        },
    })
}

fn resolve(segments: &[Segment], bindings: &Map<String, JsonValue>) -> JsonValue {
    let Some((Segment::Key(root), rest)) = segments.split_first() else {
        return JsonValue::Null;
    };
    bindings
        .get(root)
        .and_then(|value| walk(value, rest))
        .cloned()
        .unwrap_or(JsonValue::Null)
}

fn as_bool(value: &JsonValue, context: &str) -> Result<bool, EvalError> {
    value
        .as_bool()
        .ok_or_else(|| EvalError::TypeMismatch(format!("{context} expects a boolean, got {value}")))
}

fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_ordered(a: &JsonValue, b: &JsonValue) -> Result<Ordering, EvalError> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
                .ok_or_else(|| EvalError::TypeMismatch("numbers are not comparable".into()))
        }
        (JsonValue::String(x), JsonValue::String(y)) => Ok(x.cmp(y)),
        _ => Err(EvalError::TypeMismatch(format!("cannot order {a} against {b}"))),
    }
}

fn contains(haystack: &JsonValue, needle: &JsonValue) -> Result<bool, EvalError> {
    match (haystack, needle) {
        (JsonValue::Null, _) => Ok(false),
        (JsonValue::String(s), JsonValue::String(sub)) => Ok(s.contains(sub.as_str())),
        (JsonValue::Array(items), _) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (JsonValue::Object(map), JsonValue::String(key)) => Ok(map.contains_key(key)),
        _ => Err(EvalError::TypeMismatch(format!(
            "{haystack} cannot contain {needle}"
        ))),
    }
}

fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn eval(expr: &Expr, bindings: &Map<String, JsonValue>) -> Result<JsonValue, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(resolve(segments, bindings)),
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        Expr::Not(inner) => Ok(JsonValue::Bool(!as_bool(&eval(inner, bindings)?, "`!`")?)),
        Expr::And(l, r) => {
            if !as_bool(&eval(l, bindings)?, "`&&`")? {
                return Ok(JsonValue::Bool(false));
            }
            Ok(JsonValue::Bool(as_bool(&eval(r, bindings)?, "`&&`")?))
        }
        Expr::Or(l, r) => {
            if as_bool(&eval(l, bindings)?, "`||`")? {
                return Ok(JsonValue::Bool(true));
            }
            Ok(JsonValue::Bool(as_bool(&eval(r, bindings)?, "`||`")?))
        }
        Expr::Compare(op, l, r) => {
            let (a, b) = (eval(l, bindings)?, eval(r, bindings)?);
            let result = match op {
                CmpOp::Eq => values_equal(&a, &b),
                CmpOp::Ne => !values_equal(&a, &b),
                CmpOp::Gt => compare_ordered(&a, &b)? == Ordering::Greater,
                CmpOp::Ge => compare_ordered(&a, &b)? != Ordering::Less,
                CmpOp::Lt => compare_ordered(&a, &b)? == Ordering::Less,
                CmpOp::Le => compare_ordered(&a, &b)? != Ordering::Greater,
                CmpOp::Contains => contains(&a, &b)?,
                CmpOp::In => contains(&b, &a)?,
            };
            Ok(JsonValue::Bool(result))
        }
        Expr::Call(name, args) => call(name, args, bindings),
    }
}

fn call(name: &str, args: &[Expr], bindings: &Map<String, JsonValue>) -> Result<JsonValue, EvalError> {
    let values = args
        .iter()
        .map(|arg| eval(arg, bindings))
        .collect::<Result<Vec<_>, _>>()?;

    let arity = |n: usize| {
        if values.len() == n {
            Ok(())
        } else {
            Err(EvalError::Syntax(format!(
                "{name} takes {n} argument(s), got {}",
                values.len()
            )))
        }
    };

    let result = match name {
        "is_null" => {
            arity(1)?;
            values[0].is_null()
        }
        "is_not_null" => {
            arity(1)?;
            !values[0].is_null()
        }
        "is_empty" => {
            arity(1)?;
            is_empty(&values[0])
        }
        "is_not_empty" => {
            arity(1)?;
            !is_empty(&values[0])
        }
        "is_blank" => {
            arity(1)?;
            is_blank(&values[0])
        }
        "is_not_blank" => {
            arity(1)?;
            !is_blank(&values[0])
        }
        "contains_any" => {
            arity(2)?;
            let JsonValue::Array(candidates) = &values[1] else {
                return Err(EvalError::TypeMismatch(
                    "contains_any expects an array of candidates".into(),
                ));
            };
            let mut any = false;
            for candidate in candidates {
                if contains(&values[0], candidate)? {
                    any = true;
                    break;
                }
            }
            any
        }
        "len" => {
            arity(1)?;
            let len = match &values[0] {
                JsonValue::Null => 0,
                JsonValue::String(s) => s.chars().count(),
                JsonValue::Array(items) => items.len(),
                JsonValue::Object(map) => map.len(),
                other => {
                    return Err(EvalError::TypeMismatch(format!("len of {other}")));
                }
            };
            return Ok(JsonValue::from(len));
        }
        _ => return Err(EvalError::UnknownFunction(name.to_string())),
    };

    Ok(JsonValue::Bool(result))
}

const FUNCTIONS: &[&str] = &[
    "is_null",
    "is_not_null",
    "is_empty",
    "is_not_empty",
    "is_blank",
    "is_not_blank",
    "contains_any",
    "len",
];

fn check_functions(expr: &Expr) -> Result<(), EvalError> {
    match expr {
        Expr::Literal(_) | Expr::Path(_) => Ok(()),
        Expr::Array(items) => items.iter().try_for_each(check_functions),
        Expr::Not(inner) => check_functions(inner),
        Expr::And(l, r) | Expr::Or(l, r) | Expr::Compare(_, l, r) => {
            check_functions(l)?;
            check_functions(r)
        }
        Expr::Call(name, args) => {
            if !FUNCTIONS.contains(&name.as_str()) {
                return Err(EvalError::UnknownFunction(name.clone()));
            }
            args.iter().try_for_each(check_functions)
        }
    }
}

/// The built-in [`ExpressionEvaluator`].
#[derive(Default)]
pub struct DefaultEvaluator {
    cache: DashMap<String, Arc<Expr>>,
}

impl DefaultEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile(&self, src: &str) -> Result<Arc<Expr>, EvalError> {
        if let Some(expr) = self.cache.get(src) {
            return Ok(expr.clone());
        }
        let expr = Arc::new(Parser::parse(src)?);
        check_functions(&expr)?;
        self.cache.insert(src.to_string(), expr.clone());
        Ok(expr)
    }
}

impl ExpressionEvaluator for DefaultEvaluator {
    fn check(&self, expr: &str) -> Result<(), EvalError> {
        self.compile(expr).map(|_| ())
    }

    fn evaluate(
        &self,
        expr: &str,
        bindings: &Map<String, JsonValue>,
    ) -> Result<JsonValue, EvalError> {
        let compiled = self.compile(expr)?;
        eval(&compiled, bindings)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bindings(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn cond(expr: &str, value: JsonValue) -> Result<bool, EvalError> {
        DefaultEvaluator::new().evaluate_condition(expr, &bindings(value))
    }

    #[test]
    fn test_comparisons() {
        let b = json!({"A": {"code": 0, "name": "alice", "ratio": 0.5}});
        assert!(cond("A.code == 0", b.clone()).unwrap());
        assert!(!cond("A.code == 1", b.clone()).unwrap());
        assert!(cond("A.code != 1", b.clone()).unwrap());
        assert!(cond("A.ratio < 1", b.clone()).unwrap());
        assert!(cond("A.ratio >= 0.5", b.clone()).unwrap());
        assert!(cond("A.name > 'aaron'", b.clone()).unwrap());
        assert!(cond("A.code == 0.0", b.clone()).unwrap());
        assert!(cond("A.code > -1", b).unwrap());
    }

    #[test]
    fn test_logic_and_precedence() {
        let b = json!({"a": 1, "b": 2, "flag": false});
        assert!(cond("a == 1 && b == 2", b.clone()).unwrap());
        assert!(cond("a == 2 || b == 2", b.clone()).unwrap());
        assert!(cond("!flag", b.clone()).unwrap());
        assert!(cond("not (a == 2) and b == 2", b.clone()).unwrap());
        assert!(!cond("a == 1 && (b == 3 || flag)", b).unwrap());
    }

    #[test]
    fn test_absent_binding_is_null() {
        let b = json!({"C": {"ok": true}});
        assert!(!cond("A.code == 0", b.clone()).unwrap());
        assert!(cond("is_null(A)", b.clone()).unwrap());
        assert!(cond("is_not_null(C.ok)", b).unwrap());
    }

    #[test]
    fn test_type_mismatch() {
        let b = json!({"A": {"code": "0"}});
        assert!(matches!(
            cond("A.code > 1", b.clone()),
            Err(EvalError::TypeMismatch(_))
        ));
        // equality across types is simply false
        assert!(!cond("A.code == 0", b.clone()).unwrap());
        // non-boolean condition
        assert!(matches!(
            cond("A.code", b),
            Err(EvalError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_paths_and_membership() {
        let b = json!({
            "order": {"items": [{"id": 7}, {"id": 9}], "tags": ["vip", "new"], "note": "  "},
            "user": {"tier": "gold"}
        });
        assert!(cond("order.items.1.id == 9", b.clone()).unwrap());
        assert!(cond("order.items[0].id == 7", b.clone()).unwrap());
        assert!(cond("order.tags contains 'vip'", b.clone()).unwrap());
        assert!(cond("user.tier in ['gold', 'platinum']", b.clone()).unwrap());
        assert!(cond("contains_any(order.tags, ['x', 'new'])", b.clone()).unwrap());
        assert!(cond("is_blank(order.note) && !is_empty(order.note)", b.clone()).unwrap());
        assert!(cond("len(order.items) == 2", b).unwrap());
    }

    #[test]
    fn test_check_rejects_malformed() {
        let evaluator = DefaultEvaluator::new();
        assert!(evaluator.check("A.code == 0").is_ok());
        assert!(matches!(evaluator.check("A.code =="), Err(EvalError::Syntax(_))));
        assert!(matches!(evaluator.check("A.code = 0"), Err(EvalError::Syntax(_))));
        assert!(matches!(evaluator.check("'open"), Err(EvalError::Syntax(_))));
        assert!(matches!(
            evaluator.check("nope(A)"),
            Err(EvalError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("input.request.params['id']").unwrap(),
            vec![
                Segment::Key("input".into()),
                Segment::Key("request".into()),
                Segment::Key("params".into()),
                Segment::Key("id".into()),
            ]
        );
        assert!(parse_path("a == 1").is_err());
    }
}
