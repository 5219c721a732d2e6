//! Sandboxed boolean expressions over an engine's property map.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or         := and ("or" and)*
//! and        := not ("and" not)*
//! not        := "not" not | comparison
//! comparison := primary (("<" | "<=" | ">" | ">=" | "==" | "!=" | "in" | "not in") primary)?
//! primary    := number | string | true | false | null | name | "(" or ")" | "[" items "]"
//! ```
//!
//! Names resolve against the property map. Evaluating a name that is absent
//! aborts the whole expression with `false`, unless `and`/`or` short-circuit
//! before reaching it. Nothing outside the property map is reachable.

use serde_json::Value;

use super::ops::{values_equal, Operator};
use crate::error::KernelError;
use crate::value::Properties;

/// A parsed expression together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, KernelError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(invalid(
                format!("unexpected token {token:?} after expression"),
                *offset,
            ));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, properties: &Properties) -> bool {
        match self.root.eval(properties) {
            Ok(v) => truthy(&v),
            Err(Missing) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Name(String),
    List(Vec<Node>),
    Not(Box<Node>),
    /// Operands of a flat `and` chain, at least two.
    And(Vec<Node>),
    Or(Vec<Node>),
    Compare(Cmp, Box<Node>, Box<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cmp {
    Op(Operator),
    Ne,
}

/// Evaluation touched a property that is not present.
struct Missing;

impl Node {
    fn eval(&self, props: &Properties) -> Result<Value, Missing> {
        match self {
            Node::Literal(v) => Ok(v.clone()),
            Node::Name(name) => props.get(name).cloned().ok_or(Missing),
            Node::List(items) => items
                .iter()
                .map(|n| n.eval(props))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Node::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(props)?))),
            Node::And(operands) => short_circuit(operands, props, false),
            Node::Or(operands) => short_circuit(operands, props, true),
            Node::Compare(cmp, lhs, rhs) => {
                let l = lhs.eval(props)?;
                let r = rhs.eval(props)?;
                let result = match cmp {
                    Cmp::Op(op) => op.apply(&l, &r),
                    Cmp::Ne => !values_equal(&l, &r),
                };
                Ok(Value::Bool(result))
            }
        }
    }
}

/// Value of the first operand whose truthiness equals `stop_on`, else the last.
fn short_circuit(operands: &[Node], props: &Properties, stop_on: bool) -> Result<Value, Missing> {
    let mut last = Value::Bool(!stop_on);
    for operand in operands {
        last = operand.eval(props)?;
        if truthy(&last) == stop_on {
            break;
        }
    }
    Ok(last)
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ── Tokenizer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Ident(String),
    And,
    Or,
    Not,
    In,
    Cmp(Cmp),
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn invalid(msg: String, offset: usize) -> KernelError {
    KernelError::InvalidDependency(format!("{msg} (at offset {offset})"))
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, KernelError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' | ')' | '[' | ']' | ',' | '-' => {
                let token = match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    _ => Token::Minus,
                };
                tokens.push((offset, token));
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let (cmp, width) = match (c, next) {
                    ('<', Some('=')) => (Cmp::Op(Operator::Le), 2),
                    ('>', Some('=')) => (Cmp::Op(Operator::Ge), 2),
                    ('=', Some('=')) => (Cmp::Op(Operator::Eq), 2),
                    ('!', Some('=')) => (Cmp::Ne, 2),
                    ('<', _) => (Cmp::Op(Operator::Lt), 1),
                    ('>', _) => (Cmp::Op(Operator::Gt), 1),
                    _ => return Err(invalid(format!("unexpected character '{c}'"), offset)),
                };
                tokens.push((offset, Token::Cmp(cmp)));
                i += width;
            }
            '\'' | '"' => {
                let quote = c;
                let mut out = String::new();
                i += 1;
                loop {
                    let Some(&(_, ch)) = chars.get(i) else {
                        return Err(invalid("unterminated string".into(), offset));
                    };
                    i += 1;
                    match ch {
                        ch if ch == quote => break,
                        '\\' => {
                            let Some(&(_, esc)) = chars.get(i) else {
                                return Err(invalid("unterminated escape".into(), offset));
                            };
                            i += 1;
                            out.push(match esc {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                        other => out.push(other),
                    }
                }
                tokens.push((offset, Token::Literal(Value::String(out))));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_ascii_alphanumeric() || matches!(chars[i].1, '.' | '+' | '-'))
                {
                    // A sign only belongs to the literal right after an exponent marker.
                    if matches!(chars[i].1, '+' | '-') && !matches!(chars[i - 1].1, 'e' | 'E') {
                        break;
                    }
                    i += 1;
                }
                let end = chars.get(i).map(|(o, _)| *o).unwrap_or(src.len());
                let text = &src[chars[start].0..end];
                let value: Value = serde_json::from_str(text)
                    .map_err(|_| invalid(format!("invalid number '{text}'"), offset))?;
                if !value.is_number() {
                    return Err(invalid(format!("invalid number '{text}'"), offset));
                }
                tokens.push((offset, Token::Literal(value)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let end = chars.get(i).map(|(o, _)| *o).unwrap_or(src.len());
                let word = &src[chars[start].0..end];
                let token = match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" | "True" => Token::Literal(Value::Bool(true)),
                    "false" | "False" => Token::Literal(Value::Bool(false)),
                    "null" | "None" => Token::Literal(Value::Null),
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((offset, token));
            }
            other => return Err(invalid(format!("unexpected character '{other}'"), offset)),
        }
    }

    Ok(tokens)
}

// ── Parser ───────────────────────────────────────────────────────────

fn chain(mut operands: Vec<Node>, build: fn(Vec<Node>) -> Node) -> Node {
    if operands.len() == 1 {
        operands.remove(0)
    } else {
        build(operands)
    }
}

/// Deepest nesting of `not`, parentheses and lists the parser accepts.
const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn enter(&mut self) -> Result<(), KernelError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(invalid("expression nested too deeply".into(), self.offset()));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, want: Token) -> Result<(), KernelError> {
        let offset = self.offset();
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(invalid(format!("expected {want:?}, found {t:?}"), offset)),
            None => Err(invalid(format!("expected {want:?}, found end of input"), offset)),
        }
    }

    fn parse_or(&mut self) -> Result<Node, KernelError> {
        let mut operands = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            operands.push(self.parse_and()?);
        }
        Ok(chain(operands, Node::Or))
    }

    fn parse_and(&mut self) -> Result<Node, KernelError> {
        let mut operands = vec![self.parse_not()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            operands.push(self.parse_not()?);
        }
        Ok(chain(operands, Node::And))
    }

    fn parse_not(&mut self) -> Result<Node, KernelError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.enter()?;
            let inner = self.parse_not()?;
            self.leave();
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, KernelError> {
        let lhs = self.parse_primary()?;
        let cmp = match (self.peek(), self.peek_at(1)) {
            (Some(Token::Cmp(cmp)), _) => {
                let cmp = *cmp;
                self.pos += 1;
                cmp
            }
            (Some(Token::In), _) => {
                self.pos += 1;
                Cmp::Op(Operator::In)
            }
            (Some(Token::Not), Some(Token::In)) => {
                self.pos += 2;
                Cmp::Op(Operator::NotIn)
            }
            _ => return Ok(lhs),
        };
        let rhs = self.parse_primary()?;
        if matches!(self.peek(), Some(Token::Cmp(_) | Token::In)) {
            return Err(invalid(
                "chained comparisons are not supported".into(),
                self.offset(),
            ));
        }
        Ok(Node::Compare(cmp, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_primary(&mut self) -> Result<Node, KernelError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Literal(v)) => Ok(Node::Literal(v)),
            Some(Token::Ident(name)) => Ok(Node::Name(name)),
            Some(Token::Minus) => match self.next() {
                Some(Token::Literal(Value::Number(n))) => {
                    let negated = if let Some(i) = n.as_i64() {
                        Value::from(-i)
                    } else {
                        Value::from(-n.as_f64().unwrap_or(0.0))
                    };
                    Ok(Node::Literal(negated))
                }
                _ => Err(invalid("'-' must precede a number".into(), offset)),
            },
            Some(Token::LParen) => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                self.leave();
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.pos += 1;
                    return Ok(Node::List(items));
                }
                self.enter()?;
                loop {
                    items.push(self.parse_or()?);
                    match self.next() {
                        Some(Token::Comma) if self.peek() == Some(&Token::RBracket) => {
                            self.pos += 1;
                            break;
                        }
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        _ => return Err(invalid("unterminated list".into(), offset)),
                    }
                }
                self.leave();
                Ok(Node::List(items))
            }
            Some(t) => Err(invalid(format!("unexpected token {t:?}"), offset)),
            None => Err(invalid("unexpected end of expression".into(), offset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval(src: &str, p: &Properties) -> bool {
        Expression::parse(src).unwrap().evaluate(p)
    }

    #[test]
    fn comparisons_and_boolean_logic() {
        let p = props(&[("rank", json!(2)), ("tags", json!(["gpu", "fast"]))]);
        assert!(eval("rank >= 2", &p));
        assert!(eval("rank == 2 and 'gpu' in tags", &p));
        assert!(eval("rank < 1 or 'fast' in tags", &p));
        assert!(eval("not rank > 5", &p));
        assert!(eval("'tpu' not in tags", &p));
        assert!(eval("rank != 3", &p));
        assert!(!eval("(rank > 1) and (rank < 2)", &p));
    }

    #[test]
    fn missing_names_fail_unless_short_circuited() {
        let p = props(&[("rank", json!(0))]);
        assert!(!eval("host == 'a'", &p));
        assert!(!eval("not host", &p));
        assert!(!eval("rank == 0 and host == 'a'", &p));
        assert!(eval("rank == 0 or host == 'a'", &p));
    }

    #[test]
    fn literals_and_lists() {
        let p = props(&[("rank", json!(-3)), ("ratio", json!(0.5))]);
        assert!(eval("rank in [-3, 4, 5]", &p));
        assert!(eval("ratio <= 5e-1", &p));
        assert!(eval("[1, 2,] == [1, 2]", &p));
        assert!(eval("True", &p));
        assert!(!eval("None", &p));
    }

    #[test]
    fn empty_property_map_fails_name_lookups() {
        assert!(!eval("rank >= 0", &Properties::new()));
        assert!(eval("1 < 2", &Properties::new()));
    }

    #[test]
    fn parse_errors_are_reported() {
        for bad in ["rank >", "rank = 1", "(rank", "rank < 1 < 2", "'open", "rank @ 1", "[1, 2"] {
            let err = Expression::parse(bad).unwrap_err();
            assert!(
                matches!(err, KernelError::InvalidDependency(_)),
                "expected parse error for {bad:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let nested = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(Expression::parse(&nested(MAX_NESTING)).is_ok());

        for bad in [
            nested(200_000),
            format!("{}rank", "not ".repeat(200_000)),
            format!("{}1{}", "[".repeat(200_000), "]".repeat(200_000)),
        ] {
            let err = Expression::parse(&bad).unwrap_err();
            assert!(matches!(err, KernelError::InvalidDependency(msg) if msg.contains("too deeply")));
        }
    }

    #[test]
    fn long_chains_evaluate_without_nesting() {
        let p = props(&[("rank", json!(3))]);
        let all = vec!["rank > 0"; 100_000].join(" and ");
        assert!(eval(&all, &p));
        let any = format!("{} or rank == 3", vec!["rank < 0"; 100_000].join(" or "));
        assert!(eval(&any, &p));
    }

    #[test]
    fn source_is_preserved() {
        let e = Expression::parse("rank == 1").unwrap();
        assert_eq!(e.source(), "rank == 1");
    }
}
