//! Sandboxed expression language used inside `{{ ... }}` placeholders.
//!
//! The grammar is deliberately small: literals, identifiers looked up
//! unqualified in the supplied data, member/index access, arithmetic,
//! comparisons, logical operators and the ternary. Evaluation only reads
//! the data; there is no assignment, call or loop construct.

use serde_json::Value;

use crate::error::{Error, Result};

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Array(Vec<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    And,
    Or,
    Coalesce,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

const PUNCTUATION: [&str; 25] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "??", "<", ">", "+", "-", "*", "/", "%",
    "!", "?", ":", ".", "[", "]", "(", ")", ",",
];

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                i += 1;
                if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| Error::Template(format!("Invalid number literal '{}'", text)))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(Error::Template("Unterminated string literal".to_string()));
                };
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\\' {
                    let Some(&escaped) = chars.get(i) else {
                        return Err(Error::Template("Unterminated string literal".to_string()));
                    };
                    i += 1;
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        other => other,
                    });
                } else {
                    value.push(ch);
                }
            }
            tokens.push(Token::Str(value));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        match PUNCTUATION.iter().find(|p| rest.starts_with(*p)) {
            Some(punct) => {
                tokens.push(Token::Punct(*punct));
                i += punct.len();
            }
            None => {
                return Err(Error::Template(format!(
                    "Unexpected character '{}' in expression",
                    c
                )))
            }
        }
    }

    Ok(tokens)
}

/// Deepest nesting the parser accepts. Deeper input is rejected before it
/// can exhaust the stack.
pub const MAX_EXPR_DEPTH: usize = 128;

/// Parse an expression source into a tree.
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(Error::Template("Empty expression".to_string()));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.conditional()?;
    if let Some(token) = parser.peek() {
        return Err(Error::Template(format!(
            "Unexpected token {:?} in '{}'",
            token, source
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(Error::Template(format!(
                "Expected '{}' but found {:?}",
                punct,
                self.peek()
            )))
        }
    }

    fn descend(&mut self) -> Result<()> {
        if self.depth >= MAX_EXPR_DEPTH {
            return Err(Error::Template("Expression nesting too deep".to_string()));
        }
        self.depth += 1;
        Ok(())
    }

    fn conditional(&mut self) -> Result<Expr> {
        let entered = self.depth;
        self.descend()?;
        let condition = self.binary(0)?;
        let expr = if self.eat("?") {
            let then = self.conditional()?;
            self.expect(":")?;
            let otherwise = self.conditional()?;
            Expr::Conditional(Box::new(condition), Box::new(then), Box::new(otherwise))
        } else {
            condition
        };
        self.depth = entered;
        Ok(expr)
    }

    /// Precedence climbing over the binary operator table.
    fn binary(&mut self, level: usize) -> Result<Expr> {
        const LEVELS: [&[(&str, BinaryOp)]; 7] = [
            &[("??", BinaryOp::Coalesce)],
            &[("||", BinaryOp::Or)],
            &[("&&", BinaryOp::And)],
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNe),
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::Ne),
            ],
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Rem),
            ],
        ];

        if level == LEVELS.len() {
            return self.unary();
        }

        let mut left = self.binary(level + 1)?;
        let entered = self.depth;
        'outer: loop {
            for (punct, op) in LEVELS[level] {
                if self.eat(punct) {
                    // Each link of a chain nests the tree one level deeper.
                    self.descend()?;
                    let right = self.binary(level + 1)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            self.depth = entered;
            return Ok(left);
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = if self.eat("!") {
            UnaryOp::Not
        } else if self.eat("-") {
            UnaryOp::Neg
        } else if self.eat("+") {
            UnaryOp::Plus
        } else {
            return self.postfix();
        };
        self.descend()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        let entered = self.depth;
        loop {
            if self.eat(".") {
                self.descend()?;
                match self.next() {
                    Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                    other => {
                        return Err(Error::Template(format!(
                            "Expected property name after '.', found {:?}",
                            other
                        )))
                    }
                }
            } else if self.eat("[") {
                self.descend()?;
                let index = self.conditional()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                self.depth = entered;
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Ident(name),
            }),
            Some(Token::Punct("(")) => {
                let inner = self.conditional()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => {
                let mut items = Vec::new();
                if !self.eat("]") {
                    loop {
                        items.push(self.conditional()?);
                        if self.eat("]") {
                            break;
                        }
                        self.expect(",")?;
                    }
                }
                Ok(Expr::Array(items))
            }
            other => Err(Error::Template(format!("Unexpected token {:?}", other))),
        }
    }
}

impl Expr {
    /// Evaluate against `data`, whose top-level properties are in scope.
    pub fn evaluate(&self, data: &Value) -> Result<Value> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => data
                .as_object()
                .and_then(|obj| obj.get(name))
                .cloned()
                .ok_or_else(|| Error::Template(format!("{} is not defined", name))),
            Expr::Array(items) => items
                .iter()
                .map(|item| item.evaluate(data))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Member(target, name) => {
                let target = target.evaluate(data)?;
                property(&target, name)
            }
            Expr::Index(target, index) => {
                let target = target.evaluate(data)?;
                let index = index.evaluate(data)?;
                match (&target, &index) {
                    (Value::Array(items), Value::Number(n)) => Ok(n
                        .as_f64()
                        .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                        .and_then(|f| items.get(f as usize))
                        .cloned()
                        .unwrap_or(Value::Null)),
                    (Value::String(s), Value::Number(n)) => Ok(n
                        .as_f64()
                        .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                        .and_then(|f| s.chars().nth(f as usize))
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Null)),
                    _ => property(&target, &to_display(&index)),
                }
            }
            Expr::Unary(op, operand) => {
                let value = operand.evaluate(data)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!is_truthy(&value)),
                    UnaryOp::Neg => number_value(-to_number(&value)),
                    UnaryOp::Plus => number_value(to_number(&value)),
                })
            }
            Expr::Binary(op, left, right) => match op {
                BinaryOp::And => {
                    let left = left.evaluate(data)?;
                    if is_truthy(&left) {
                        right.evaluate(data)
                    } else {
                        Ok(left)
                    }
                }
                BinaryOp::Or => {
                    let left = left.evaluate(data)?;
                    if is_truthy(&left) {
                        Ok(left)
                    } else {
                        right.evaluate(data)
                    }
                }
                BinaryOp::Coalesce => {
                    let left = left.evaluate(data)?;
                    if left.is_null() {
                        right.evaluate(data)
                    } else {
                        Ok(left)
                    }
                }
                _ => {
                    let left = left.evaluate(data)?;
                    let right = right.evaluate(data)?;
                    Ok(apply_binary(*op, &left, &right))
                }
            },
            Expr::Conditional(condition, then, otherwise) => {
                if is_truthy(&condition.evaluate(data)?) {
                    then.evaluate(data)
                } else {
                    otherwise.evaluate(data)
                }
            }
        }
    }
}

fn property(target: &Value, name: &str) -> Result<Value> {
    match target {
        Value::Null => Err(Error::Template(format!(
            "Cannot read properties of null (reading '{}')",
            name
        ))),
        Value::Object(obj) => Ok(obj.get(name).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if name == "length" => Ok(Value::from(items.len())),
        Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
        _ => Ok(Value::Null),
    }
}

fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => {
            if is_numeric_like(left) && is_numeric_like(right) {
                number_value(to_number(left) + to_number(right))
            } else {
                Value::String(format!("{}{}", to_display(left), to_display(right)))
            }
        }
        BinaryOp::Sub => number_value(to_number(left) - to_number(right)),
        BinaryOp::Mul => number_value(to_number(left) * to_number(right)),
        BinaryOp::Div => number_value(to_number(left) / to_number(right)),
        BinaryOp::Rem => number_value(to_number(left) % to_number(right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => to_number(left).partial_cmp(&to_number(right)),
            };
            let Some(ordering) = ordering else {
                return Value::Bool(false);
            };
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinaryOp::StrictEq => Value::Bool(strict_equals(left, right)),
        BinaryOp::StrictNe => Value::Bool(!strict_equals(left, right)),
        BinaryOp::Eq => Value::Bool(loose_equals(left, right)),
        BinaryOp::Ne => Value::Bool(!loose_equals(left, right)),
        BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => unreachable!("short-circuit ops"),
    }
}

fn is_numeric_like(value: &Value) -> bool {
    matches!(value, Value::Number(_) | Value::Bool(_) | Value::Null)
}

fn strict_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(_), Value::String(_)) => left == right,
        (Value::Number(_) | Value::Bool(_) | Value::String(_), Value::Number(_) | Value::Bool(_))
        | (Value::Number(_) | Value::Bool(_), Value::String(_)) => {
            to_number(left) == to_number(right)
        }
        _ => strict_equals(left, right),
    }
}

/// JavaScript-style truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Numeric conversion; `NaN` when the value has no numeric reading.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Build a JSON number, preferring the integer form. Non-finite values become null.
pub fn number_value(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// String form used for interpolation.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            // Integral floats print without a fraction, like JS `String(n)`.
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e21 => {
                if f == 0.0 {
                    "0".to_string()
                } else {
                    format!("{}", f)
                }
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}
