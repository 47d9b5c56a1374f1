//! Formula expressions.
//!
//! A formula is a small expression over the row's own fields
//! (`field('Name')`), fields of linked rows (`lookup('Link', 'Target')`),
//! literals, arithmetic and a handful of functions. Evaluation never fails:
//! anything that cannot be computed yields null.

use std::fmt;

use serde_json::Value as JsonValue;

use crate::{StorageDatetime, TableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Concat,
    Upper,
    Lower,
    Totext,
    Sum,
    Count,
    Join,
    Now,
    Today,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "concat" => Function::Concat,
            "upper" => Function::Upper,
            "lower" => Function::Lower,
            "totext" => Function::Totext,
            "sum" => Function::Sum,
            "count" => Function::Count,
            "join" => Function::Join,
            "now" => Function::Now,
            "today" => Function::Today,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Function::Concat => "concat",
            Function::Upper => "upper",
            Function::Lower => "lower",
            Function::Totext => "totext",
            Function::Sum => "sum",
            Function::Count => "count",
            Function::Join => "join",
            Function::Now => "now",
            Function::Today => "today",
        }
    }

    fn arity(self) -> (usize, usize) {
        match self {
            Function::Concat => (1, usize::MAX),
            Function::Upper | Function::Lower | Function::Totext => (1, 1),
            Function::Sum | Function::Count => (1, 1),
            Function::Join => (1, 2),
            Function::Now | Function::Today => (0, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Bool(bool),
    Field(String),
    Lookup { via: String, target: String },
    Call { function: Function, args: Vec<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Neg(Box<Expr>),
}

/// A field name a formula reads.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FormulaReference {
    /// A field of the same table.
    Field(String),
    /// `target` of the rows linked through the link field `via`.
    Lookup { via: String, target: String },
}

/// Values a formula can read while being evaluated for one row.
pub trait FormulaContext {
    /// Rendered value of a field of the current row.
    fn field(&self, name: &str) -> JsonValue;
    /// Rendered values of `target` on the linked rows, in link order.
    fn lookup(&self, via: &str, target: &str) -> JsonValue;
    fn now(&self) -> &StorageDatetime;
}

pub fn parse(source: &str) -> Result<Expr, TableError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(TableError::InvalidFormula(format!(
            "unexpected {} at the end of the formula",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

impl Expr {
    pub fn references(&self) -> Vec<FormulaReference> {
        let mut out = Vec::new();
        self.walk(&mut |expr| match expr {
            Expr::Field(name) => out.push(FormulaReference::Field(name.clone())),
            Expr::Lookup { via, target } => out.push(FormulaReference::Lookup {
                via: via.clone(),
                target: target.clone(),
            }),
            _ => {}
        });
        out.sort();
        out.dedup();
        out
    }

    /// Whether the value changes with the passage of time alone.
    pub fn uses_now(&self) -> bool {
        let mut found = false;
        self.walk(&mut |expr| {
            if let Expr::Call {
                function: Function::Now | Function::Today,
                ..
            } = expr
            {
                found = true;
            }
        });
        found
    }

    /// Point references to the field `old` (including lookups through it) at `new`.
    pub fn rename_field(&mut self, old: &str, new: &str) -> bool {
        let mut changed = false;
        self.walk_mut(&mut |expr| match expr {
            Expr::Field(name) if name == old => {
                *name = new.to_string();
                changed = true;
            }
            Expr::Lookup { via, .. } if via == old => {
                *via = new.to_string();
                changed = true;
            }
            _ => {}
        });
        changed
    }

    /// Point lookups of `old` through the link field `via` at `new`.
    pub fn rename_lookup_target(&mut self, link: &str, old: &str, new: &str) -> bool {
        let mut changed = false;
        self.walk_mut(&mut |expr| {
            if let Expr::Lookup { via, target } = expr {
                if via == link && target == old {
                    *target = new.to_string();
                    changed = true;
                }
            }
        });
        changed
    }

    pub fn evaluate(&self, ctx: &dyn FormulaContext) -> JsonValue {
        match self {
            Expr::Number(n) => number_json(*n),
            Expr::Text(s) => JsonValue::String(s.clone()),
            Expr::Bool(b) => JsonValue::Bool(*b),
            Expr::Field(name) => ctx.field(name),
            Expr::Lookup { via, target } => ctx.lookup(via, target),
            Expr::Neg(inner) => match to_number(&inner.evaluate(ctx)) {
                Some(n) => number_json(-n),
                None => JsonValue::Null,
            },
            Expr::Binary { op, left, right } => {
                let (Some(a), Some(b)) = (
                    to_number(&left.evaluate(ctx)),
                    to_number(&right.evaluate(ctx)),
                ) else {
                    return JsonValue::Null;
                };
                match op {
                    BinaryOp::Add => number_json(a + b),
                    BinaryOp::Sub => number_json(a - b),
                    BinaryOp::Mul => number_json(a * b),
                    BinaryOp::Div if b == 0.0 => JsonValue::Null,
                    BinaryOp::Div => number_json(a / b),
                }
            }
            Expr::Call { function, args } => call(*function, args, ctx),
        }
    }

    fn walk(&self, visit: &mut dyn FnMut(&Expr)) {
        visit(self);
        match self {
            Expr::Call { args, .. } => args.iter().for_each(|a| a.walk(visit)),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Neg(inner) => inner.walk(visit),
            _ => {}
        }
    }

    fn walk_mut(&mut self, visit: &mut dyn FnMut(&mut Expr)) {
        visit(self);
        match self {
            Expr::Call { args, .. } => args.iter_mut().for_each(|a| a.walk_mut(visit)),
            Expr::Binary { left, right, .. } => {
                left.walk_mut(visit);
                right.walk_mut(visit);
            }
            Expr::Neg(inner) => inner.walk_mut(visit),
            _ => {}
        }
    }
}

fn call(function: Function, args: &[Expr], ctx: &dyn FormulaContext) -> JsonValue {
    let values: Vec<JsonValue> = args.iter().map(|a| a.evaluate(ctx)).collect();
    let first = values.first().unwrap_or(&JsonValue::Null);
    match function {
        Function::Concat => JsonValue::String(values.iter().map(to_text).collect()),
        Function::Upper => JsonValue::String(to_text(first).to_uppercase()),
        Function::Lower => JsonValue::String(to_text(first).to_lowercase()),
        Function::Totext => JsonValue::String(to_text(first)),
        Function::Sum => match first {
            JsonValue::Array(items) => number_json(items.iter().filter_map(to_number).sum()),
            JsonValue::Null => number_json(0.0),
            other => to_number(other).map(number_json).unwrap_or(JsonValue::Null),
        },
        Function::Count => match first {
            JsonValue::Array(items) => JsonValue::from(items.len()),
            JsonValue::Null => JsonValue::from(0),
            _ => JsonValue::from(1),
        },
        Function::Join => {
            let separator = values.get(1).map(to_text).unwrap_or_else(|| ", ".to_string());
            match first {
                JsonValue::Array(items) => JsonValue::String(
                    items
                        .iter()
                        .map(to_text)
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join(&separator),
                ),
                other => JsonValue::String(to_text(other)),
            }
        }
        Function::Now => JsonValue::String(ctx.now().to_rfc3339()),
        Function::Today => JsonValue::String(ctx.now().inner().format("%Y-%m-%d").to_string()),
    }
}

/// Numbers without a fractional part are emitted as integers.
pub fn number_json(n: f64) -> JsonValue {
    if !n.is_finite() {
        return JsonValue::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return JsonValue::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

pub fn to_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Plain text rendering of a rendered cell value.
pub fn to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => match number_json(f) {
                JsonValue::Number(m) => m.to_string(),
                _ => n.to_string(),
            },
            _ => n.to_string(),
        },
        JsonValue::Array(items) => items
            .iter()
            .map(to_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Object(map) => match map.get("value") {
            Some(inner) => to_text(inner),
            None => value.to_string(),
        },
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => match number_json(*n) {
                JsonValue::Null => write!(f, "{}", n),
                json => write!(f, "{}", json),
            },
            Expr::Text(s) => write!(f, "{}", quote(s)),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Field(name) => write!(f, "field({})", quote(name)),
            Expr::Lookup { via, target } => {
                write!(f, "lookup({}, {})", quote(via), quote(target))
            }
            Expr::Call { function, args } => {
                write!(f, "{}(", function.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::Neg(inner) => write!(f, "-{}", inner),
        }
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Op(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {}", n),
            Token::Str(s) => write!(f, "text {}", quote(s)),
            Token::Ident(name) => write!(f, "name {}", name),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
            Token::Op(c) => write!(f, "'{}'", c),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, TableError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '\'' | '"' => {
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(TableError::InvalidFormula(
                                "unterminated text literal".to_string(),
                            ));
                        }
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(q) if *q == c => {
                            i += 1;
                            break;
                        }
                        Some(other) => {
                            text.push(*other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let n = literal.parse::<f64>().map_err(|_| {
                    TableError::InvalidFormula(format!("invalid number {}", literal))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(TableError::InvalidFormula(format!(
                    "unexpected character {:?}",
                    other
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
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

    fn expect(&mut self, expected: Token) -> Result<(), TableError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(TableError::InvalidFormula(format!(
                "expected {}, found {}",
                expected, token
            ))),
            None => Err(TableError::InvalidFormula(format!(
                "expected {}, found the end of the formula",
                expected
            ))),
        }
    }

    fn expression(&mut self) -> Result<Expr, TableError> {
        let mut left = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' { BinaryOp::Add } else { BinaryOp::Sub };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, TableError> {
        let mut left = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/'))) = self.peek() {
            let op = if *c == '*' { BinaryOp::Mul } else { BinaryOp::Div };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, TableError> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, TableError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Text(s)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let lowered = name.to_ascii_lowercase();
                if lowered == "true" || lowered == "false" {
                    return Ok(Expr::Bool(lowered == "true"));
                }
                self.expect(Token::LParen)?;
                let args = self.arguments()?;
                self.call(&name, args)
            }
            Some(token) => Err(TableError::InvalidFormula(format!("unexpected {}", token))),
            None => Err(TableError::InvalidFormula(
                "unexpected end of the formula".to_string(),
            )),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, TableError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(token) => {
                    return Err(TableError::InvalidFormula(format!(
                        "expected ',' or ')', found {}",
                        token
                    )));
                }
                None => {
                    return Err(TableError::InvalidFormula(
                        "unclosed function call".to_string(),
                    ));
                }
            }
        }
    }

    fn call(&self, name: &str, args: Vec<Expr>) -> Result<Expr, TableError> {
        let text_arg = |expr: &Expr| match expr {
            Expr::Text(s) => Ok(s.clone()),
            _ => Err(TableError::InvalidFormula(format!(
                "{} expects field names as text",
                name
            ))),
        };
        match name.to_ascii_lowercase().as_str() {
            "field" => match args.as_slice() {
                [arg] => Ok(Expr::Field(text_arg(arg)?)),
                _ => Err(TableError::InvalidFormula(
                    "field expects exactly one argument".to_string(),
                )),
            },
            "lookup" => match args.as_slice() {
                [via, target] => Ok(Expr::Lookup {
                    via: text_arg(via)?,
                    target: text_arg(target)?,
                }),
                _ => Err(TableError::InvalidFormula(
                    "lookup expects exactly two arguments".to_string(),
                )),
            },
            _ => {
                let function = Function::from_name(name).ok_or_else(|| {
                    TableError::InvalidFormula(format!("unknown function {}", name))
                })?;
                let (min, max) = function.arity();
                if args.len() < min || args.len() > max {
                    return Err(TableError::InvalidFormula(format!(
                        "{} does not accept {} arguments",
                        function.name(),
                        args.len()
                    )));
                }
                Ok(Expr::Call { function, args })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct Ctx {
        fields: HashMap<&'static str, JsonValue>,
        now: StorageDatetime,
    }

    impl FormulaContext for Ctx {
        fn field(&self, name: &str) -> JsonValue {
            self.fields.get(name).cloned().unwrap_or(JsonValue::Null)
        }

        fn lookup(&self, via: &str, target: &str) -> JsonValue {
            if via == "Orders" && target == "Amount" {
                json!([10, 2.5, null])
            } else {
                JsonValue::Null
            }
        }

        fn now(&self) -> &StorageDatetime {
            &self.now
        }
    }

    fn ctx() -> Ctx {
        Ctx {
            fields: HashMap::from([("Price", json!(4)), ("Name", json!("widget"))]),
            now: StorageDatetime::parse("2024-05-06T07:08:09Z").unwrap(),
        }
    }

    #[test]
    fn arithmetic_respects_precedence() {
        let expr = parse("field('Price') * 2 + 1").unwrap();
        assert_eq!(expr.evaluate(&ctx()), json!(9));
        assert_eq!(parse("-(1 + 2) / 2").unwrap().evaluate(&ctx()), json!(-1.5));
        assert_eq!(parse("1 / 0").unwrap().evaluate(&ctx()), JsonValue::Null);
    }

    #[test]
    fn text_functions_and_lookups() {
        let expr = parse("concat(upper(field('Name')), ': ', totext(sum(lookup('Orders', 'Amount'))))")
            .unwrap();
        assert_eq!(expr.evaluate(&ctx()), json!("WIDGET: 12.5"));
        assert_eq!(
            parse("count(lookup('Orders', 'Amount'))").unwrap().evaluate(&ctx()),
            json!(3)
        );
    }

    #[test]
    fn references_and_time_dependence() {
        let expr = parse("concat(field('A'), lookup('L', 'B'), field('A'), today())").unwrap();
        assert_eq!(
            expr.references(),
            vec![
                FormulaReference::Field("A".to_string()),
                FormulaReference::Lookup {
                    via: "L".to_string(),
                    target: "B".to_string()
                },
            ]
        );
        assert!(expr.uses_now());
        assert_eq!(
            parse("today()").unwrap().evaluate(&ctx()),
            json!("2024-05-06")
        );
    }

    #[test]
    fn renaming_rewrites_the_source() {
        let mut expr = parse("field('Old') + lookup('Old', 'x')").unwrap();
        assert!(expr.rename_field("Old", "It's new"));
        let reparsed = parse(&expr.to_string()).unwrap();
        assert_eq!(reparsed, expr);
        assert!(expr.to_string().contains("field('It\\'s new')"));
    }

    #[test]
    fn invalid_formulas_are_rejected() {
        assert!(matches!(parse("field(1)"), Err(TableError::InvalidFormula(_))));
        assert!(matches!(parse("nope()"), Err(TableError::InvalidFormula(_))));
        assert!(matches!(parse("upper('a', 'b')"), Err(TableError::InvalidFormula(_))));
        assert!(matches!(parse("(1 + 2"), Err(TableError::InvalidFormula(_))));
    }
}
