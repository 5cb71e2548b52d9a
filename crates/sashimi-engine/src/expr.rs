//! Safe filter-expression engine.
//!
//! User-supplied filter strings are parsed into a closed syntax tree,
//! validated against an [`EvalModel`] whitelist, and evaluated per record
//! with the record's fields as the only name binding. Nothing in the host is
//! reachable from an expression: the evaluator knows a fixed set of node
//! kinds, four string attributes and two free functions, and everything else
//! is rejected at compile time.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::Config;
use crate::error::EngineError;

/// Node kinds admissible without calls or attribute access.
const BASE_NODES: &[&str] = &[
    "literal",
    "name",
    "list",
    "arith",
    "neg",
    "compare",
    "membership",
    "bool",
    "not",
];

const DEFAULT_ATTRIBUTES: &[&str] = &["startswith", "endswith", "upper", "lower"];
const DEFAULT_FUNCTIONS: &[&str] = &["int", "round"];

/// Whitelist of syntactic constructs admissible in a user expression.
#[derive(Debug, Clone, Default)]
pub struct EvalModel {
    nodes: HashSet<String>,
    attributes: HashSet<String>,
    functions: HashSet<String>,
}

impl EvalModel {
    /// Comparisons, boolean ops, membership, literals, arithmetic. No
    /// attribute access, no calls.
    pub fn base() -> Self {
        let mut model = Self::empty();
        model.allow_nodes(BASE_NODES.iter().copied());
        model
    }

    /// The `base` model plus call and attribute nodes with the stock
    /// whitelists (`startswith`/`endswith`/`upper`/`lower`, `int`/`round`).
    pub fn default_model() -> Self {
        let mut model = Self::base();
        model.allow_nodes(["call", "attribute"]);
        model.allow_attributes(DEFAULT_ATTRIBUTES.iter().copied());
        model.allow_functions(DEFAULT_FUNCTIONS.iter().copied());
        model
    }

    /// A model that admits nothing until extended.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn allow_nodes<I, S>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.extend(nodes.into_iter().map(Into::into));
    }

    pub fn allow_attributes<I, S>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .extend(attributes.into_iter().map(Into::into));
    }

    pub fn allow_functions<I, S>(&mut self, functions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.functions.extend(functions.into_iter().map(Into::into));
    }

    pub fn allows_node(&self, kind: &str) -> bool {
        self.nodes.contains(kind)
    }

    pub fn allows_attribute(&self, name: &str) -> bool {
        self.attributes.contains(name)
    }

    pub fn allows_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }
}

/// Builds the process-wide model from the master config: `model` selects a
/// preset (`base`, `default`, `custom`, `extended`) and the `nodes`,
/// `attributes` and `functions` lists extend `custom`/`extended`.
pub fn model_from_config(config: &Config) -> Result<EvalModel, EngineError> {
    let name = config.get_str("model").unwrap_or("default");
    let mut model = match name {
        "base" => return Ok(EvalModel::base()),
        "default" => return Ok(EvalModel::default_model()),
        "custom" => EvalModel::empty(),
        "extended" => EvalModel::default_model(),
        other => {
            return Err(EngineError::bad_input(format!(
                "unknown expression model {other:?}, expected base/default/custom/extended"
            )))
        }
    };
    model.allow_nodes(config.get_string_list("nodes"));
    model.allow_attributes(config.get_string_list("attributes"));
    model.allow_functions(config.get_string_list("functions"));
    Ok(model)
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("node kind {0:?} is not allowed by the active model")]
    NodeNotAllowed(&'static str),
    #[error("attribute {0:?} is not allowed by the active model")]
    AttributeNotAllowed(String),
    #[error("function {0:?} is not allowed by the active model")]
    FunctionNotAllowed(String),
}

/// Per-record evaluation failure. Counted by the dataset engine, never
/// fatal to a search.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct EvalError(pub String);

fn eval_err(message: impl Into<String>) -> EvalError {
    EvalError(message.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    fn is_membership(self) -> bool {
        matches!(self, CmpOp::In | CmpOp::NotIn)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Bool {
        op: BoolOp,
        operands: Vec<Expr>,
    },
    Compare {
        first: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
    Method {
        recv: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
}

/// A validated, reusable expression. Compile once per request, evaluate per
/// record.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    ast: Expr,
}

impl CompiledExpr {
    pub fn compile(src: &str, model: &EvalModel) -> Result<Self, CompileError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_expr()?;
        parser.expect_end()?;
        validate(&ast, model)?;
        Ok(Self { ast })
    }

    /// Evaluates with the record's fields as the name binding. Records that
    /// are not JSON objects cannot bind names and fail per record.
    pub fn eval(&self, record: &Value) -> Result<Value, EvalError> {
        let binding = record
            .as_object()
            .ok_or_else(|| eval_err("record is not an object"))?;
        eval_expr(&self.ast, binding)
    }
}

/// Python-style truthiness: null, false, zero, and empty containers are
/// falsy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn tokenize(src: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '0'..='9' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let mut is_float = false;
                if chars.peek() == Some(&'.') {
                    is_float = true;
                    text.push('.');
                    chars.next();
                    while let Some(&d) = chars.peek() {
                        if d.is_ascii_digit() {
                            text.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                if matches!(chars.peek(), Some('e') | Some('E')) {
                    is_float = true;
                    text.push('e');
                    chars.next();
                    if let Some(&sign @ ('+' | '-')) = chars.peek() {
                        text.push(sign);
                        chars.next();
                    }
                    let mut saw_digit = false;
                    while let Some(&d) = chars.peek() {
                        if d.is_ascii_digit() {
                            saw_digit = true;
                            text.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if !saw_digit {
                        return Err(CompileError::Parse(format!(
                            "invalid number literal {text:?}"
                        )));
                    }
                }
                if is_float {
                    let value: f64 = text
                        .parse()
                        .map_err(|_| CompileError::Parse(format!("invalid number {text:?}")))?;
                    tokens.push(Token::Float(value));
                } else {
                    match text.parse::<i64>() {
                        Ok(value) => tokens.push(Token::Int(value)),
                        // Integers beyond i64 degrade to floats.
                        Err(_) => {
                            let value: f64 = text.parse().map_err(|_| {
                                CompileError::Parse(format!("invalid number {text:?}"))
                            })?;
                            tokens.push(Token::Float(value));
                        }
                    }
                }
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut name = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        name.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(name));
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(CompileError::Parse("unterminated string literal".into()))
                        }
                        Some(ch) if ch == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some('r') => text.push('\r'),
                            Some('\\') => text.push('\\'),
                            Some('\'') => text.push('\''),
                            Some('"') => text.push('"'),
                            Some('/') => text.push('/'),
                            Some('u') => {
                                let mut code = String::new();
                                for _ in 0..4 {
                                    match chars.next() {
                                        Some(h) if h.is_ascii_hexdigit() => code.push(h),
                                        _ => {
                                            return Err(CompileError::Parse(
                                                "invalid \\u escape in string literal".into(),
                                            ))
                                        }
                                    }
                                }
                                match u32::from_str_radix(&code, 16)
                                    .ok()
                                    .and_then(char::from_u32)
                                {
                                    Some(ch) => text.push(ch),
                                    None => {
                                        return Err(CompileError::Parse(
                                            "invalid \\u escape in string literal".into(),
                                        ))
                                    }
                                }
                            }
                            other => {
                                return Err(CompileError::Parse(format!(
                                    "unknown escape {other:?} in string literal"
                                )))
                            }
                        },
                        Some(ch) => text.push(ch),
                    }
                }
                tokens.push(Token::Str(text));
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    return Err(CompileError::Parse(
                        "single '=' is not a comparison, use '=='".into(),
                    ));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    return Err(CompileError::Parse("unexpected character '!'".into()));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            other => {
                return Err(CompileError::Parse(format!(
                    "unexpected character {other:?}"
                )))
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
//
// Precedence, loosest first: or, and, not, comparison/membership (chained),
// additive, multiplicative, unary minus, postfix method call, primary.

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, context: &str) -> Result<(), CompileError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(CompileError::Parse(format!(
                "expected {expected:?} {context}, found {:?}",
                self.peek()
            )))
        }
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == word)
    }

    fn expect_end(&self) -> Result<(), CompileError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(CompileError::Parse(format!(
                "unexpected trailing input at {token:?}"
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let first = self.parse_and()?;
        if !self.at_keyword("or") {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.at_keyword("or") {
            self.pos += 1;
            operands.push(self.parse_and()?);
        }
        Ok(Expr::Bool {
            op: BoolOp::Or,
            operands,
        })
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let first = self.parse_not()?;
        if !self.at_keyword("and") {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.at_keyword("and") {
            self.pos += 1;
            operands.push(self.parse_not()?);
        }
        Ok(Expr::Bool {
            op: BoolOp::And,
            operands,
        })
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        if self.at_keyword("not") {
            self.pos += 1;
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let first = self.parse_additive()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            let right = self.parse_additive()?;
            rest.push((op, right));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    /// Consumes and returns the next comparison operator, if one is next.
    /// `not in` spans two tokens.
    fn comparison_op(&mut self) -> Option<CmpOp> {
        let (op, width) = match self.peek()? {
            Token::Eq => (CmpOp::Eq, 1),
            Token::Ne => (CmpOp::Ne, 1),
            Token::Lt => (CmpOp::Lt, 1),
            Token::Le => (CmpOp::Le, 1),
            Token::Gt => (CmpOp::Gt, 1),
            Token::Ge => (CmpOp::Ge, 1),
            Token::Ident(name) if name == "in" => (CmpOp::In, 1),
            Token::Ident(name) if name == "not" => {
                if matches!(self.peek_at(1), Some(Token::Ident(next)) if next == "in") {
                    (CmpOp::NotIn, 2)
                } else {
                    return None;
                }
            }
            _ => return None,
        };
        self.pos += width;
        Some(op)
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                Some(Token::Percent) => ArithOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        while self.eat(&Token::Dot) {
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                other => {
                    return Err(CompileError::Parse(format!(
                        "expected attribute name after '.', found {other:?}"
                    )))
                }
            };
            self.expect(&Token::LParen, "after attribute name")?;
            let args = self.parse_args()?;
            expr = Expr::Method {
                recv: Box::new(expr),
                name,
                args,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        match self.advance() {
            Some(Token::Int(value)) => Ok(Expr::Literal(Value::from(value))),
            Some(Token::Float(value)) => Ok(Expr::Literal(Value::from(value))),
            Some(Token::Str(value)) => Ok(Expr::Literal(Value::from(value))),
            Some(Token::Ident(name)) => match name.as_str() {
                "True" => Ok(Expr::Literal(Value::Bool(true))),
                "False" => Ok(Expr::Literal(Value::Bool(false))),
                "None" => Ok(Expr::Literal(Value::Null)),
                "and" | "or" | "not" | "in" => Err(CompileError::Parse(format!(
                    "unexpected keyword {name:?}"
                ))),
                _ => {
                    if self.eat(&Token::LParen) {
                        let args = self.parse_args()?;
                        Ok(Expr::Call { func: name, args })
                    } else {
                        Ok(Expr::Name(name))
                    }
                }
            },
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_expr()?);
                    if self.eat(&Token::Comma) {
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        continue;
                    }
                    self.expect(&Token::RBracket, "to close list literal")?;
                    break;
                }
                Ok(Expr::List(items))
            }
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen, "to close group")?;
                Ok(expr)
            }
            other => Err(CompileError::Parse(format!(
                "unexpected token {other:?}"
            ))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen, "to close argument list")?;
            break;
        }
        Ok(args)
    }
}

// ---------------------------------------------------------------------------
// Validation

fn validate(expr: &Expr, model: &EvalModel) -> Result<(), CompileError> {
    let need = |kind: &'static str| -> Result<(), CompileError> {
        if model.allows_node(kind) {
            Ok(())
        } else {
            Err(CompileError::NodeNotAllowed(kind))
        }
    };

    match expr {
        Expr::Literal(_) => need("literal"),
        Expr::Name(_) => need("name"),
        Expr::List(items) => {
            need("list")?;
            for item in items {
                validate(item, model)?;
            }
            Ok(())
        }
        Expr::Neg(operand) => {
            need("neg")?;
            validate(operand, model)
        }
        Expr::Not(operand) => {
            need("not")?;
            validate(operand, model)
        }
        Expr::Arith { left, right, .. } => {
            need("arith")?;
            validate(left, model)?;
            validate(right, model)
        }
        Expr::Bool { operands, .. } => {
            need("bool")?;
            for operand in operands {
                validate(operand, model)?;
            }
            Ok(())
        }
        Expr::Compare { first, rest } => {
            validate(first, model)?;
            for (op, operand) in rest {
                if op.is_membership() {
                    need("membership")?;
                } else {
                    need("compare")?;
                }
                validate(operand, model)?;
            }
            Ok(())
        }
        Expr::Call { func, args } => {
            need("call")?;
            if !model.allows_function(func) {
                return Err(CompileError::FunctionNotAllowed(func.clone()));
            }
            for arg in args {
                validate(arg, model)?;
            }
            Ok(())
        }
        Expr::Method { recv, name, args } => {
            need("call")?;
            need("attribute")?;
            if !model.allows_attribute(name) {
                return Err(CompileError::AttributeNotAllowed(name.clone()));
            }
            validate(recv, model)?;
            for arg in args {
                validate(arg, model)?;
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn num_of(value: &Value) -> Option<Num> {
    match value {
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        Value::Number(n) => n
            .as_i64()
            .map(Num::Int)
            .or_else(|| n.as_f64().map(Num::Float)),
        _ => None,
    }
}

fn float_value(f: f64) -> Result<Value, EvalError> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| eval_err("result is not a finite number"))
}

fn eval_expr(expr: &Expr, binding: &Map<String, Value>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name(name) => binding
            .get(name)
            .cloned()
            .ok_or_else(|| eval_err(format!("name {name:?} is not defined"))),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_expr(item, binding)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Neg(operand) => {
            let value = eval_expr(operand, binding)?;
            match num_of(&value) {
                Some(Num::Int(i)) => i
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| eval_err("integer overflow")),
                Some(Num::Float(f)) => float_value(-f),
                None => Err(eval_err(format!(
                    "bad operand type for unary -: {}",
                    type_name(&value)
                ))),
            }
        }
        Expr::Not(operand) => {
            let value = eval_expr(operand, binding)?;
            Ok(Value::Bool(!truthy(&value)))
        }
        Expr::Arith { op, left, right } => {
            let a = eval_expr(left, binding)?;
            let b = eval_expr(right, binding)?;
            arith(*op, &a, &b)
        }
        Expr::Bool { op, operands } => {
            for operand in operands {
                let value = eval_expr(operand, binding)?;
                match op {
                    BoolOp::And if !truthy(&value) => return Ok(Value::Bool(false)),
                    BoolOp::Or if truthy(&value) => return Ok(Value::Bool(true)),
                    _ => {}
                }
            }
            Ok(Value::Bool(matches!(op, BoolOp::And)))
        }
        Expr::Compare { first, rest } => {
            let mut prev = eval_expr(first, binding)?;
            for (op, operand) in rest {
                let current = eval_expr(operand, binding)?;
                if !compare(*op, &prev, &current)? {
                    return Ok(Value::Bool(false));
                }
                prev = current;
            }
            Ok(Value::Bool(true))
        }
        Expr::Call { func, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, binding)?);
            }
            call_function(func, &values)
        }
        Expr::Method { recv, name, args } => {
            let receiver = eval_expr(recv, binding)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, binding)?);
            }
            call_method(&receiver, name, &values)
        }
    }
}

fn arith(op: ArithOp, a: &Value, b: &Value) -> Result<Value, EvalError> {
    if let (Some(x), Some(y)) = (num_of(a), num_of(b)) {
        return match (op, x, y) {
            (ArithOp::Add, Num::Int(i), Num::Int(j)) => i
                .checked_add(j)
                .map(Value::from)
                .ok_or_else(|| eval_err("integer overflow")),
            (ArithOp::Sub, Num::Int(i), Num::Int(j)) => i
                .checked_sub(j)
                .map(Value::from)
                .ok_or_else(|| eval_err("integer overflow")),
            (ArithOp::Mul, Num::Int(i), Num::Int(j)) => i
                .checked_mul(j)
                .map(Value::from)
                .ok_or_else(|| eval_err("integer overflow")),
            (ArithOp::Mod, Num::Int(i), Num::Int(j)) => {
                if j == 0 {
                    Err(eval_err("integer modulo by zero"))
                } else {
                    Ok(Value::from(i.rem_euclid(j)))
                }
            }
            // Division always yields a float; any mixed pair degrades to
            // float arithmetic.
            (ArithOp::Div, x, y) => {
                let divisor = y.as_f64();
                if divisor == 0.0 {
                    Err(eval_err("division by zero"))
                } else {
                    float_value(x.as_f64() / divisor)
                }
            }
            (ArithOp::Mod, x, y) => {
                let divisor = y.as_f64();
                if divisor == 0.0 {
                    Err(eval_err("float modulo by zero"))
                } else {
                    let quotient = x.as_f64() / divisor;
                    float_value(x.as_f64() - divisor * quotient.floor())
                }
            }
            (ArithOp::Add, x, y) => float_value(x.as_f64() + y.as_f64()),
            (ArithOp::Sub, x, y) => float_value(x.as_f64() - y.as_f64()),
            (ArithOp::Mul, x, y) => float_value(x.as_f64() * y.as_f64()),
        };
    }

    match (op, a, b) {
        (ArithOp::Add, Value::String(x), Value::String(y)) => {
            let mut joined = String::with_capacity(x.len() + y.len());
            joined.push_str(x);
            joined.push_str(y);
            Ok(Value::String(joined))
        }
        (ArithOp::Add, Value::Array(x), Value::Array(y)) => {
            let mut joined = x.clone();
            joined.extend(y.iter().cloned());
            Ok(Value::Array(joined))
        }
        _ => Err(eval_err(format!(
            "unsupported operand types for {op}: {} and {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

/// Cross-type equality: numbers compare numerically (so `1 == 1.0`), any
/// other type mismatch is simply unequal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (num_of(a), num_of(b)) {
        return match (x, y) {
            (Num::Int(i), Num::Int(j)) => i == j,
            (x, y) => x.as_f64() == y.as_f64(),
        };
    }
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(i, j)| values_equal(i, j))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => false,
    }
}

fn order_values(a: &Value, b: &Value) -> Result<Ordering, EvalError> {
    if let (Some(x), Some(y)) = (num_of(a), num_of(b)) {
        return x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .ok_or_else(|| eval_err("cannot order NaN"));
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    Err(eval_err(format!(
        "cannot order {} and {}",
        type_name(a),
        type_name(b)
    )))
}

fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match container {
        Value::Array(items) => Ok(items.iter().any(|candidate| values_equal(candidate, item))),
        Value::String(text) => match item {
            Value::String(needle) => Ok(text.contains(needle.as_str())),
            other => Err(eval_err(format!(
                "cannot search for {} in a string",
                type_name(other)
            ))),
        },
        Value::Object(map) => match item {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(eval_err(format!(
                "cannot search for {} in an object",
                type_name(other)
            ))),
        },
        other => Err(eval_err(format!(
            "argument of type {} is not iterable",
            type_name(other)
        ))),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(values_equal(a, b)),
        CmpOp::Ne => Ok(!values_equal(a, b)),
        CmpOp::Lt => Ok(order_values(a, b)? == Ordering::Less),
        CmpOp::Le => Ok(order_values(a, b)? != Ordering::Greater),
        CmpOp::Gt => Ok(order_values(a, b)? == Ordering::Greater),
        CmpOp::Ge => Ok(order_values(a, b)? != Ordering::Less),
        CmpOp::In => contains(b, a),
        CmpOp::NotIn => contains(b, a).map(|found| !found),
    }
}

fn call_function(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "int" => {
            if args.len() != 1 {
                return Err(eval_err("int() takes exactly one argument"));
            }
            match &args[0] {
                Value::Bool(b) => Ok(Value::from(*b as i64)),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(i))
                    } else if let Some(f) = n.as_f64() {
                        let truncated = f.trunc();
                        if truncated >= i64::MIN as f64 && truncated <= i64::MAX as f64 {
                            Ok(Value::from(truncated as i64))
                        } else {
                            Err(eval_err("integer overflow in int()"))
                        }
                    } else {
                        Err(eval_err("int() argument out of range"))
                    }
                }
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| eval_err(format!("invalid literal for int(): {s:?}"))),
                other => Err(eval_err(format!(
                    "int() argument must be a string or a number, not {}",
                    type_name(other)
                ))),
            }
        }
        "round" => {
            if args.is_empty() || args.len() > 2 {
                return Err(eval_err("round() takes one or two arguments"));
            }
            let ndigits = match args.get(1) {
                None => None,
                Some(value) => match value.as_i64() {
                    Some(n) => Some(n as i32),
                    None => {
                        return Err(eval_err(format!(
                            "round() ndigits must be an integer, not {}",
                            type_name(value)
                        )))
                    }
                },
            };
            match num_of(&args[0]) {
                Some(Num::Int(i)) => Ok(Value::from(i)),
                Some(Num::Float(f)) => match ndigits {
                    None => {
                        let rounded = round_half_even(f);
                        if rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64 {
                            Ok(Value::from(rounded as i64))
                        } else {
                            Err(eval_err("integer overflow in round()"))
                        }
                    }
                    Some(n) => {
                        let scale = 10f64.powi(n);
                        float_value(round_half_even(f * scale) / scale)
                    }
                },
                None => Err(eval_err(format!(
                    "round() argument must be a number, not {}",
                    type_name(&args[0])
                ))),
            }
        }
        other => Err(eval_err(format!("unknown function {other:?}"))),
    }
}

/// Banker's rounding, matching Python's `round`.
fn round_half_even(x: f64) -> f64 {
    let truncated = x.trunc();
    let fraction = x - truncated;
    if fraction.abs() == 0.5 {
        if truncated % 2.0 == 0.0 {
            truncated
        } else {
            truncated + x.signum()
        }
    } else {
        x.round()
    }
}

fn call_method(receiver: &Value, name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let text = receiver.as_str().ok_or_else(|| {
        eval_err(format!(
            "{name:?} requires a string, got {}",
            type_name(receiver)
        ))
    })?;
    match name {
        "startswith" | "endswith" => {
            let needle = match args {
                [Value::String(needle)] => needle,
                [other] => {
                    return Err(eval_err(format!(
                        "{name}() argument must be a string, not {}",
                        type_name(other)
                    )))
                }
                _ => return Err(eval_err(format!("{name}() takes exactly one argument"))),
            };
            let matched = if name == "startswith" {
                text.starts_with(needle.as_str())
            } else {
                text.ends_with(needle.as_str())
            };
            Ok(Value::Bool(matched))
        }
        "upper" | "lower" => {
            if !args.is_empty() {
                return Err(eval_err(format!("{name}() takes no arguments")));
            }
            let transformed = if name == "upper" {
                text.to_uppercase()
            } else {
                text.to_lowercase()
            };
            Ok(Value::String(transformed))
        }
        other => Err(eval_err(format!("unknown attribute {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_with(src: &str, record: &Value, model: &EvalModel) -> Result<Value, EvalError> {
        let compiled = CompiledExpr::compile(src, model).expect("compile");
        compiled.eval(record)
    }

    fn eval_default(src: &str, record: &Value) -> Value {
        eval_with(src, record, &EvalModel::default_model()).expect("eval")
    }

    fn product() -> Value {
        json!({
            "id": 6,
            "title": "MacBook Pro",
            "price": 1749,
            "rating": 4.57,
            "brand": "Apple",
            "category": "laptops",
            "tags": ["pro", "laptop"]
        })
    }

    #[test]
    fn literals_and_comparisons() {
        let record = product();
        assert_eq!(eval_default("True", &record), json!(true));
        assert_eq!(eval_default("price > 20", &record), json!(true));
        assert_eq!(eval_default("price == 1749", &record), json!(true));
        assert_eq!(eval_default("brand == 'Apple'", &record), json!(true));
        assert_eq!(eval_default("brand != \"Samsung\"", &record), json!(true));
        assert_eq!(eval_default("rating >= 4.57", &record), json!(true));
        assert_eq!(eval_default("None == None", &record), json!(true));
    }

    #[test]
    fn chained_comparison() {
        let record = product();
        assert_eq!(eval_default("1000 < price < 2000", &record), json!(true));
        assert_eq!(eval_default("1000 < price < 1200", &record), json!(false));
    }

    #[test]
    fn membership() {
        let record = product();
        assert_eq!(
            eval_default("brand in ['Apple', 'Samsung']", &record),
            json!(true)
        );
        assert_eq!(eval_default("'pro' in tags", &record), json!(true));
        assert_eq!(eval_default("'Book' in title", &record), json!(true));
        assert_eq!(eval_default("brand not in ['Sony']", &record), json!(true));
        assert_eq!(eval_default("id in [1, 2, 3]", &record), json!(false));
    }

    #[test]
    fn boolean_connectives() {
        let record = product();
        assert_eq!(
            eval_default("brand == 'Apple' and price < 1000", &record),
            json!(false)
        );
        assert_eq!(
            eval_default("brand == 'Apple' or price < 1000", &record),
            json!(true)
        );
        assert_eq!(eval_default("not price < 1000", &record), json!(true));
    }

    #[test]
    fn arithmetic() {
        let record = product();
        assert_eq!(eval_default("price + 1", &record), json!(1750));
        assert_eq!(eval_default("price - 49", &record), json!(1700));
        assert_eq!(eval_default("2 * 3", &record), json!(6));
        assert_eq!(eval_default("7 % 3", &record), json!(1));
        assert_eq!(eval_default("-7 % 3", &record), json!(2));
        assert_eq!(eval_default("price / 2 == 874.5", &record), json!(true));
        assert_eq!(
            eval_default("brand + ' Inc' == 'Apple Inc'", &record),
            json!(true)
        );
        assert_eq!(eval_default("-price < 0", &record), json!(true));
    }

    #[test]
    fn division_by_zero_is_an_eval_error() {
        let record = product();
        let err = eval_with("price / 0", &record, &EvalModel::default_model()).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn mixed_type_equality_is_false_not_an_error() {
        let record = product();
        assert_eq!(eval_default("brand == 1", &record), json!(false));
        assert_eq!(eval_default("brand != 1", &record), json!(true));
    }

    #[test]
    fn mixed_type_ordering_errors() {
        let record = product();
        let err = eval_with("brand < 1", &record, &EvalModel::default_model()).unwrap_err();
        assert!(err.to_string().contains("cannot order"));
    }

    #[test]
    fn missing_name_is_an_eval_error() {
        let record = product();
        let err = eval_with("SomethingWrong", &record, &EvalModel::default_model()).unwrap_err();
        assert!(err.to_string().contains("is not defined"));
    }

    #[test]
    fn non_object_record_is_an_eval_error() {
        let model = EvalModel::default_model();
        let compiled = CompiledExpr::compile("True", &model).unwrap();
        assert!(compiled.eval(&json!(42)).is_err());
    }

    #[test]
    fn string_attributes() {
        let record = product();
        assert_eq!(eval_default("title.startswith('Mac')", &record), json!(true));
        assert_eq!(eval_default("title.endswith('Pro')", &record), json!(true));
        assert_eq!(
            eval_default("brand.upper() == 'APPLE'", &record),
            json!(true)
        );
        assert_eq!(
            eval_default("brand.lower() == 'apple'", &record),
            json!(true)
        );
    }

    #[test]
    fn attribute_on_non_string_is_an_eval_error() {
        let record = product();
        let err = eval_with("price.upper()", &record, &EvalModel::default_model()).unwrap_err();
        assert!(err.to_string().contains("requires a string"));
    }

    #[test]
    fn int_and_round() {
        let record = product();
        assert_eq!(eval_default("int('12')", &record), json!(12));
        assert_eq!(eval_default("int(4.9)", &record), json!(4));
        assert_eq!(eval_default("int(True)", &record), json!(1));
        assert_eq!(eval_default("round(2.5)", &record), json!(2));
        assert_eq!(eval_default("round(3.5)", &record), json!(4));
        assert_eq!(eval_default("round(-2.5)", &record), json!(-2));
        assert_eq!(eval_default("round(4.57, 1)", &record), json!(4.6));
        assert_eq!(eval_default("round(7)", &record), json!(7));
    }

    #[test]
    fn int_of_garbage_is_an_eval_error() {
        let record = product();
        let err = eval_with("int('1.5')", &record, &EvalModel::default_model()).unwrap_err();
        assert!(err.to_string().contains("invalid literal"));
    }

    #[test]
    fn base_model_rejects_calls_and_attributes() {
        let model = EvalModel::base();
        assert!(matches!(
            CompiledExpr::compile("int(price)", &model),
            Err(CompileError::NodeNotAllowed("call"))
        ));
        assert!(matches!(
            CompiledExpr::compile("title.upper()", &model),
            Err(CompileError::NodeNotAllowed(_))
        ));
        assert!(CompiledExpr::compile("price > 20", &model).is_ok());
    }

    #[test]
    fn default_model_rejects_unknown_functions_and_attributes() {
        let model = EvalModel::default_model();
        assert!(matches!(
            CompiledExpr::compile("open('/etc/passwd')", &model),
            Err(CompileError::FunctionNotAllowed(name)) if name == "open"
        ));
        assert!(matches!(
            CompiledExpr::compile("title.strip()", &model),
            Err(CompileError::AttributeNotAllowed(name)) if name == "strip"
        ));
    }

    #[test]
    fn custom_model_admits_exactly_what_is_listed() {
        let mut model = EvalModel::empty();
        model.allow_nodes(["literal", "name", "compare"]);
        assert!(CompiledExpr::compile("price > 20", &model).is_ok());
        assert!(matches!(
            CompiledExpr::compile("price > 20 and True", &model),
            Err(CompileError::NodeNotAllowed("bool"))
        ));
        assert!(matches!(
            CompiledExpr::compile("brand in ['Apple']", &model),
            Err(CompileError::NodeNotAllowed(_))
        ));
    }

    #[test]
    fn parse_errors_are_reported() {
        let model = EvalModel::default_model();
        assert!(matches!(
            CompiledExpr::compile("price >", &model),
            Err(CompileError::Parse(_))
        ));
        assert!(matches!(
            CompiledExpr::compile("price = 5", &model),
            Err(CompileError::Parse(_))
        ));
        assert!(matches!(
            CompiledExpr::compile("'unterminated", &model),
            Err(CompileError::Parse(_))
        ));
        assert!(matches!(
            CompiledExpr::compile("price > 5 extra", &model),
            Err(CompileError::Parse(_))
        ));
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(0.0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([1])));
        assert!(truthy(&json!(-1)));
    }

    #[test]
    fn escaped_string_literals() {
        let record = json!({"note": "a\"b"});
        assert_eq!(
            eval_default("note == \"a\\\"b\"", &record),
            json!(true)
        );
        assert_eq!(eval_default("'\\u0041' == 'A'", &record), json!(true));
    }
}
