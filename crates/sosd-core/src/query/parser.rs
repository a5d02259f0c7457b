//! Recursive-descent parser for the single-table SELECT dialect.
//!
//! Lexing is delegated to the `sqlparser` tokenizer; the grammar here only
//! covers what telemetry clients send:
//!
//! ```text
//! SELECT [DISTINCT] item, .. FROM table
//!   [WHERE e] [GROUP BY e, ..] [HAVING e]
//!   [ORDER BY e [ASC|DESC], ..] [LIMIT n [OFFSET m]] [;]
//! ```
//!
//! Precedence, loosest first: `OR`, `AND`, `NOT`, equality-like
//! (`= == != <> IS IN LIKE REGEXP BETWEEN`), relational (`< <= > >=`),
//! `+ -`, `* / %`, `||`, unary `- +`.

use std::fmt;

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer, Word};

use super::QueryError;
use super::datum::Datum;

/// Words that can never start a column reference or serve as an implicit alias.
const RESERVED: &[&str] = &[
    "SELECT", "DISTINCT", "ALL", "FROM", "WHERE", "GROUP", "BY", "HAVING", "ORDER", "LIMIT",
    "OFFSET", "AS", "AND", "OR", "NOT", "IN", "IS", "NULL", "LIKE", "REGEXP", "BETWEEN", "CASE",
    "WHEN", "THEN", "ELSE", "END", "ASC", "DESC", "ESCAPE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Concat,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "OR",
            BinaryOp::And => "AND",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Concat => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Minus,
    Plus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Datum),
    /// Unquoted (or bracket/backtick quoted) column reference.
    Column {
        table: Option<String>,
        name: String,
    },
    /// A double-quoted name: a column when one matches, otherwise text.
    QuotedName(String),
    Nested(Box<Expr>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Regexp {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    /// `CAST(expr AS type_name)`; the type name keeps its source spelling.
    Cast {
        expr: Box<Expr>,
        type_name: String,
    },
    Function {
        /// Upper-cased.
        name: String,
        args: Vec<Expr>,
        distinct: bool,
        /// `COUNT(*)`.
        star: bool,
    },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Expr::Literal(Datum::Text(s.into()))
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn function(name: &str, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.to_ascii_uppercase(),
            args,
            distinct: false,
            star: false,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(d) => write!(f, "{d}"),
            Expr::Column {
                table: Some(t),
                name,
            } => write!(f, "{t}.{name}"),
            Expr::Column { table: None, name } => f.write_str(name),
            Expr::QuotedName(n) => write!(f, "\"{}\"", n.replace('"', "\"\"")),
            Expr::Nested(e) => write!(f, "({e})"),
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => write!(f, "NOT {expr}"),
                UnaryOp::Minus => write!(f, "-{expr}"),
                UnaryOp::Plus => write!(f, "+{expr}"),
            },
            Expr::Binary { op, left, right } => write!(f, "{left} {} {right}", op.symbol()),
            Expr::IsNull { expr, negated } => {
                write!(f, "{expr} IS {}NULL", if *negated { "NOT " } else { "" })
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                write!(f, "{expr} {}IN (", if *negated { "NOT " } else { "" })?;
                write_list(f, list)?;
                f.write_str(")")
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(
                f,
                "{expr} {}BETWEEN {low} AND {high}",
                if *negated { "NOT " } else { "" }
            ),
            Expr::Like {
                expr,
                pattern,
                negated,
            } => write!(
                f,
                "{expr} {}LIKE {pattern}",
                if *negated { "NOT " } else { "" }
            ),
            Expr::Regexp {
                expr,
                pattern,
                negated,
            } => write!(
                f,
                "{expr} {}REGEXP {pattern}",
                if *negated { "NOT " } else { "" }
            ),
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                f.write_str("CASE")?;
                if let Some(op) = operand {
                    write!(f, " {op}")?;
                }
                for (when, then) in branches {
                    write!(f, " WHEN {when} THEN {then}")?;
                }
                if let Some(e) = otherwise {
                    write!(f, " ELSE {e}")?;
                }
                f.write_str(" END")
            }
            Expr::Cast { expr, type_name } => write!(f, "CAST({expr} AS {type_name})"),
            Expr::Function {
                name,
                args,
                distinct,
                star,
            } => {
                write!(f, "{name}(")?;
                if *star {
                    f.write_str("*")?;
                } else {
                    if *distinct {
                        f.write_str("DISTINCT ")?;
                    }
                    write_list(f, args)?;
                }
                f.write_str(")")
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, list: &[Expr]) -> fmt::Result {
    for (i, e) in list.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{e}")?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    pub from: String,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

impl Select {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            distinct: false,
            items: Vec::new(),
            from: from.into(),
            filter: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        if self.distinct {
            f.write_str("DISTINCT ")?;
        }
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match item {
                SelectItem::Wildcard => f.write_str("*")?,
                SelectItem::Expr { expr, alias: None } => write!(f, "{expr}")?,
                SelectItem::Expr {
                    expr,
                    alias: Some(a),
                } => write!(f, "{expr} AS \"{}\"", a.replace('"', "\"\""))?,
            }
        }
        write!(f, " FROM {}", self.from)?;
        if let Some(e) = &self.filter {
            write!(f, " WHERE {e}")?;
        }
        if !self.group_by.is_empty() {
            f.write_str(" GROUP BY ")?;
            write_list(f, &self.group_by)?;
        }
        if let Some(e) = &self.having {
            write!(f, " HAVING {e}")?;
        }
        if !self.order_by.is_empty() {
            f.write_str(" ORDER BY ")?;
            for (i, o) in self.order_by.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}{}", o.expr, if o.descending { " DESC" } else { "" })?;
            }
        }
        if let Some(e) = &self.limit {
            write!(f, " LIMIT {e}")?;
        }
        if let Some(e) = &self.offset {
            write!(f, " OFFSET {e}")?;
        }
        Ok(())
    }
}

/// Parse one SELECT statement.
pub fn parse(sql: &str) -> Result<Select, QueryError> {
    let tokens = Tokenizer::new(&GenericDialect {}, sql)
        .tokenize()
        .map_err(|e| QueryError::Syntax(e.to_string()))?;
    let tokens = tokens
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();
    let mut parser = Parser { tokens, pos: 0 };
    let select = parser.parse_select()?;
    while parser.consume(&Token::SemiColon) {}
    if let Some(tok) = parser.peek() {
        return Err(parser.unexpected(tok, "end of statement"));
    }
    Ok(select)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn consume(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), QueryError> {
        if self.consume(expected) {
            Ok(())
        } else {
            Err(self.unexpected_here(&expected.to_string()))
        }
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        self.peek().is_some_and(|t| is_keyword(t, kw))
    }

    fn peek_nth_keyword(&self, n: usize, kw: &str) -> bool {
        self.peek_nth(n).is_some_and(|t| is_keyword(t, kw))
    }

    fn consume_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), QueryError> {
        if self.consume_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected_here(kw))
        }
    }

    fn unexpected(&self, tok: &Token, expected: &str) -> QueryError {
        QueryError::Syntax(format!("expected {expected}, found {tok}"))
    }

    fn unexpected_here(&self, expected: &str) -> QueryError {
        match self.peek() {
            Some(tok) => self.unexpected(tok, expected),
            None => QueryError::Syntax(format!("expected {expected}, found end of input")),
        }
    }

    fn parse_select(&mut self) -> Result<Select, QueryError> {
        self.expect_keyword("SELECT")?;
        let distinct = if self.consume_keyword("DISTINCT") {
            true
        } else {
            self.consume_keyword("ALL");
            false
        };

        let mut items = vec![self.parse_select_item()?];
        while self.consume(&Token::Comma) {
            items.push(self.parse_select_item()?);
        }

        self.expect_keyword("FROM")?;
        let from = self.parse_identifier("table name")?;
        let mut select = Select::new(from);
        select.distinct = distinct;
        select.items = items;

        if self.consume_keyword("WHERE") {
            select.filter = Some(self.parse_expr()?);
        }
        if self.consume_keyword("GROUP") {
            self.expect_keyword("BY")?;
            select.group_by = self.parse_expr_list()?;
        }
        if self.consume_keyword("HAVING") {
            select.having = Some(self.parse_expr()?);
        }
        if self.consume_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let expr = self.parse_expr()?;
                let descending = if self.consume_keyword("DESC") {
                    true
                } else {
                    self.consume_keyword("ASC");
                    false
                };
                select.order_by.push(OrderItem { expr, descending });
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
        }
        if self.consume_keyword("LIMIT") {
            let first = self.parse_expr()?;
            if self.consume_keyword("OFFSET") {
                select.limit = Some(first);
                select.offset = Some(self.parse_expr()?);
            } else if self.consume(&Token::Comma) {
                // LIMIT offset, count
                select.offset = Some(first);
                select.limit = Some(self.parse_expr()?);
            } else {
                select.limit = Some(first);
            }
        }
        Ok(select)
    }

    fn parse_select_item(&mut self) -> Result<SelectItem, QueryError> {
        if self.consume(&Token::Mul) {
            return Ok(SelectItem::Wildcard);
        }
        // table.*
        if matches!(self.peek(), Some(Token::Word(_)))
            && self.peek_nth(1) == Some(&Token::Period)
            && self.peek_nth(2) == Some(&Token::Mul)
        {
            self.pos += 3;
            return Ok(SelectItem::Wildcard);
        }

        let expr = self.parse_expr()?;
        let alias = if self.consume_keyword("AS") {
            Some(self.parse_alias()?)
        } else {
            match self.peek() {
                Some(Token::Word(w)) if !is_reserved(w) => Some(self.parse_alias()?),
                Some(Token::SingleQuotedString(_)) => Some(self.parse_alias()?),
                _ => None,
            }
        };
        Ok(SelectItem::Expr { expr, alias })
    }

    fn parse_alias(&mut self) -> Result<String, QueryError> {
        match self.next() {
            Some(Token::Word(w)) => Ok(w.value),
            Some(Token::SingleQuotedString(s)) => Ok(s),
            Some(tok) => Err(self.unexpected(&tok, "alias")),
            None => Err(QueryError::Syntax("expected alias".into())),
        }
    }

    fn parse_identifier(&mut self, what: &str) -> Result<String, QueryError> {
        match self.peek() {
            Some(Token::Word(w)) if w.quote_style.is_some() || !is_reserved(w) => {
                let value = w.value.clone();
                self.pos += 1;
                Ok(value)
            }
            _ => Err(self.unexpected_here(what)),
        }
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>, QueryError> {
        let mut list = vec![self.parse_expr()?];
        while self.consume(&Token::Comma) {
            list.push(self.parse_expr()?);
        }
        Ok(list)
    }

    pub fn parse_expr(&mut self) -> Result<Expr, QueryError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_and()?;
        while self.consume_keyword("OR") {
            let right = self.parse_and()?;
            left = Expr::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_not()?;
        while self.consume_keyword("AND") {
            let right = self.parse_not()?;
            left = Expr::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, QueryError> {
        if self.consume_keyword("NOT") {
            let expr = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.parse_equality()
    }

    fn parse_equality(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq | Token::DoubleEq) => Some(BinaryOp::Eq),
                Some(Token::Neq) => Some(BinaryOp::NotEq),
                _ => None,
            };
            if let Some(op) = op {
                self.pos += 1;
                let right = self.parse_relational()?;
                left = Expr::binary(op, left, right);
                continue;
            }

            if self.consume_keyword("IS") {
                let negated = self.consume_keyword("NOT");
                self.expect_keyword("NULL")?;
                left = Expr::IsNull {
                    expr: Box::new(left),
                    negated,
                };
                continue;
            }

            let negated = self.peek_keyword("NOT")
                && ["IN", "LIKE", "REGEXP", "BETWEEN"]
                    .iter()
                    .any(|kw| self.peek_nth_keyword(1, kw));
            if negated {
                self.pos += 1;
            }

            if self.consume_keyword("IN") {
                self.expect(&Token::LParen)?;
                let list = if self.peek() == Some(&Token::RParen) {
                    Vec::new()
                } else {
                    self.parse_expr_list()?
                };
                self.expect(&Token::RParen)?;
                left = Expr::InList {
                    expr: Box::new(left),
                    list,
                    negated,
                };
            } else if self.consume_keyword("LIKE") {
                let pattern = self.parse_relational()?;
                left = Expr::Like {
                    expr: Box::new(left),
                    pattern: Box::new(pattern),
                    negated,
                };
            } else if self.consume_keyword("REGEXP") {
                let pattern = self.parse_relational()?;
                left = Expr::Regexp {
                    expr: Box::new(left),
                    pattern: Box::new(pattern),
                    negated,
                };
            } else if self.consume_keyword("BETWEEN") {
                let low = self.parse_relational()?;
                self.expect_keyword("AND")?;
                let high = self.parse_relational()?;
                left = Expr::Between {
                    expr: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                };
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_relational(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Plus,
                Some(Token::Minus) => BinaryOp::Minus,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.peek() {
                Some(Token::Mul) => BinaryOp::Multiply,
                Some(Token::Div) => BinaryOp::Divide,
                Some(Token::Mod) => BinaryOp::Modulo,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_concat()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn parse_concat(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_unary()?;
        while self.consume(&Token::StringConcat) {
            let right = self.parse_unary()?;
            left = Expr::binary(BinaryOp::Concat, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, QueryError> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Minus,
            Some(Token::Plus) => UnaryOp::Plus,
            _ => return self.parse_primary(),
        };
        self.pos += 1;
        let expr = self.parse_unary()?;
        // Fold negative numeric literals so `-5` stays a literal.
        match (op, expr) {
            (UnaryOp::Minus, Expr::Literal(Datum::Int(i))) => {
                Ok(Expr::Literal(Datum::Int(i.wrapping_neg())))
            }
            (UnaryOp::Minus, Expr::Literal(Datum::Real(r))) => Ok(Expr::Literal(Datum::Real(-r))),
            (op, expr) => Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            }),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, QueryError> {
        let Some(tok) = self.next() else {
            return Err(QueryError::Syntax(
                "expected expression, found end of input".into(),
            ));
        };
        match tok {
            Token::Number(n, _) => parse_numeric_literal(&n),
            Token::SingleQuotedString(s) => Ok(Expr::text(s)),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(Expr::Nested(Box::new(inner)))
            }
            Token::Word(w) => self.parse_word(w),
            other => Err(self.unexpected(&other, "expression")),
        }
    }

    fn parse_word(&mut self, w: Word) -> Result<Expr, QueryError> {
        if w.quote_style == Some('"') {
            return Ok(Expr::QuotedName(w.value));
        }
        if w.quote_style.is_none() {
            let upper = w.value.to_ascii_uppercase();
            match upper.as_str() {
                "NULL" => return Ok(Expr::Literal(Datum::Null)),
                "TRUE" => return Ok(Expr::Literal(Datum::Int(1))),
                "FALSE" => return Ok(Expr::Literal(Datum::Int(0))),
                "CASE" => return self.parse_case(),
                "CAST" if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    return self.parse_cast();
                }
                _ => {}
            }
            if self.peek() == Some(&Token::LParen) {
                self.pos += 1;
                return self.parse_function(upper);
            }
            if is_reserved(&w) {
                return Err(QueryError::Syntax(format!(
                    "expected expression, found keyword {}",
                    w.value
                )));
            }
        }

        if self.consume(&Token::Period) {
            let name = match self.next() {
                Some(Token::Word(col)) => col.value,
                Some(tok) => return Err(self.unexpected(&tok, "column name")),
                None => return Err(QueryError::Syntax("expected column name".into())),
            };
            return Ok(Expr::Column {
                table: Some(w.value),
                name,
            });
        }
        Ok(Expr::Column {
            table: None,
            name: w.value,
        })
    }

    fn parse_function(&mut self, name: String) -> Result<Expr, QueryError> {
        if self.consume(&Token::Mul) {
            self.expect(&Token::RParen)?;
            return Ok(Expr::Function {
                name,
                args: Vec::new(),
                distinct: false,
                star: true,
            });
        }
        let distinct = self.consume_keyword("DISTINCT");
        let args = if self.peek() == Some(&Token::RParen) {
            Vec::new()
        } else {
            self.parse_expr_list()?
        };
        self.expect(&Token::RParen)?;
        Ok(Expr::Function {
            name,
            args,
            distinct,
            star: false,
        })
    }

    /// After `CAST(`: an expression, `AS`, and a type name of one or more
    /// words with an optional `(n)` or `(n, m)` size, then `)`.
    fn parse_cast(&mut self) -> Result<Expr, QueryError> {
        let expr = self.parse_expr()?;
        self.expect_keyword("AS")?;
        let mut words = Vec::new();
        while let Some(Token::Word(w)) = self.peek() {
            words.push(w.value.clone());
            self.pos += 1;
        }
        if words.is_empty() {
            return Err(self.unexpected_here("type name"));
        }
        let mut type_name = words.join(" ");
        if self.consume(&Token::LParen) {
            let mut sizes = Vec::new();
            loop {
                match self.next() {
                    Some(Token::Number(n, _)) => sizes.push(n),
                    Some(tok) => return Err(self.unexpected(&tok, "type size")),
                    None => return Err(self.unexpected_here("type size")),
                }
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
            type_name = format!("{type_name}({})", sizes.join(", "));
        }
        self.expect(&Token::RParen)?;
        Ok(Expr::Cast {
            expr: Box::new(expr),
            type_name,
        })
    }

    fn parse_case(&mut self) -> Result<Expr, QueryError> {
        let operand = if self.peek_keyword("WHEN") {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let mut branches = Vec::new();
        while self.consume_keyword("WHEN") {
            let when = self.parse_expr()?;
            self.expect_keyword("THEN")?;
            let then = self.parse_expr()?;
            branches.push((when, then));
        }
        if branches.is_empty() {
            return Err(self.unexpected_here("WHEN"));
        }
        let otherwise = if self.consume_keyword("ELSE") {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        self.expect_keyword("END")?;
        Ok(Expr::Case {
            operand,
            branches,
            otherwise,
        })
    }
}

fn is_keyword(tok: &Token, kw: &str) -> bool {
    matches!(tok, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(kw))
}

fn is_reserved(w: &Word) -> bool {
    w.quote_style.is_none() && RESERVED.iter().any(|r| w.value.eq_ignore_ascii_case(r))
}

fn parse_numeric_literal(text: &str) -> Result<Expr, QueryError> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Expr::Literal(Datum::Int(i)));
    }
    text.parse::<f64>()
        .map(|r| Expr::Literal(Datum::Real(r)))
        .map_err(|_| QueryError::Syntax(format!("invalid number {text}")))
}
