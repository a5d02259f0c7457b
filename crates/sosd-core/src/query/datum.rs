//! Cell values inside the query executor.

use std::cmp::Ordering;
use std::fmt;

use crate::types::{Value, format_double};

/// A dynamically typed cell, ordered the way SQLite orders storage classes:
/// NULL sorts first, then numbers, then text.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Numeric view used by arithmetic. Text that does not parse is zero.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Datum::Null => None,
            Datum::Int(i) => Some(Number::Int(*i)),
            Datum::Real(r) => Some(Number::Real(*r)),
            Datum::Text(s) => Some(parse_number(s).unwrap_or(Number::Int(0))),
        }
    }

    /// Truth value under three-valued logic; `None` is unknown.
    pub fn truth(&self) -> Option<bool> {
        match self {
            Datum::Null => None,
            Datum::Int(i) => Some(*i != 0),
            Datum::Real(r) => Some(*r != 0.0),
            Datum::Text(s) => Some(parse_number(s).is_some_and(|n| n.as_f64() != 0.0)),
        }
    }

    pub fn from_bool(b: Option<bool>) -> Self {
        match b {
            Some(true) => Datum::Int(1),
            Some(false) => Datum::Int(0),
            None => Datum::Null,
        }
    }

    /// Text rendering used for result cells; `None` is NULL.
    pub fn render(&self) -> Option<String> {
        match self {
            Datum::Null => None,
            Datum::Int(i) => Some(i.to_string()),
            Datum::Real(r) => Some(format_double(*r)),
            Datum::Text(s) => Some(s.clone()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Int(_) => "integer",
            Datum::Real(_) => "real",
            Datum::Text(_) => "text",
        }
    }

    /// Comparison for predicates. NULL on either side is unknown. Text that
    /// looks numeric compares numerically against a number.
    pub fn compare(&self, other: &Datum) -> Option<Ordering> {
        match (self, other) {
            (Datum::Null, _) | (_, Datum::Null) => None,
            (Datum::Text(a), Datum::Text(b)) => Some(a.cmp(b)),
            (Datum::Text(t), n) => match parse_number(t) {
                Some(parsed) => n.as_number().map(|n| parsed.cmp_num(n)),
                None => Some(Ordering::Greater),
            },
            (n, Datum::Text(t)) => match parse_number(t) {
                Some(parsed) => n.as_number().map(|n| n.cmp_num(parsed)),
                None => Some(Ordering::Less),
            },
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(a), Some(b)) => Some(a.cmp_num(b)),
                _ => None,
            },
        }
    }

    /// Total order used for sorting, grouping, and DISTINCT.
    pub fn total_cmp(&self, other: &Datum) -> Ordering {
        fn class(d: &Datum) -> u8 {
            match d {
                Datum::Null => 0,
                Datum::Int(_) | Datum::Real(_) => 1,
                Datum::Text(_) => 2,
            }
        }
        match (self, other) {
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            (Datum::Int(_) | Datum::Real(_), Datum::Int(_) | Datum::Real(_)) => {
                match (self.as_number(), other.as_number()) {
                    (Some(a), Some(b)) => a.cmp_num(b),
                    _ => Ordering::Equal,
                }
            }
            _ => class(self).cmp(&class(other)),
        }
    }
}

impl From<&Value> for Datum {
    fn from(value: &Value) -> Self {
        match value {
            Value::Int(i) => Datum::Int(i64::from(*i)),
            Value::Long(l) => Datum::Int(*l),
            Value::Double(d) => Datum::Real(*d),
            Value::String(s) => Datum::Text(s.clone()),
            Value::Bytes(_) => Datum::Text(value.to_string()),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Int(i) => write!(f, "{i}"),
            Datum::Real(r) => f.write_str(&format_double(*r)),
            Datum::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

/// Numeric operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Real(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Real(r) => r,
        }
    }

    pub fn cmp_num(self, other: Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(&b),
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        }
    }

    pub fn into_datum(self) -> Datum {
        match self {
            Number::Int(i) => Datum::Int(i),
            Number::Real(r) if r.is_nan() => Datum::Null,
            Number::Real(r) => Datum::Real(r),
        }
    }
}

/// Parse a whole string as a number, integers first.
pub fn parse_number(s: &str) -> Option<Number> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::Int(i));
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Number::Real)
}

/// Type affinity named by a `CAST` target, derived from the type name the
/// way SQLite does it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Real,
    Text,
    Numeric,
    /// No conversion.
    Blob,
}

impl Affinity {
    pub fn from_type_name(name: &str) -> Self {
        let name = name.to_ascii_uppercase();
        let has = |needle: &str| name.contains(needle);
        if has("INT") {
            Affinity::Integer
        } else if has("CHAR") || has("CLOB") || has("TEXT") {
            Affinity::Text
        } else if has("BLOB") || name.trim().is_empty() {
            Affinity::Blob
        } else if has("REAL") || has("FLOA") || has("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }
}

impl Datum {
    /// `CAST(self AS affinity)`. Text converts through its longest numeric
    /// prefix, so `'12abc'` becomes 12 and `'abc'` becomes 0.
    pub fn cast(&self, affinity: Affinity) -> Datum {
        if self.is_null() {
            return Datum::Null;
        }
        match affinity {
            Affinity::Blob => self.clone(),
            Affinity::Text => match self.render() {
                Some(text) => Datum::Text(text),
                None => Datum::Null,
            },
            Affinity::Integer => match self.cast_number() {
                Number::Int(i) => Datum::Int(i),
                Number::Real(r) => Datum::Int(r as i64),
            },
            Affinity::Real => Datum::Real(self.cast_number().as_f64()),
            Affinity::Numeric => match self.cast_number() {
                Number::Real(r) if r.fract() == 0.0 && r.abs() < 9.2e18 => Datum::Int(r as i64),
                n => n.into_datum(),
            },
        }
    }

    fn cast_number(&self) -> Number {
        match self {
            Datum::Int(i) => Number::Int(*i),
            Datum::Real(r) => Number::Real(*r),
            Datum::Text(s) => numeric_prefix(s).unwrap_or(Number::Int(0)),
            Datum::Null => Number::Int(0),
        }
    }
}

/// The longest leading part of `s` that reads as a number.
fn numeric_prefix(s: &str) -> Option<Number> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_end = digits_from(end);
    let mut seen_digits = int_end > end;
    end = int_end;
    let mut is_real = false;

    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        if seen_digits || frac_end > end + 1 {
            seen_digits = true;
            is_real = true;
            end = frac_end;
        }
    }
    if !seen_digits {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_end = digits_from(exp);
        if exp_end > exp {
            is_real = true;
            end = exp_end;
        }
    }

    let text = &s[..end];
    if !is_real && let Ok(i) = text.parse::<i64>() {
        return Some(Number::Int(i));
    }
    text.parse::<f64>().ok().map(Number::Real)
}

/// Key wrapper giving `Vec<Datum>` a total order for maps and sets.
#[derive(Debug, Clone)]
pub struct SortKey(pub Vec<Datum>);

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_storage_class_order() {
        let mut cells = vec![
            Datum::Text("b".into()),
            Datum::Real(2.5),
            Datum::Null,
            Datum::Int(3),
            Datum::Text("a".into()),
            Datum::Int(-1),
        ];
        cells.sort_by(Datum::total_cmp);
        assert_eq!(
            cells,
            vec![
                Datum::Null,
                Datum::Int(-1),
                Datum::Real(2.5),
                Datum::Int(3),
                Datum::Text("a".into()),
                Datum::Text("b".into()),
            ]
        );
    }

    #[test]
    fn test_compare_numeric_text() {
        assert_eq!(
            Datum::Text("10".into()).compare(&Datum::Int(9)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Datum::Int(1).compare(&Datum::Real(1.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(Datum::Null.compare(&Datum::Int(1)), None);
        assert_eq!(
            Datum::Int(5).compare(&Datum::Text("abc".into())),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_truth() {
        assert_eq!(Datum::Int(0).truth(), Some(false));
        assert_eq!(Datum::Real(0.5).truth(), Some(true));
        assert_eq!(Datum::Text("abc".into()).truth(), Some(false));
        assert_eq!(Datum::Text("2".into()).truth(), Some(true));
        assert_eq!(Datum::Null.truth(), None);
    }

    #[test]
    fn test_render() {
        assert_eq!(Datum::Real(3.14).render().as_deref(), Some("3.14"));
        assert_eq!(Datum::Real(1.0).render().as_deref(), Some("1.0"));
        assert_eq!(Datum::Int(42).render().as_deref(), Some("42"));
        assert_eq!(Datum::Null.render(), None);
    }

    #[test]
    fn test_from_value() {
        assert_eq!(Datum::from(&Value::Int(7)), Datum::Int(7));
        assert_eq!(Datum::from(&Value::Long(-2)), Datum::Int(-2));
        assert_eq!(Datum::from(&Value::Double(0.5)), Datum::Real(0.5));
        assert_eq!(
            Datum::from(&Value::String("x".into())),
            Datum::Text("x".into())
        );
    }

    #[test]
    fn test_affinity_from_type_name() {
        assert_eq!(Affinity::from_type_name("integer"), Affinity::Integer);
        assert_eq!(Affinity::from_type_name("BIGINT"), Affinity::Integer);
        assert_eq!(Affinity::from_type_name("float"), Affinity::Real);
        assert_eq!(Affinity::from_type_name("DOUBLE PRECISION"), Affinity::Real);
        assert_eq!(Affinity::from_type_name("VARCHAR(20)"), Affinity::Text);
        assert_eq!(Affinity::from_type_name("blob"), Affinity::Blob);
        assert_eq!(Affinity::from_type_name("decimal"), Affinity::Numeric);
    }

    #[test]
    fn test_cast() {
        let text = |s: &str| Datum::Text(s.to_string());
        assert_eq!(text("2.5").cast(Affinity::Real), Datum::Real(2.5));
        assert_eq!(text(" 12abc").cast(Affinity::Integer), Datum::Int(12));
        assert_eq!(text("3.9").cast(Affinity::Integer), Datum::Int(3));
        assert_eq!(text("abc").cast(Affinity::Real), Datum::Real(0.0));
        assert_eq!(text("1e3").cast(Affinity::Real), Datum::Real(1000.0));
        assert_eq!(text("-.5x").cast(Affinity::Real), Datum::Real(-0.5));
        assert_eq!(text("3.0").cast(Affinity::Numeric), Datum::Int(3));
        assert_eq!(text("3.25").cast(Affinity::Numeric), Datum::Real(3.25));
        assert_eq!(Datum::Real(-7.8).cast(Affinity::Integer), Datum::Int(-7));
        assert_eq!(Datum::Int(4).cast(Affinity::Real), Datum::Real(4.0));
        assert_eq!(Datum::Real(2.0).cast(Affinity::Text), text("2.0"));
        assert_eq!(Datum::Int(4).cast(Affinity::Blob), Datum::Int(4));
        assert_eq!(Datum::Null.cast(Affinity::Integer), Datum::Null);
    }
}
