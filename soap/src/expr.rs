//! Symbolic expressions with deferred numeric substitution
//!
//! I/O bounds, intensities and tile sizes are produced symbolically, in terms
//! of problem-size symbols (`N`, `Ni`, ...), the fast-memory size `S` and the
//! rank count `P`. Callers substitute numbers later. Exact integer evaluation
//! is only possible once every symbol has been bound, and it never rounds:
//! an expression that is not integral fails instead of being approximated.
//!
//! # Canonical form
//!
//! The smart constructors ([`SymExpr::add`], [`SymExpr::mul`], [`SymExpr::pow`],
//! ...) flatten nested sums and products, fold numeric constants, merge like
//! terms and equal bases, and order the result deterministically. As a
//! consequence the `Display` output parses back into an equal expression:
//!
//! ```rust
//! use soap::expr::SymExpr;
//!
//! let q: SymExpr = "2*N*N*N/sqrt(S)".parse().unwrap();
//! assert_eq!(q.to_string(), "2*N^3/sqrt(S)");
//! assert_eq!(q.to_string().parse::<SymExpr>().unwrap(), q);
//! ```
//!
//! # Operators
//!
//! - `/` is exact rational division (`a/b` is `a * b^-1`)
//! - `//` is integer division truncated toward zero, `%` its remainder
//! - `^` and `**` take a constant rational exponent
//! - `min(..)`, `max(..)` and `sqrt(..)` are recognised function calls

use crate::rational::Rational;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Symbol to replacement expression, used by [`SymExpr::substitute`].
pub type Bindings = HashMap<String, SymExpr>;

/// Errors raised while parsing or evaluating symbolic expressions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// A symbol was left without a numeric value
    #[error("symbol '{0}' has no numeric value")]
    Unbound(String),

    /// The value exists but is not an integer (e.g. `sqrt(2)` or `3/2`)
    #[error("expression '{0}' does not evaluate to an integer")]
    NonInteger(String),

    #[error("division by zero in '{0}'")]
    DivisionByZero(String),

    #[error("integer overflow while evaluating '{0}'")]
    Overflow(String),

    #[error("cannot parse expression '{input}': {reason}")]
    Parse { input: String, reason: String },
}

/// Tagged symbolic expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SymExpr {
    Num(Rational),
    Sym(String),
    Add(Vec<SymExpr>),
    Mul(Vec<SymExpr>),
    Pow(Box<SymExpr>, Rational),
    /// Integer quotient truncated toward zero
    Div(Box<SymExpr>, Box<SymExpr>),
    /// Remainder of the truncating division
    Mod(Box<SymExpr>, Box<SymExpr>),
    Min(Vec<SymExpr>),
    Max(Vec<SymExpr>),
}

// ============================================================================
// Construction
// ============================================================================

impl SymExpr {
    pub fn num(value: i64) -> Self {
        SymExpr::Num(Rational::from_integer(value))
    }

    pub fn rational(value: Rational) -> Self {
        SymExpr::Num(value)
    }

    pub fn sym(name: impl Into<String>) -> Self {
        SymExpr::Sym(name.into())
    }

    /// Sum with flattening, constant folding and like-term merging.
    pub fn add<I: IntoIterator<Item = SymExpr>>(terms: I) -> Self {
        let mut constant = Rational::ZERO;
        let mut leftovers = Vec::new();
        let mut grouped: BTreeMap<String, (Rational, SymExpr)> = BTreeMap::new();

        let mut pending: Vec<SymExpr> = terms.into_iter().collect();
        pending.reverse();
        while let Some(term) = pending.pop() {
            match term {
                SymExpr::Add(inner) => pending.extend(inner.into_iter().rev()),
                SymExpr::Num(value) => match constant.checked_add(&value) {
                    Some(sum) => constant = sum,
                    None => leftovers.push(SymExpr::Num(value)),
                },
                other => {
                    let (coeff, rest) = other.split_coefficient();
                    let key = rest.to_string();
                    match grouped.get_mut(&key) {
                        Some((existing, _)) => match existing.checked_add(&coeff) {
                            Some(sum) => *existing = sum,
                            None => leftovers.push(SymExpr::scaled(coeff, rest)),
                        },
                        None => {
                            grouped.insert(key, (coeff, rest));
                        }
                    }
                }
            }
        }

        let mut out: Vec<SymExpr> = grouped
            .into_values()
            .filter(|(coeff, _)| !coeff.is_zero())
            .map(|(coeff, rest)| SymExpr::scaled(coeff, rest))
            .collect();
        out.extend(leftovers);
        if !constant.is_zero() {
            out.push(SymExpr::Num(constant));
        }
        match out.len() {
            0 => SymExpr::Num(Rational::ZERO),
            1 => out.remove(0),
            _ => SymExpr::Add(out),
        }
    }

    /// Product with flattening, constant folding and merging of equal bases.
    pub fn mul<I: IntoIterator<Item = SymExpr>>(factors: I) -> Self {
        let mut coeff = Rational::ONE;
        let mut leftovers = Vec::new();
        let mut grouped: BTreeMap<String, (SymExpr, Rational)> = BTreeMap::new();

        let mut merge = |base: SymExpr, exp: Rational, leftovers: &mut Vec<SymExpr>| {
            let key = base.to_string();
            match grouped.get_mut(&key) {
                Some((_, existing)) => match existing.checked_add(&exp) {
                    Some(sum) => *existing = sum,
                    None => leftovers.push(SymExpr::Pow(Box::new(base), exp)),
                },
                None => {
                    grouped.insert(key, (base, exp));
                }
            }
        };

        let mut pending: Vec<SymExpr> = factors.into_iter().collect();
        while let Some(factor) = pending.pop() {
            match factor {
                SymExpr::Mul(inner) => pending.extend(inner),
                SymExpr::Num(value) => match coeff.checked_mul(&value) {
                    Some(product) => coeff = product,
                    None => leftovers.push(SymExpr::Num(value)),
                },
                SymExpr::Pow(base, exp) => merge(*base, exp, &mut leftovers),
                other => merge(other, Rational::ONE, &mut leftovers),
            }
        }

        if coeff.is_zero() {
            return SymExpr::Num(Rational::ZERO);
        }

        let mut out = Vec::new();
        for (_, (base, exp)) in grouped {
            if exp.is_zero() {
                continue;
            }
            match SymExpr::pow(base, exp) {
                SymExpr::Num(value) => match coeff.checked_mul(&value) {
                    Some(product) => coeff = product,
                    None => leftovers.push(SymExpr::Num(value)),
                },
                other => out.push(other),
            }
        }
        out.extend(leftovers);
        if coeff.is_zero() {
            return SymExpr::Num(Rational::ZERO);
        }
        if !coeff.is_one() || out.is_empty() {
            out.insert(0, SymExpr::Num(coeff));
        }
        match out.len() {
            1 => out.remove(0),
            _ => SymExpr::Mul(out),
        }
    }

    /// `base ^ exp`, distributing over products and collapsing nested powers.
    pub fn pow(base: SymExpr, exp: Rational) -> Self {
        if exp.is_zero() {
            return SymExpr::num(1);
        }
        if exp.is_one() {
            return base;
        }
        match base {
            SymExpr::Num(value) => match value.exact_pow(&exp) {
                Some(result) => SymExpr::Num(result),
                None => SymExpr::Pow(Box::new(SymExpr::Num(value)), exp),
            },
            SymExpr::Pow(inner, inner_exp) => match inner_exp.checked_mul(&exp) {
                Some(product) => SymExpr::pow(*inner, product),
                None => SymExpr::Pow(Box::new(SymExpr::Pow(inner, inner_exp)), exp),
            },
            SymExpr::Mul(factors) => SymExpr::mul(factors.into_iter().map(|f| SymExpr::pow(f, exp))),
            other => SymExpr::Pow(Box::new(other), exp),
        }
    }

    pub fn sqrt(base: SymExpr) -> Self {
        SymExpr::pow(base, Rational::HALF)
    }

    /// Exact quotient `a / b`.
    pub fn ratio(a: SymExpr, b: SymExpr) -> Self {
        SymExpr::mul([a, SymExpr::pow(b, Rational::from_integer(-1))])
    }

    pub fn neg(a: SymExpr) -> Self {
        SymExpr::mul([SymExpr::num(-1), a])
    }

    pub fn sub(a: SymExpr, b: SymExpr) -> Self {
        SymExpr::add([a, SymExpr::neg(b)])
    }

    /// Truncating integer division, folded when both operands are integers.
    pub fn div_trunc(a: SymExpr, b: SymExpr) -> Self {
        if let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) {
            if let Some(q) = Rational::trunc_div(x, y) {
                return SymExpr::num(q);
            }
        }
        SymExpr::Div(Box::new(a), Box::new(b))
    }

    pub fn modulo(a: SymExpr, b: SymExpr) -> Self {
        if let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) {
            if let Some(r) = Rational::trunc_rem(x, y) {
                return SymExpr::num(r);
            }
        }
        SymExpr::Mod(Box::new(a), Box::new(b))
    }

    pub fn min<I: IntoIterator<Item = SymExpr>>(args: I) -> Self {
        SymExpr::extremum(args, true)
    }

    pub fn max<I: IntoIterator<Item = SymExpr>>(args: I) -> Self {
        SymExpr::extremum(args, false)
    }

    fn extremum<I: IntoIterator<Item = SymExpr>>(args: I, is_min: bool) -> Self {
        let mut best: Option<Rational> = None;
        let mut symbolic = Vec::new();
        for arg in args {
            let nested = match arg {
                SymExpr::Min(inner) if is_min => inner,
                SymExpr::Max(inner) if !is_min => inner,
                other => vec![other],
            };
            for item in nested {
                match item {
                    SymExpr::Num(value) => {
                        best = Some(match best {
                            Some(current) if is_min => current.min(value),
                            Some(current) => current.max(value),
                            None => value,
                        })
                    }
                    other => symbolic.push(other),
                }
            }
        }
        if let Some(value) = best {
            symbolic.push(SymExpr::Num(value));
        }
        match symbolic.len() {
            0 => SymExpr::num(0),
            1 => symbolic.remove(0),
            _ if is_min => SymExpr::Min(symbolic),
            _ => SymExpr::Max(symbolic),
        }
    }

    fn scaled(coeff: Rational, rest: SymExpr) -> Self {
        if coeff.is_one() {
            rest
        } else {
            SymExpr::mul([SymExpr::Num(coeff), rest])
        }
    }

    /// Split a canonical term into its numeric coefficient and the rest.
    fn split_coefficient(self) -> (Rational, SymExpr) {
        match self {
            SymExpr::Mul(mut factors) => {
                if let Some(SymExpr::Num(coeff)) = factors.first() {
                    let coeff = *coeff;
                    factors.remove(0);
                    let rest = if factors.len() == 1 {
                        factors.remove(0)
                    } else {
                        SymExpr::Mul(factors)
                    };
                    (coeff, rest)
                } else {
                    (Rational::ONE, SymExpr::Mul(factors))
                }
            }
            other => (Rational::ONE, other),
        }
    }
}

impl From<i64> for SymExpr {
    fn from(value: i64) -> Self {
        SymExpr::num(value)
    }
}

// ============================================================================
// Inspection, substitution and evaluation
// ============================================================================

impl SymExpr {
    /// The value of an integral numeric literal.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SymExpr::Num(value) => value.to_integer(),
            _ => None,
        }
    }

    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut symbols = BTreeSet::new();
        self.collect_symbols(&mut symbols);
        symbols
    }

    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            SymExpr::Num(_) => {}
            SymExpr::Sym(name) => {
                out.insert(name.clone());
            }
            SymExpr::Add(items) | SymExpr::Mul(items) | SymExpr::Min(items) | SymExpr::Max(items) => {
                items.iter().for_each(|item| item.collect_symbols(out))
            }
            SymExpr::Pow(base, _) => base.collect_symbols(out),
            SymExpr::Div(a, b) | SymExpr::Mod(a, b) => {
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
        }
    }

    /// True when no symbol is left.
    pub fn is_numeric(&self) -> bool {
        self.free_symbols().is_empty()
    }

    /// Replace bound symbols and re-canonicalise.
    pub fn substitute(&self, bindings: &Bindings) -> SymExpr {
        match self {
            SymExpr::Num(_) => self.clone(),
            SymExpr::Sym(name) => bindings.get(name).cloned().unwrap_or_else(|| self.clone()),
            SymExpr::Add(items) => SymExpr::add(items.iter().map(|i| i.substitute(bindings))),
            SymExpr::Mul(items) => SymExpr::mul(items.iter().map(|i| i.substitute(bindings))),
            SymExpr::Min(items) => SymExpr::min(items.iter().map(|i| i.substitute(bindings))),
            SymExpr::Max(items) => SymExpr::max(items.iter().map(|i| i.substitute(bindings))),
            SymExpr::Pow(base, exp) => SymExpr::pow(base.substitute(bindings), *exp),
            SymExpr::Div(a, b) => SymExpr::div_trunc(a.substitute(bindings), b.substitute(bindings)),
            SymExpr::Mod(a, b) => SymExpr::modulo(a.substitute(bindings), b.substitute(bindings)),
        }
    }

    /// Substitute integer values for symbols.
    pub fn substitute_values(&self, values: &BTreeMap<String, i64>) -> SymExpr {
        let bindings: Bindings = values
            .iter()
            .map(|(name, value)| (name.clone(), SymExpr::num(*value)))
            .collect();
        self.substitute(&bindings)
    }

    /// Exact evaluation. Fails on unbound symbols and irrational powers.
    pub fn eval_rational(&self) -> Result<Rational, ExprError> {
        let overflow = || ExprError::Overflow(self.to_string());
        match self {
            SymExpr::Num(value) => Ok(*value),
            SymExpr::Sym(name) => Err(ExprError::Unbound(name.clone())),
            SymExpr::Add(items) => items.iter().try_fold(Rational::ZERO, |acc, item| {
                acc.checked_add(&item.eval_rational()?).ok_or_else(overflow)
            }),
            SymExpr::Mul(items) => items.iter().try_fold(Rational::ONE, |acc, item| {
                acc.checked_mul(&item.eval_rational()?).ok_or_else(overflow)
            }),
            SymExpr::Pow(base, exp) => {
                let value = base.eval_rational()?;
                if value.is_zero() && exp.is_negative() {
                    return Err(ExprError::DivisionByZero(self.to_string()));
                }
                value
                    .exact_pow(exp)
                    .ok_or_else(|| ExprError::NonInteger(self.to_string()))
            }
            SymExpr::Div(a, b) | SymExpr::Mod(a, b) => {
                let (x, y) = (a.eval_int()?, b.eval_int()?);
                if y == 0 {
                    return Err(ExprError::DivisionByZero(self.to_string()));
                }
                let result = match self {
                    SymExpr::Div(..) => Rational::trunc_div(x, y),
                    _ => Rational::trunc_rem(x, y),
                };
                result.map(Rational::from_integer).ok_or_else(overflow)
            }
            SymExpr::Min(items) | SymExpr::Max(items) => {
                let mut values = items.iter().map(|item| item.eval_rational());
                let first = values
                    .next()
                    .unwrap_or_else(|| Ok(Rational::ZERO))?;
                values.try_fold(first, |acc, value| {
                    let value = value?;
                    Ok(if matches!(self, SymExpr::Min(_)) {
                        acc.min(value)
                    } else {
                        acc.max(value)
                    })
                })
            }
        }
    }

    /// Exact integer evaluation, the only evaluation used for decompositions.
    pub fn eval_int(&self) -> Result<i64, ExprError> {
        self.eval_rational()?
            .to_integer()
            .ok_or_else(|| ExprError::NonInteger(self.to_string()))
    }

    /// Floating-point evaluation for reporting and heuristics.
    pub fn eval_f64(&self) -> Result<f64, ExprError> {
        Ok(match self {
            SymExpr::Num(value) => value.to_f64(),
            SymExpr::Sym(name) => return Err(ExprError::Unbound(name.clone())),
            SymExpr::Add(items) => items.iter().map(|i| i.eval_f64()).sum::<Result<f64, _>>()?,
            SymExpr::Mul(items) => items.iter().map(|i| i.eval_f64()).product::<Result<f64, _>>()?,
            SymExpr::Pow(base, exp) => base.eval_f64()?.powf(exp.to_f64()),
            SymExpr::Div(a, b) | SymExpr::Mod(a, b) => {
                let (x, y) = (a.eval_f64()?, b.eval_f64()?);
                if y == 0.0 {
                    return Err(ExprError::DivisionByZero(self.to_string()));
                }
                match self {
                    SymExpr::Div(..) => (x / y).trunc(),
                    _ => x % y,
                }
            }
            SymExpr::Min(items) => items
                .iter()
                .map(|i| i.eval_f64())
                .try_fold(f64::INFINITY, |acc, v| v.map(|v| acc.min(v)))?,
            SymExpr::Max(items) => items
                .iter()
                .map(|i| i.eval_f64())
                .try_fold(f64::NEG_INFINITY, |acc, v| v.map(|v| acc.max(v)))?,
        })
    }
}

// ============================================================================
// Display
// ============================================================================

impl SymExpr {
    /// Rendering usable as an operand of `//`, `%` or a denominator.
    fn fmt_operand(&self) -> String {
        match self {
            SymExpr::Sym(_) | SymExpr::Min(_) | SymExpr::Max(_) => self.to_string(),
            SymExpr::Num(value) if value.is_integer() && !value.is_negative() => self.to_string(),
            SymExpr::Pow(_, exp) if !exp.is_negative() => self.to_string(),
            _ => format!("({})", self),
        }
    }

    /// Rendering usable as a factor of a product.
    fn fmt_factor(&self) -> String {
        match self {
            SymExpr::Add(_) | SymExpr::Div(..) | SymExpr::Mod(..) => format!("({})", self),
            SymExpr::Num(_) => self.fmt_operand(),
            _ => self.to_string(),
        }
    }

    fn fmt_pow(base: &SymExpr, exp: &Rational) -> String {
        if exp.is_one() {
            return base.fmt_operand();
        }
        if *exp == Rational::HALF {
            return format!("sqrt({})", base);
        }
        let atom = match base {
            SymExpr::Sym(_) | SymExpr::Min(_) | SymExpr::Max(_) => base.to_string(),
            SymExpr::Num(value) if value.is_integer() && !value.is_negative() => base.to_string(),
            _ => format!("({})", base),
        };
        if exp.is_integer() {
            format!("{}^{}", atom, exp)
        } else {
            format!("{}^({})", atom, exp)
        }
    }
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymExpr::Num(value) => write!(f, "{}", value),
            SymExpr::Sym(name) => write!(f, "{}", name),
            SymExpr::Add(terms) => {
                let rendered: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
                write!(f, "{}", rendered.join(" + "))
            }
            SymExpr::Mul(factors) => {
                let mut negative = false;
                let mut numer = Vec::new();
                let mut denom = Vec::new();
                for factor in factors {
                    match factor {
                        SymExpr::Num(value) => {
                            let value = if value.is_negative() {
                                negative = !negative;
                                value.abs()
                            } else {
                                *value
                            };
                            if value.numer() != 1 {
                                numer.push(value.numer().to_string());
                            }
                            if value.denom() != 1 {
                                denom.push(value.denom().to_string());
                            }
                        }
                        SymExpr::Pow(base, exp) if exp.is_negative() => {
                            let positive = exp.checked_neg().unwrap_or(*exp);
                            denom.push(SymExpr::fmt_pow(base, &positive));
                        }
                        other => numer.push(other.fmt_factor()),
                    }
                }
                if numer.is_empty() {
                    numer.push("1".to_string());
                }
                if negative {
                    write!(f, "-")?;
                }
                write!(f, "{}", numer.join("*"))?;
                for d in denom {
                    write!(f, "/{}", d)?;
                }
                Ok(())
            }
            SymExpr::Pow(base, exp) => {
                if exp.is_negative() {
                    let positive = exp.checked_neg().unwrap_or(*exp);
                    write!(f, "1/{}", SymExpr::fmt_pow(base, &positive))
                } else {
                    write!(f, "{}", SymExpr::fmt_pow(base, exp))
                }
            }
            SymExpr::Div(a, b) => write!(f, "{} // {}", a.fmt_operand(), b.fmt_operand()),
            SymExpr::Mod(a, b) => write!(f, "{} % {}", a.fmt_operand(), b.fmt_operand()),
            SymExpr::Min(args) | SymExpr::Max(args) => {
                let name = if matches!(self, SymExpr::Min(_)) { "min" } else { "max" };
                let rendered: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, rendered.join(", "))
            }
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

lazy_static! {
    static ref TOKEN: Regex = Regex::new(
        r"^\s*(?:(?P<num>\d+)|(?P<ident>[A-Za-z_][A-Za-z0-9_]*)|(?P<op>\*\*|//|[-+*/%^(),]))"
    )
    .unwrap();
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(i64),
    Ident(String),
    Op(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut rest = input;
    while !rest.trim().is_empty() {
        let caps = TOKEN.captures(rest).ok_or_else(|| ExprError::Parse {
            input: input.to_string(),
            reason: format!("unexpected input at '{}'", rest.trim()),
        })?;
        if let Some(m) = caps.name("num") {
            let value = m.as_str().parse::<i64>().map_err(|e| ExprError::Parse {
                input: input.to_string(),
                reason: e.to_string(),
            })?;
            tokens.push(Token::Num(value));
        } else if let Some(m) = caps.name("ident") {
            tokens.push(Token::Ident(m.as_str().to_string()));
        } else if let Some(m) = caps.name("op") {
            tokens.push(Token::Op(m.as_str().to_string()));
        }
        rest = &rest[caps[0].len()..];
    }
    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> ExprError {
        ExprError::Parse {
            input: self.input.to_string(),
            reason: reason.into(),
        }
    }

    fn peek_op(&self) -> Option<&str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(op.as_str()),
            _ => None,
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExprError> {
        if self.peek_op() == Some(op) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn expression(&mut self) -> Result<SymExpr, ExprError> {
        let mut terms = vec![self.term()?];
        while let Some(op) = self.peek_op() {
            match op {
                "+" => {
                    self.pos += 1;
                    terms.push(self.term()?);
                }
                "-" => {
                    self.pos += 1;
                    terms.push(SymExpr::neg(self.term()?));
                }
                _ => break,
            }
        }
        Ok(SymExpr::add(terms))
    }

    fn term(&mut self) -> Result<SymExpr, ExprError> {
        let mut acc = self.unary()?;
        while let Some(op) = self.peek_op() {
            let op = op.to_string();
            match op.as_str() {
                "*" | "/" | "//" | "%" => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    acc = match op.as_str() {
                        "*" => SymExpr::mul([acc, rhs]),
                        "/" => SymExpr::ratio(acc, rhs),
                        "//" => SymExpr::div_trunc(acc, rhs),
                        _ => SymExpr::modulo(acc, rhs),
                    };
                }
                _ => break,
            }
        }
        Ok(acc)
    }

    fn unary(&mut self) -> Result<SymExpr, ExprError> {
        if self.peek_op() == Some("-") {
            self.pos += 1;
            return Ok(SymExpr::neg(self.unary()?));
        }
        self.power()
    }

    fn power(&mut self) -> Result<SymExpr, ExprError> {
        let base = self.primary()?;
        if matches!(self.peek_op(), Some("^") | Some("**")) {
            self.pos += 1;
            let exponent = self.unary()?;
            return match exponent {
                SymExpr::Num(exp) => Ok(SymExpr::pow(base, exp)),
                other => Err(self.error(format!("exponent '{}' is not a constant", other))),
            };
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<SymExpr, ExprError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error("unexpected end of input"))?;
        self.pos += 1;
        match token {
            Token::Num(value) => Ok(SymExpr::num(value)),
            Token::Ident(name) => {
                if self.peek_op() != Some("(") {
                    return Ok(SymExpr::Sym(name));
                }
                self.pos += 1;
                let mut args = vec![self.expression()?];
                while self.peek_op() == Some(",") {
                    self.pos += 1;
                    args.push(self.expression()?);
                }
                self.expect_op(")")?;
                match (name.as_str(), args.len()) {
                    ("min", _) => Ok(SymExpr::min(args)),
                    ("max", _) => Ok(SymExpr::max(args)),
                    ("sqrt", 1) => Ok(SymExpr::sqrt(args.remove(0))),
                    _ => Err(self.error(format!(
                        "unknown function '{}' with {} argument(s)",
                        name,
                        args.len()
                    ))),
                }
            }
            Token::Op(op) if op == "(" => {
                let inner = self.expression()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Token::Op(op) => Err(self.error(format!("unexpected '{}'", op))),
        }
    }
}

impl FromStr for SymExpr {
    type Err = ExprError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            input,
            tokens: tokenize(input)?,
            pos: 0,
        };
        if parser.tokens.is_empty() {
            return Err(parser.error("empty expression"));
        }
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(expr)
    }
}

// ============================================================================
// Serde: expressions travel as their textual form
// ============================================================================

impl Serialize for SymExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SymExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(value) => Ok(SymExpr::num(value)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}
