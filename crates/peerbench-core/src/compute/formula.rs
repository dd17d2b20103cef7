//! Formula expressions over named line-item aggregates.
//!
//! A formula is parsed once at configuration load into an [`Expr`] tree and
//! evaluated many times against resolved aggregate values. The grammar is
//! deliberately small: `+ - * /`, unary minus, parentheses, numeric
//! literals, and aggregate references (identifiers).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{PeerbenchError, PeerbenchResult};

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z_][A-Za-z0-9_]*|[0-9]+(?:\.[0-9]+)?|[()+\-*/]").unwrap()
});

// ---------------------------------------------------------------------------
// Expression tree
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A parsed formula expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    Aggregate(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Collect every aggregate name referenced by this expression.
    pub fn aggregate_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Aggregate(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.collect_names(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_names(out);
                rhs.collect_names(out);
            }
        }
    }

    /// Evaluate against resolved aggregate values.
    ///
    /// Returns `None` when any division denominator resolves to exactly
    /// zero: the KPI is null for that entity/period, not an error. The
    /// caller guarantees every referenced aggregate is present in
    /// `resolved` (the registry validates references at load).
    pub fn eval(&self, resolved: &BTreeMap<String, f64>) -> Option<f64> {
        match self {
            Expr::Number(n) => Some(*n),
            Expr::Aggregate(name) => resolved.get(name).copied(),
            Expr::Neg(inner) => inner.eval(resolved).map(|v| -v),
            Expr::Binary { op, lhs, rhs } => {
                let left = lhs.eval(resolved)?;
                let right = rhs.eval(resolved)?;
                match op {
                    BinOp::Add => Some(left + right),
                    BinOp::Sub => Some(left - right),
                    BinOp::Mul => Some(left * right),
                    BinOp::Div => {
                        if right == 0.0 {
                            None
                        } else {
                            Some(left / right)
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> PeerbenchResult<Self> {
        let tokens: Vec<&str> = TOKEN_RE.find_iter(source).map(|m| m.as_str()).collect();

        // Every non-whitespace character must belong to a token, otherwise
        // the formula contains something the grammar does not know.
        let matched: usize = tokens.iter().map(|t| t.len()).sum();
        let significant = source.chars().filter(|c| !c.is_whitespace()).count();
        if matched != significant {
            return Err(syntax_error(source, "unrecognized character"));
        }
        Ok(Self {
            source,
            tokens,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<&'a str> {
        let tok = self.peek();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expr(&mut self) -> PeerbenchResult<Expr> {
        let mut node = self.term()?;
        while let Some(tok) = self.peek() {
            let op = match tok {
                "+" => BinOp::Add,
                "-" => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.term()?;
            node = Expr::Binary {
                op,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn term(&mut self) -> PeerbenchResult<Expr> {
        let mut node = self.factor()?;
        while let Some(tok) = self.peek() {
            let op = match tok {
                "*" => BinOp::Mul,
                "/" => BinOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.factor()?;
            node = Expr::Binary {
                op,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
        Ok(node)
    }

    fn factor(&mut self) -> PeerbenchResult<Expr> {
        match self.bump() {
            Some("-") => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some("(") => {
                let inner = self.expr()?;
                match self.bump() {
                    Some(")") => Ok(inner),
                    _ => Err(syntax_error(self.source, "expected ')'")),
                }
            }
            Some(tok) if tok.chars().next().is_some_and(|c| c.is_ascii_digit()) => tok
                .parse::<f64>()
                .map(Expr::Number)
                .map_err(|_| syntax_error(self.source, "bad numeric literal")),
            Some(tok) if tok.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_') => {
                Ok(Expr::Aggregate(tok.to_string()))
            }
            Some(_) => Err(syntax_error(self.source, "unexpected token")),
            None => Err(syntax_error(self.source, "unexpected end of formula")),
        }
    }
}

fn syntax_error(source: &str, detail: &str) -> PeerbenchError {
    PeerbenchError::Config(format!("invalid formula {source:?}: {detail}"))
}

/// Parse a formula string into an expression tree.
pub fn parse_formula(source: &str) -> PeerbenchResult<Expr> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(syntax_error(source, "empty formula"));
    }
    let mut parser = Parser::new(trimmed)?;
    let expr = parser.expr()?;
    if parser.peek().is_some() {
        return Err(syntax_error(source, "trailing tokens"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn parses_simple_ratio() {
        let expr = parse_formula("ca / cl").unwrap();
        assert_eq!(
            expr.aggregate_names().into_iter().collect::<Vec<_>>(),
            vec!["ca".to_string(), "cl".to_string()]
        );
        let value = expr
            .eval(&resolved(&[("ca", 3_000_000_000.0), ("cl", 521_000_000.0)]))
            .unwrap();
        assert!((value - 3_000_000_000.0 / 521_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn respects_precedence_and_parens() {
        let expr = parse_formula("a + b * c").unwrap();
        assert_eq!(
            expr.eval(&resolved(&[("a", 1.0), ("b", 2.0), ("c", 3.0)])),
            Some(7.0)
        );
        let expr = parse_formula("(a + b) * c").unwrap();
        assert_eq!(
            expr.eval(&resolved(&[("a", 1.0), ("b", 2.0), ("c", 3.0)])),
            Some(9.0)
        );
    }

    #[test]
    fn unary_minus_and_literals() {
        let expr = parse_formula("-debt / 2.5").unwrap();
        assert_eq!(expr.eval(&resolved(&[("debt", 5.0)])), Some(-2.0));
    }

    /// Division by an exact zero is a null result, not an error.
    #[test]
    fn zero_denominator_is_null() {
        let expr = parse_formula("ca / cl").unwrap();
        assert_eq!(expr.eval(&resolved(&[("ca", 10.0), ("cl", 0.0)])), None);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_formula("").is_err());
        assert!(parse_formula("ca +").is_err());
        assert!(parse_formula("(ca / cl").is_err());
        assert!(parse_formula("ca $ cl").is_err());
        assert!(parse_formula("ca cl").is_err());
    }

    /// Same inputs, same output, every time.
    #[test]
    fn evaluation_is_deterministic() {
        let expr = parse_formula("(rev - cogs) / rev").unwrap();
        let vals = resolved(&[("rev", 812.5), ("cogs", 613.25)]);
        let first = expr.eval(&vals);
        for _ in 0..100 {
            assert_eq!(expr.eval(&vals), first);
        }
    }
}
