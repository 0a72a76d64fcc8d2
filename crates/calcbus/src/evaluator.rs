//! Expression evaluation capability boundary.

use async_trait::async_trait;
use calcbus_wire::{Error, Result};

/// Opaque expression evaluator.
///
/// Evaluation is pure and deterministic given the expression string; no
/// expression may depend on external bindings. Integer and floating-point
/// results alike are normalized to `f64`.
#[async_trait]
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluates `expression`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Evaluation`] for a malformed or unsupported
    /// expression.
    async fn evaluate(&self, expression: &str) -> Result<f64>;
}

/// Evaluates a single binary form `lhs <op> rhs` over `+ - * /`.
///
/// Anything richer (parentheses, chained operators, variables) is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArithmeticEvaluator;

#[async_trait]
impl Evaluator for ArithmeticEvaluator {
    async fn evaluate(&self, expression: &str) -> Result<f64> {
        evaluate_binary(expression)
    }
}

fn evaluate_binary(expression: &str) -> Result<f64> {
    let reject = |reason: &str| Error::Evaluation {
        expression: expression.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = expression.trim();

    // Find the operator: the first of `+ - * /` that follows a digit, so a
    // leading sign on either operand is part of the number, not the split.
    let mut split = None;
    for (i, c) in trimmed.char_indices() {
        if i == 0 || !matches!(c, '+' | '-' | '*' | '/') {
            continue;
        }
        let prev = trimmed[..i].chars().rev().find(|p| !p.is_whitespace());
        if matches!(prev, Some(p) if p.is_ascii_digit() || p == '.') {
            split = Some((i, c));
            break;
        }
    }
    let Some((i, op)) = split else {
        return Err(reject("expected `lhs <op> rhs`"));
    };

    let lhs: f64 = trimmed[..i]
        .trim()
        .parse()
        .map_err(|_| reject("invalid left operand"))?;
    let rhs: f64 = trimmed[i + 1..]
        .trim()
        .parse()
        .map_err(|_| reject("invalid right operand"))?;

    match op {
        '+' => Ok(lhs + rhs),
        '-' => Ok(lhs - rhs),
        '*' => Ok(lhs * rhs),
        '/' if rhs == 0.0 => Err(reject("division by zero")),
        '/' => Ok(lhs / rhs),
        _ => Err(reject("unsupported operator")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evaluates_the_four_operators() {
        let eval = ArithmeticEvaluator;
        assert_eq!(eval.evaluate("2+2").await.unwrap(), 4.0);
        assert_eq!(eval.evaluate("7 - 10").await.unwrap(), -3.0);
        assert_eq!(eval.evaluate("6*7").await.unwrap(), 42.0);
        assert_eq!(eval.evaluate("10/4").await.unwrap(), 2.5);
    }

    #[tokio::test]
    async fn signed_operands_are_part_of_the_number() {
        let eval = ArithmeticEvaluator;
        assert_eq!(eval.evaluate("-3*2").await.unwrap(), -6.0);
        assert_eq!(eval.evaluate("3*-2").await.unwrap(), -6.0);
        assert_eq!(eval.evaluate("1.5 + -0.5").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn nonsense_is_rejected() {
        let eval = ArithmeticEvaluator;
        for expression in ["", "banana", "2+", "+2", "2 & 2", "1+2+3x"] {
            let err = eval.evaluate(expression).await.unwrap_err();
            assert!(matches!(err, Error::Evaluation { .. }), "{expression:?}");
        }
    }

    #[tokio::test]
    async fn division_by_zero_is_rejected() {
        let err = ArithmeticEvaluator.evaluate("1/0").await.unwrap_err();
        assert!(matches!(err, Error::Evaluation { .. }));
    }
}
