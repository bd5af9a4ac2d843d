//! Evaluator for the `math` instruction.
//!
//! Expressions are evaluated bracket-first: the innermost parenthesised
//! subexpression is extracted into an indexed sub-operation and replaced
//! by a `b:<i>` reference, until none remain. Each operation is then
//! evaluated left to right with no operator precedence.

use regex::Regex;

use super::inst::Fault;

const OPERATORS: [char; 5] = ['+', '-', '*', '/', '%'];

/// Format a double the way process-visible values are stored: always
/// with a fractional part, so `5.0` rather than `5`.
pub fn fmt_double(x: f64) -> String {
    format!("{:?}", x)
}

/// Operand names in evaluation-request order: every token between
/// operators, brackets and `=` (after the leading target) that `is_var`
/// accepts. A name appears once per occurrence.
pub fn operand_vars(expression: &str, is_var: impl Fn(&str) -> bool) -> Vec<String> {
    expression
        .split(['(', ')', '=', '+', '-', '*', '/', '%'])
        .skip(1)
        .filter(|token| !token.is_empty() && is_var(token))
        .map(|token| token.to_string())
        .collect()
}

/// Evaluate an expression whose variables have already been substituted
/// by their values. The `target=` prefix must be stripped.
pub fn evaluate(expression: &str) -> Result<f64, Fault> {
    let mut expression = expression.to_string();
    let mut operations: Vec<String> = Vec::new();

    // Extract brackets innermost-first into the operation list.
    while let Some(close) = expression.find(')') {
        let open = expression[..close]
            .rfind('(')
            .ok_or_else(|| Fault::BadExpression(expression.clone()))?;
        operations.push(expression[open + 1..close].to_string());
        let span = expression[open..=close].to_string();
        expression = expression.replace(&span, &format!("b:{}", operations.len() - 1));
    }
    if expression.contains('(') {
        return Err(Fault::BadExpression(expression));
    }
    operations.push(expression);

    let backref = Regex::new(r"^b:[0-9]+$").expect("backref pattern");
    let mut result = 0.0;
    for i in 0..operations.len() {
        let operation = operations[i].clone();
        let operators: Vec<char> = operation
            .chars()
            .filter(|c| OPERATORS.contains(c))
            .collect();
        let operands: Vec<String> = operation
            .split(OPERATORS)
            .map(|token| {
                // Substitute previously evaluated sub-operations.
                if backref.is_match(token) {
                    let index: usize = token[2..]
                        .parse()
                        .map_err(|_| Fault::BadExpression(token.to_string()))?;
                    operations
                        .get(index)
                        .cloned()
                        .ok_or_else(|| Fault::BadExpression(token.to_string()))
                } else {
                    Ok(token.to_string())
                }
            })
            .collect::<Result<_, Fault>>()?;

        let number = |token: &str| {
            token
                .parse::<f64>()
                .map_err(|_| Fault::BadNumber(token.to_string()))
        };
        result = number(&operands[0])?;
        for (op, operand) in operators.iter().zip(operands.iter().skip(1)) {
            let value = number(operand)?;
            result = match op {
                '+' => result + value,
                '-' => result - value,
                '*' => result * value,
                '/' => result / value,
                '%' => result % value,
                _ => unreachable!(),
            };
        }
        operations[i] = fmt_double(result);
    }
    Ok(result)
}
