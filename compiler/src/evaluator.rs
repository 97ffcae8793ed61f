use std::collections::HashMap;

use indexmap::IndexMap;

use promptl::expression::template_string::{TemplateString, TemplateStringPart};
use promptl::expression::{AssignmentOperator, BinaryOperator, Expression, UnaryOperator};
use promptl::node::attribute::{Attribute, AttributeValue};

use crate::error::{RuntimeError, SpannedError};
use crate::scope::{ScopeId, Scopes};
use crate::value::Value;

/// Evaluate an expression against a scope. Never mutates variables.
pub fn evaluate(expr: &Expression, scopes: &Scopes, scope: ScopeId) -> Result<Value, SpannedError> {
    eval(expr, scopes, scope)
}

/// Apply `target op= value` in `scope`.
pub fn assign(
    target: &str,
    operator: AssignmentOperator,
    value: &Expression,
    scopes: &mut Scopes,
    scope: ScopeId,
) -> Result<(), SpannedError> {
    let rhs = evaluate(value, scopes, scope)?;
    let new_value = match operator.binary() {
        None => rhs,
        Some(op) => {
            let current = scopes.get(scope, target)?.clone();
            eval_binary_op(op, &current, &rhs)?
        }
    };
    scopes.assign(scope, target, new_value);
    Ok(())
}

/// Render a quoted attribute value, interpolating embedded expressions.
pub fn eval_template_string(ts: &TemplateString, scopes: &Scopes, scope: ScopeId) -> Result<String, SpannedError> {
    let mut out = String::new();
    for part in &ts.parts {
        match part {
            TemplateStringPart::Literal(s) => out.push_str(s),
            TemplateStringPart::Expression(expr) => out.push_str(&evaluate(expr, scopes, scope)?.to_string()),
        }
    }
    Ok(out)
}

/// Evaluate every attribute of a tag, in order.
pub fn eval_attributes(
    attributes: &[Attribute],
    scopes: &Scopes,
    scope: ScopeId,
) -> Result<HashMap<String, Value>, SpannedError> {
    let mut out = HashMap::with_capacity(attributes.len());
    for attr in attributes {
        let value = match &attr.value {
            AttributeValue::Text(ts) => Value::String(eval_template_string(ts, scopes, scope)?),
            AttributeValue::Expression(expr) => evaluate(expr, scopes, scope)?,
            AttributeValue::Flag => Value::Bool(true),
        };
        out.insert(attr.name.clone(), value);
    }
    Ok(out)
}

// Nesting depth is bounded at parse time.
fn eval(expr: &Expression, scopes: &Scopes, scope: ScopeId) -> Result<Value, SpannedError> {
    match expr {
        // --- Literals ---
        Expression::NullLiteral => Ok(Value::Null),
        Expression::BooleanLiteral(b) => Ok(Value::Bool(*b)),
        Expression::NumberLiteral(n) => Ok(Value::Number(*n)),
        Expression::StringLiteral(s) => Ok(Value::String(s.clone())),
        Expression::ArrayLiteral(items) => items
            .iter()
            .map(|item| eval(item, scopes, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expression::ObjectLiteral(entries) => {
            let mut map = IndexMap::with_capacity(entries.len());
            for (key, value) in entries {
                map.insert(key.clone(), eval(value, scopes, scope)?);
            }
            Ok(Value::Object(map))
        }

        // --- References ---
        Expression::Identifier(name, span) => scopes
            .get(scope, name)
            .cloned()
            .map_err(|e| SpannedError::at(e, span)),

        Expression::Member {
            object,
            property,
            span,
        } => {
            let object = eval(object, scopes, scope)?;
            member(&object, property).map_err(|e| SpannedError::at(e, span))
        }

        Expression::Index { object, index, span } => {
            let object = eval(object, scopes, scope)?;
            let index = eval(index, scopes, scope)?;
            index_value(&object, &index).map_err(|e| SpannedError::at(e, span))
        }

        Expression::Call {
            callee,
            arguments,
            span,
        } => {
            let function = match eval(callee, scopes, scope)? {
                Value::Function(f) => f,
                other => {
                    let what = match callee.as_ref() {
                        Expression::Identifier(name, _) => format!("'{}'", name),
                        _ => format!("a value of type {}", other.type_name()),
                    };
                    return Err(SpannedError::at(RuntimeError::NotAFunction(what), span));
                }
            };
            let args = arguments
                .iter()
                .map(|arg| eval(arg, scopes, scope))
                .collect::<Result<Vec<_>, _>>()?;
            function.call(&args).map_err(|message| {
                SpannedError::at(
                    RuntimeError::FunctionCall {
                        name: function.name.clone(),
                        message,
                    },
                    span,
                )
            })
        }

        // --- Operations ---
        Expression::UnaryOperation { operator, operand } => {
            let val = eval(operand, scopes, scope)?;
            match operator {
                UnaryOperator::Negation => Ok(Value::Number(-coerce_number(&val)?)),
                UnaryOperator::Plus => Ok(Value::Number(coerce_number(&val)?)),
                UnaryOperator::LogicalNot => Ok(Value::Bool(!val.is_truthy())),
            }
        }

        Expression::BinaryOperation { .. } => eval_operator_chain(expr, scopes, scope),

        Expression::Conditional {
            condition,
            consequent,
            alternate,
        } => {
            if eval(condition, scopes, scope)?.is_truthy() {
                eval(consequent, scopes, scope)
            } else {
                eval(alternate, scopes, scope)
            }
        }
    }
}

/// Evaluate `((a op b) op c) ...` left to right without recursing down the left operands.
fn eval_operator_chain(expr: &Expression, scopes: &Scopes, scope: ScopeId) -> Result<Value, SpannedError> {
    let mut rest = Vec::new();
    let mut first = expr;
    while let Expression::BinaryOperation {
        operator,
        left,
        right,
    } = first
    {
        rest.push((*operator, right.as_ref()));
        first = left;
    }

    let mut acc = eval(first, scopes, scope)?;
    for (operator, right) in rest.into_iter().rev() {
        // Short-circuit operators return one of their operands.
        acc = match operator {
            BinaryOperator::LogicalAnd if !acc.is_truthy() => acc,
            BinaryOperator::LogicalOr if acc.is_truthy() => acc,
            BinaryOperator::NullishCoalescing if !matches!(acc, Value::Null) => acc,
            BinaryOperator::LogicalAnd | BinaryOperator::LogicalOr | BinaryOperator::NullishCoalescing => {
                eval(right, scopes, scope)?
            }
            _ => {
                let r = eval(right, scopes, scope)?;
                eval_binary_op(operator, &acc, &r)?
            }
        };
    }
    Ok(acc)
}

fn member(object: &Value, property: &str) -> Result<Value, RuntimeError> {
    match (object, property) {
        (Value::Object(map), _) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
        (Value::Array(items), "length") => Ok(Value::Number(items.len() as f64)),
        (Value::String(s), "length") => Ok(Value::Number(s.chars().count() as f64)),
        (Value::Null, _) => Err(RuntimeError::TypeError(format!(
            "cannot read property '{}' of null",
            property
        ))),
        _ => Ok(Value::Null),
    }
}

fn index_value(object: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match (object, index) {
        (Value::Array(items), Value::Number(n)) => Ok(as_index(*n)
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(n)) => Ok(as_index(*n)
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        (Value::Object(map), Value::String(key)) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
        (_, Value::String(key)) => member(object, key),
        _ => Err(RuntimeError::TypeError(format!(
            "cannot index {} with {}",
            object.type_name(),
            index.type_name()
        ))),
    }
}

fn as_index(n: f64) -> Option<usize> {
    (n >= 0.0 && n == n.trunc()).then_some(n as usize)
}

fn coerce_number(val: &Value) -> Result<f64, RuntimeError> {
    match val {
        Value::Number(n) => Ok(*n),
        other => Err(RuntimeError::TypeError(format!(
            "expected number, got {}",
            other.type_name()
        ))),
    }
}

pub(crate) fn eval_binary_op(op: BinaryOperator, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match op {
        BinaryOperator::Addition => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", left, right)))
            }
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
            _ => Err(RuntimeError::TypeError(format!(
                "cannot add {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        },
        BinaryOperator::Subtraction => numeric_binop(left, right, |a, b| a - b),
        BinaryOperator::Multiplication => numeric_binop(left, right, |a, b| a * b),
        BinaryOperator::Division => {
            let a = coerce_number(left)?;
            let b = coerce_number(right)?;
            if b == 0.0 {
                return Err(RuntimeError::DivisionByZero);
            }
            Ok(Value::Number(a / b))
        }
        BinaryOperator::Modulo => {
            let a = coerce_number(left)?;
            let b = coerce_number(right)?;
            if b == 0.0 {
                return Err(RuntimeError::DivisionByZero);
            }
            Ok(Value::Number(a % b))
        }
        BinaryOperator::Equality => Ok(Value::Bool(left == right)),
        BinaryOperator::Inequality => Ok(Value::Bool(left != right)),
        BinaryOperator::GreaterThan => compare(left, right, |o| o.is_gt()),
        BinaryOperator::LessThan => compare(left, right, |o| o.is_lt()),
        BinaryOperator::GreaterThanOrEqual => compare(left, right, |o| o.is_ge()),
        BinaryOperator::LessThanOrEqual => compare(left, right, |o| o.is_le()),
        BinaryOperator::LogicalAnd => Ok(if left.is_truthy() { right.clone() } else { left.clone() }),
        BinaryOperator::LogicalOr => Ok(if left.is_truthy() { left.clone() } else { right.clone() }),
        BinaryOperator::NullishCoalescing => Ok(match left {
            Value::Null => right.clone(),
            _ => left.clone(),
        }),
    }
}

fn numeric_binop(left: &Value, right: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, RuntimeError> {
    let a = coerce_number(left)?;
    let b = coerce_number(right)?;
    Ok(Value::Number(f(a, b)))
}

fn compare(left: &Value, right: &Value, f: impl Fn(std::cmp::Ordering) -> bool) -> Result<Value, RuntimeError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => {
            return Err(RuntimeError::TypeError(format!(
                "cannot compare {} with {}",
                left.type_name(),
                right.type_name()
            )));
        }
    };
    // NaN compares false in every direction.
    Ok(Value::Bool(ordering.is_some_and(f)))
}

#[cfg(test)]
mod tests {
    use promptl::parser::expression::{parse_expression, parse_statement};
    use promptl::expression::Statement;

    use super::*;

    fn eval_str(src: &str, vars: &[(&str, Value)]) -> Result<Value, RuntimeError> {
        let mut scopes = Scopes::new();
        let root = scopes.root(vars.iter().map(|(k, v)| (k.to_string(), v.clone())).collect());
        let expr = parse_expression(src, 0, 0).expect("parse failed");
        evaluate(&expr, &scopes, root).map_err(|e| e.error)
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval_str("2 + 3 * 4", &[]), Ok(Value::Number(14.0)));
        assert_eq!(eval_str("(2 + 3) * 4", &[]), Ok(Value::Number(20.0)));
        assert_eq!(eval_str("10 % 4", &[]), Ok(Value::Number(2.0)));
        assert_eq!(eval_str("-x + 1", &[("x", Value::from(3i64))]), Ok(Value::Number(-2.0)));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(eval_str("'a' + 1", &[]), Ok(Value::from("a1")));
        assert_eq!(eval_str("\"x\" + \"y\"", &[]), Ok(Value::from("xy")));
    }

    #[test]
    fn logical_operators_return_operands() {
        assert_eq!(eval_str("null ?? 'd'", &[]), Ok(Value::from("d")));
        assert_eq!(eval_str("0 ?? 'd'", &[]), Ok(Value::Number(0.0)));
        assert_eq!(eval_str("'' || 'fallback'", &[]), Ok(Value::from("fallback")));
        assert_eq!(eval_str("1 && 'second'", &[]), Ok(Value::from("second")));
        // right side never evaluated
        assert_eq!(eval_str("false && missing", &[]), Ok(Value::Bool(false)));
    }

    #[test]
    fn strict_equality() {
        assert_eq!(eval_str("1 == '1'", &[]), Ok(Value::Bool(false)));
        assert_eq!(eval_str("[1, 2] === [1, 2]", &[]), Ok(Value::Bool(true)));
        assert_eq!(eval_str("'a' !== 'b'", &[]), Ok(Value::Bool(true)));
    }

    #[test]
    fn members_and_indexes() {
        let user = Value::from(serde_json::json!({ "name": "Ada", "tags": ["x", "y"] }));
        let vars = [("user", user)];
        assert_eq!(eval_str("user.name", &vars), Ok(Value::from("Ada")));
        assert_eq!(eval_str("user.tags[1]", &vars), Ok(Value::from("y")));
        assert_eq!(eval_str("user['name'].length", &vars), Ok(Value::Number(3.0)));
        assert_eq!(eval_str("user.missing", &vars), Ok(Value::Null));
        assert!(matches!(eval_str("user.missing.deeper", &vars), Err(RuntimeError::TypeError(_))));
    }

    #[test]
    fn calls() {
        let double = Value::function("double", |args| match args {
            [Value::Number(n)] => Ok(Value::Number(n * 2.0)),
            _ => Err("expected one number".into()),
        });
        let vars = [("double", double), ("n", Value::from(2i64))];
        assert_eq!(eval_str("double(n + 1)", &vars), Ok(Value::Number(6.0)));
        assert_eq!(
            eval_str("double()", &vars),
            Err(RuntimeError::FunctionCall {
                name: "double".into(),
                message: "expected one number".into()
            })
        );
        assert_eq!(eval_str("n(1)", &vars), Err(RuntimeError::NotAFunction("'n'".into())));
    }

    #[test]
    fn runtime_errors() {
        assert_eq!(eval_str("1 / 0", &[]), Err(RuntimeError::DivisionByZero));
        assert_eq!(eval_str("nope", &[]), Err(RuntimeError::VariableNotDeclared("nope".into())));
        assert!(matches!(eval_str("1 < 'a'", &[]), Err(RuntimeError::TypeError(_))));
        assert!(matches!(eval_str("-'a'", &[]), Err(RuntimeError::TypeError(_))));
    }

    #[test]
    fn undeclared_variable_error_points_at_the_identifier() {
        let mut scopes = Scopes::new();
        let root = scopes.root(HashMap::new());
        let expr = parse_expression("1 + nope", 10, 0).expect("parse failed");
        let err = evaluate(&expr, &scopes, root).unwrap_err();
        assert_eq!(err.span, Some(14..18));
    }

    #[test]
    fn compound_assignment() {
        let mut scopes = Scopes::new();
        let root = scopes.root(HashMap::new());
        for src in ["total = 1", "total += 4", "total *= 2"] {
            let Statement::Assignment { target, operator, value } = parse_statement(src, 0, 0).expect("parse failed")
            else {
                panic!("expected assignment");
            };
            assign(&target, operator, &value, &mut scopes, root).expect("assign failed");
        }
        assert_eq!(scopes.get(root, "total"), Ok(&Value::Number(10.0)));

        let Statement::Assignment { target, operator, value } = parse_statement("fresh += 1", 0, 0).expect("parse failed")
        else {
            panic!("expected assignment");
        };
        assert_eq!(
            assign(&target, operator, &value, &mut scopes, root).map_err(|e| e.error),
            Err(RuntimeError::VariableNotDeclared("fresh".into()))
        );
    }
}
