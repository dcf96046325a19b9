//! sqlparser expressions → engine [`Scalar`]s and [`Predicate`]s.

use sqlparser::ast::{self, BinaryOperator, Expr, FunctionArg, FunctionArgExpr, UnaryOperator};

use crate::config::DEFAULT_SERVER_VERSION;
use crate::engine::{AggFunc, ArithOp, CmpOp, Predicate, Projection, Scalar, TableSchema, Value};
use crate::error::{codes, EngineError};
use crate::protocol::MAX_PAYLOAD_LEN;

use super::DATABASE_NAME;

/// Literal → engine value.
pub fn literal(value: &ast::Value) -> Result<Value, EngineError> {
    match value {
        ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::Int(i))
            } else {
                n.parse::<f64>()
                    .map(Value::Real)
                    .map_err(|_| EngineError::parse(format!("Invalid number '{}'", n)))
            }
        }
        ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
            Ok(Value::Text(s.clone()))
        }
        ast::Value::Boolean(b) => Ok(Value::Int(i64::from(*b))),
        ast::Value::Null => Ok(Value::Null),
        other => Err(EngineError::unsupported(format!("Unsupported literal {}", other))),
    }
}

/// Variables listed by `SHOW VARIABLES`; each resolves through
/// [`system_variable`].
pub const SYSTEM_VARIABLES: &[&str] = &[
    "auto_increment_increment",
    "auto_increment_offset",
    "autocommit",
    "character_set_client",
    "character_set_connection",
    "character_set_database",
    "character_set_results",
    "character_set_server",
    "collation_connection",
    "collation_database",
    "collation_server",
    "init_connect",
    "interactive_timeout",
    "license",
    "lower_case_table_names",
    "max_allowed_packet",
    "net_write_timeout",
    "performance_schema",
    "query_cache_size",
    "sql_mode",
    "system_time_zone",
    "time_zone",
    "transaction_isolation",
    "transaction_read_only",
    "tx_isolation",
    "tx_read_only",
    "version",
    "version_comment",
    "wait_timeout",
];

/// Value of a `@@variable`. Names are case-insensitive; a `session.` or
/// `global.` scope prefix is ignored.
pub fn system_variable(name: &str) -> Result<Value, EngineError> {
    let name = name.trim_start_matches('@').to_ascii_lowercase();
    let name = name
        .strip_prefix("session.")
        .or_else(|| name.strip_prefix("global."))
        .or_else(|| name.strip_prefix("local."))
        .unwrap_or(&name);
    let text = |s: &str| Value::Text(s.to_string());
    Ok(match name {
        "version" => text(DEFAULT_SERVER_VERSION),
        "version_comment" => text("zerodb"),
        "max_allowed_packet" => Value::Int(MAX_PAYLOAD_LEN as i64),
        "autocommit" | "auto_increment_increment" | "auto_increment_offset"
        | "lower_case_table_names" => Value::Int(1),
        "character_set_client" | "character_set_connection" | "character_set_results"
        | "character_set_server" | "character_set_database" => text("utf8mb4"),
        "collation_connection" | "collation_server" | "collation_database" => {
            text("utf8mb4_0900_ai_ci")
        }
        "sql_mode" | "init_connect" => text(""),
        "time_zone" | "system_time_zone" => text("UTC"),
        "transaction_isolation" | "tx_isolation" => text("REPEATABLE-READ"),
        "transaction_read_only" | "tx_read_only" | "performance_schema" | "query_cache_size" => {
            Value::Int(0)
        }
        "wait_timeout" | "interactive_timeout" => Value::Int(28_800),
        "net_write_timeout" => Value::Int(60),
        "license" => text("MIT"),
        other => {
            return Err(EngineError::new(
                codes::ER_UNKNOWN_SYSTEM_VARIABLE,
                format!("Unknown system variable '{}'", other),
            ))
        }
    })
}

fn is_variable(ident: &str) -> bool {
    ident.starts_with("@@")
}

/// Scalar expression over the columns of one table.
pub fn scalar(expr: &Expr) -> Result<Scalar, EngineError> {
    match expr {
        Expr::Identifier(id) if is_variable(&id.value) => {
            Ok(Scalar::Literal(system_variable(&id.value)?))
        }
        Expr::Identifier(id) => Ok(Scalar::Column(id.value.clone())),
        Expr::CompoundIdentifier(parts) => {
            let first = parts.first().map(|p| p.value.as_str()).unwrap_or("");
            let last = parts.last().map(|p| p.value.clone()).unwrap_or_default();
            if is_variable(first) {
                Ok(Scalar::Literal(system_variable(&last)?))
            } else {
                Ok(Scalar::Column(last))
            }
        }
        Expr::Value(v) => Ok(Scalar::Literal(literal(v)?)),
        Expr::Nested(inner) => scalar(inner),
        Expr::UnaryOp { op: UnaryOperator::Minus, expr } => Ok(Scalar::Negate(Box::new(scalar(expr)?))),
        Expr::UnaryOp { op: UnaryOperator::Plus, expr } => scalar(expr),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Plus => ArithOp::Add,
                BinaryOperator::Minus => ArithOp::Sub,
                BinaryOperator::Multiply => ArithOp::Mul,
                BinaryOperator::Divide => ArithOp::Div,
                BinaryOperator::Modulo => ArithOp::Mod,
                other => {
                    return Err(EngineError::unsupported(format!(
                        "Operator {} is not supported here",
                        other
                    )))
                }
            };
            Ok(Scalar::Arith { op, left: Box::new(scalar(left)?), right: Box::new(scalar(right)?) })
        }
        Expr::Function(f) if f.args.is_empty() => scalar_function(&function_name(f)),
        other => Err(EngineError::unsupported(format!("Unsupported expression: {}", other))),
    }
}

fn function_name(f: &ast::Function) -> String {
    f.name.to_string().to_ascii_uppercase()
}

fn scalar_function(name: &str) -> Result<Scalar, EngineError> {
    let value = match name {
        "VERSION" => Value::Text(DEFAULT_SERVER_VERSION.to_string()),
        "DATABASE" | "SCHEMA" => Value::Text(DATABASE_NAME.to_string()),
        "USER" | "CURRENT_USER" | "SESSION_USER" | "SYSTEM_USER" => {
            Value::Text("root@localhost".to_string())
        }
        "CONNECTION_ID" => Value::Int(0),
        other => {
            return Err(EngineError::unsupported(format!("Unsupported function {}()", other)))
        }
    };
    Ok(Scalar::Literal(value))
}

/// One select-list entry: a scalar or an aggregate.
pub fn projection(expr: &Expr) -> Result<Projection, EngineError> {
    if let Expr::Function(f) = expr {
        let func = match function_name(f).as_str() {
            "COUNT" => Some(AggFunc::Count),
            "SUM" => Some(AggFunc::Sum),
            "AVG" => Some(AggFunc::Avg),
            "MIN" => Some(AggFunc::Min),
            "MAX" => Some(AggFunc::Max),
            _ => None,
        };
        if let Some(func) = func {
            if f.distinct {
                return Err(EngineError::unsupported("DISTINCT aggregates are not supported"));
            }
            let arg = match f.args.as_slice() {
                [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] if func == AggFunc::Count => None,
                [FunctionArg::Unnamed(FunctionArgExpr::Expr(e))] => Some(scalar(e)?),
                _ => {
                    return Err(EngineError::parse(format!(
                        "Incorrect arguments to {}",
                        f.name
                    )))
                }
            };
            return Ok(Projection::Aggregate { func, arg });
        }
    }
    Ok(Projection::Expr(scalar(expr)?))
}

/// WHERE clause expression.
pub fn predicate(expr: &Expr) -> Result<Predicate, EngineError> {
    match expr {
        Expr::Nested(inner) => predicate(inner),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            Ok(Predicate::And(Box::new(predicate(left)?), Box::new(predicate(right)?)))
        }
        Expr::BinaryOp { left, op: BinaryOperator::Or, right } => {
            Ok(Predicate::Or(Box::new(predicate(left)?), Box::new(predicate(right)?)))
        }
        Expr::BinaryOp { left, op, right } if comparison(op).is_some() => {
            let op = comparison(op).unwrap_or(CmpOp::Eq);
            Ok(Predicate::Compare { left: scalar(left)?, op, right: scalar(right)? })
        }
        Expr::UnaryOp { op: UnaryOperator::Not, expr } => Ok(Predicate::Not(Box::new(predicate(expr)?))),
        Expr::IsNull(e) => Ok(Predicate::IsNull(scalar(e)?)),
        Expr::IsNotNull(e) => Ok(Predicate::IsNotNull(scalar(e)?)),
        Expr::InList { expr, list, negated } => Ok(Predicate::InList {
            expr: scalar(expr)?,
            list: list.iter().map(scalar).collect::<Result<_, _>>()?,
            negated: *negated,
        }),
        Expr::Between { expr, negated, low, high } => {
            let e = scalar(expr)?;
            let range = Predicate::And(
                Box::new(Predicate::Compare { left: e.clone(), op: CmpOp::GtEq, right: scalar(low)? }),
                Box::new(Predicate::Compare { left: e, op: CmpOp::LtEq, right: scalar(high)? }),
            );
            Ok(if *negated { Predicate::Not(Box::new(range)) } else { range })
        }
        Expr::Like { negated, expr, pattern, .. } => match pattern.as_ref() {
            Expr::Value(ast::Value::SingleQuotedString(p))
            | Expr::Value(ast::Value::DoubleQuotedString(p)) => {
                Ok(Predicate::Like { expr: scalar(expr)?, pattern: p.clone(), negated: *negated })
            }
            _ => Err(EngineError::unsupported("LIKE needs a string literal pattern")),
        },
        Expr::Value(ast::Value::Boolean(b)) => Ok(Predicate::Const(*b)),
        Expr::Value(ast::Value::Null) => Ok(Predicate::Const(false)),
        // Bare value: true when non-zero, as MySQL does.
        other => Ok(Predicate::Compare {
            left: scalar(other)?,
            op: CmpOp::NotEq,
            right: Scalar::Literal(Value::Int(0)),
        }),
    }
}

fn comparison(op: &BinaryOperator) -> Option<CmpOp> {
    Some(match op {
        BinaryOperator::Eq => CmpOp::Eq,
        BinaryOperator::NotEq => CmpOp::NotEq,
        BinaryOperator::Lt => CmpOp::Lt,
        BinaryOperator::LtEq => CmpOp::LtEq,
        BinaryOperator::Gt => CmpOp::Gt,
        BinaryOperator::GtEq => CmpOp::GtEq,
        _ => return None,
    })
}

/// Fails with `ER_BAD_FIELD` on the first name `schema` does not have.
/// `clause` names the part of the statement for the message.
pub fn check_columns<'a>(
    schema: &TableSchema,
    names: impl IntoIterator<Item = &'a str>,
    clause: &str,
) -> Result<(), EngineError> {
    for name in names {
        if schema.index_of(name).is_none() {
            return Err(EngineError::new(
                codes::ER_BAD_FIELD,
                format!("Unknown column '{}' in '{}'", name, clause),
            ));
        }
    }
    Ok(())
}

/// Evaluates an expression that must not read any column (INSERT values,
/// table-less SELECT).
pub fn constant(expr: &Expr) -> Result<Value, EngineError> {
    let s = scalar(expr)?;
    let mut cols = Vec::new();
    s.columns(&mut cols);
    if let Some(name) = cols.first() {
        return Err(EngineError::unknown_column(name));
    }
    Ok(s.eval(&TableSchema::default(), &[]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::{dialect::MySqlDialect, parser::Parser};

    fn parse_expr(sql: &str) -> Expr {
        Parser::new(&MySqlDialect {}).try_with_sql(sql).unwrap().parse_expr().unwrap()
    }

    #[test]
    fn literals_and_arithmetic() {
        assert_eq!(constant(&parse_expr("1 + 2 * 3")).unwrap(), Value::Int(7));
        assert_eq!(constant(&parse_expr("-2.5")).unwrap(), Value::Real(-2.5));
        assert_eq!(constant(&parse_expr("'it''s'")).unwrap(), Value::Text("it's".into()));
        assert_eq!(constant(&parse_expr("NULL")).unwrap(), Value::Null);
        assert_eq!(constant(&parse_expr("TRUE")).unwrap(), Value::Int(1));
    }

    #[test]
    fn columns_are_not_constants() {
        let err = constant(&parse_expr("id + 1")).unwrap_err();
        assert_eq!(err.code, codes::ER_BAD_FIELD);
    }

    #[test]
    fn system_variables() {
        assert_eq!(
            constant(&parse_expr("@@version_comment")).unwrap(),
            Value::Text("zerodb".into())
        );
        assert_eq!(system_variable("@@SESSION.autocommit").unwrap(), Value::Int(1));
        for name in SYSTEM_VARIABLES {
            assert!(system_variable(name).is_ok(), "{}", name);
        }
        assert_eq!(
            system_variable("@@nope").unwrap_err().code,
            codes::ER_UNKNOWN_SYSTEM_VARIABLE
        );
    }

    #[test]
    fn where_clauses() {
        let p = predicate(&parse_expr("a > 1 AND (b IS NULL OR c LIKE 'x%')")).unwrap();
        let mut cols = Vec::new();
        p.columns(&mut cols);
        assert_eq!(cols, vec!["a", "b", "c"]);

        let between = predicate(&parse_expr("n NOT BETWEEN 1 AND 3")).unwrap();
        assert!(matches!(between, Predicate::Not(_)));

        let bare = predicate(&parse_expr("flag")).unwrap();
        assert!(matches!(bare, Predicate::Compare { op: CmpOp::NotEq, .. }));
    }

    #[test]
    fn aggregates_in_select_lists() {
        assert_eq!(
            projection(&parse_expr("COUNT(*)")).unwrap(),
            Projection::Aggregate { func: AggFunc::Count, arg: None }
        );
        assert!(matches!(
            projection(&parse_expr("max(age)")).unwrap(),
            Projection::Aggregate { func: AggFunc::Max, arg: Some(_) }
        ));
        assert!(projection(&parse_expr("SUM(*)")).is_err());
        assert_eq!(
            projection(&parse_expr("DATABASE()")).unwrap(),
            Projection::Expr(Scalar::Literal(Value::Text(DATABASE_NAME.into())))
        );
    }
}
