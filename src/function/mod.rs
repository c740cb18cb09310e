//! Scalar function registry.
//!
//! Kernels are keyed by `(name, argument type tuple)` and populated once
//! at engine start. Unless a function is registered null-tolerant, a null
//! in any argument nulls the result row.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{QuiverError, Result};
use crate::vector::{LogicalType, Value, ValueVector};

mod cast;
mod list;
mod string;

/// Row-level kernel over position-aligned argument vectors.
pub type ScalarKernel =
    Arc<dyn Fn(&[&ValueVector], &[usize], &mut ValueVector) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct ScalarFunction {
    pub result_type: LogicalType,
    /// The registered result type is only a fallback: the real type
    /// depends on runtime values (element extraction from an untyped
    /// LIST). Callers either pin the type per call or re-tag the output
    /// vector from what the kernel produced.
    pub dynamic_result: bool,
    pub kernel: ScalarKernel,
}

impl fmt::Debug for ScalarFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarFunction")
            .field("result_type", &self.result_type)
            .field("dynamic_result", &self.dynamic_result)
            .finish_non_exhaustive()
    }
}

pub struct FunctionRegistry {
    map: HashMap<(String, Vec<LogicalType>), ScalarFunction>,
}

impl FunctionRegistry {
    /// The built-in function set: comparisons and arithmetic over the
    /// primitive types, string and list functions, and the numeric casts
    /// (each cast registered exactly once).
    pub fn standard() -> Self {
        let mut registry = Self {
            map: HashMap::new(),
        };
        registry.register_builtins();
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        args: Vec<LogicalType>,
        result_type: LogicalType,
        kernel: ScalarKernel,
    ) -> Result<()> {
        self.register_inner(name, args, result_type, false, kernel)
    }

    /// Registers a function whose result type is only known at runtime;
    /// `result_type` acts as the fallback tag for empty output.
    pub fn register_dynamic(
        &mut self,
        name: &str,
        args: Vec<LogicalType>,
        result_type: LogicalType,
        kernel: ScalarKernel,
    ) -> Result<()> {
        self.register_inner(name, args, result_type, true, kernel)
    }

    fn register_inner(
        &mut self,
        name: &str,
        args: Vec<LogicalType>,
        result_type: LogicalType,
        dynamic_result: bool,
        kernel: ScalarKernel,
    ) -> Result<()> {
        let key = (name.to_string(), args);
        if self.map.contains_key(&key) {
            return Err(QuiverError::Internal(format!(
                "function {name} registered twice for the same signature"
            )));
        }
        self.map.insert(
            key,
            ScalarFunction {
                result_type,
                dynamic_result,
                kernel,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str, args: &[LogicalType]) -> Result<&ScalarFunction> {
        self.map
            .get(&(name.to_string(), args.to_vec()))
            .ok_or_else(|| {
                QuiverError::Binder(format!(
                    "no function {name}({})",
                    args.iter()
                        .map(|t| t.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    fn register_builtins(&mut self) {
        use LogicalType::*;

        // Comparisons share one value-level kernel per operator.
        for op in ["=", "<>", "<", "<=", ">", ">="] {
            for ty in [Bool, Int64, Float64, String, InternalId] {
                self.must_register(
                    op,
                    vec![ty.clone(), ty.clone()],
                    Bool,
                    compare_kernel(op),
                );
            }
        }

        for (name, int_op, float_op) in [
            ("+", int_add as fn(i64, i64) -> Result<i64>, f64_add as fn(f64, f64) -> f64),
            ("-", int_sub, f64_sub),
            ("*", int_mul, f64_mul),
            ("/", int_div, f64_div),
            ("%", int_rem, f64_rem),
        ] {
            self.must_register(
                name,
                vec![Int64, Int64],
                Int64,
                binary_kernel(move |a, b| {
                    Ok(Value::Int64(int_op(a.as_int64()?, b.as_int64()?)?))
                }),
            );
            self.must_register(
                name,
                vec![Float64, Float64],
                Float64,
                binary_kernel(move |a, b| match (a, b) {
                    (Value::Float64(x), Value::Float64(y)) => Ok(Value::Float64(float_op(*x, *y))),
                    _ => Err(QuiverError::Internal("DOUBLE kernel on non-DOUBLE".into())),
                }),
            );
        }

        self.must_register(
            "AND",
            vec![Bool, Bool],
            Bool,
            binary_kernel(|a, b| Ok(Value::Bool(a.as_bool()? && b.as_bool()?))),
        );
        self.must_register(
            "OR",
            vec![Bool, Bool],
            Bool,
            binary_kernel(|a, b| Ok(Value::Bool(a.as_bool()? || b.as_bool()?))),
        );
        self.must_register(
            "NOT",
            vec![Bool],
            Bool,
            unary_kernel(|a| Ok(Value::Bool(!a.as_bool()?))),
        );

        string::register(self);
        list::register(self);
        cast::register(self);
    }

    /// Built-in registration cannot collide; a collision is an engine
    /// bug caught at startup.
    pub(crate) fn must_register(
        &mut self,
        name: &str,
        args: Vec<LogicalType>,
        result_type: LogicalType,
        kernel: ScalarKernel,
    ) {
        if let Err(err) = self.register(name, args, result_type, kernel) {
            panic!("builtin registration failed: {err}");
        }
    }

    pub(crate) fn must_register_dynamic(
        &mut self,
        name: &str,
        args: Vec<LogicalType>,
        result_type: LogicalType,
        kernel: ScalarKernel,
    ) {
        if let Err(err) = self.register_dynamic(name, args, result_type, kernel) {
            panic!("builtin registration failed: {err}");
        }
    }
}

/// Wraps a value-level binary function with position iteration and the
/// default null rule.
pub fn binary_kernel<F>(f: F) -> ScalarKernel
where
    F: Fn(&Value, &Value) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(move |args, positions, out| {
        let (a, b) = (args[0], args[1]);
        for &pos in positions {
            if a.is_null(pos) || b.is_null(pos) {
                out.set_null(pos);
            } else {
                out.set_value(pos, f(a.value(pos), b.value(pos))?);
            }
        }
        Ok(())
    })
}

pub fn unary_kernel<F>(f: F) -> ScalarKernel
where
    F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(move |args, positions, out| {
        let a = args[0];
        for &pos in positions {
            if a.is_null(pos) {
                out.set_null(pos);
            } else {
                out.set_value(pos, f(a.value(pos))?);
            }
        }
        Ok(())
    })
}

fn compare_kernel(op: &str) -> ScalarKernel {
    let op = op.to_string();
    Arc::new(move |args, positions, out| {
        let (a, b) = (args[0], args[1]);
        for &pos in positions {
            if a.is_null(pos) || b.is_null(pos) {
                out.set_null(pos);
                continue;
            }
            let ordering = compare_values(a.value(pos), b.value(pos))?;
            let keep = match op.as_str() {
                "=" => ordering == std::cmp::Ordering::Equal,
                "<>" => ordering != std::cmp::Ordering::Equal,
                "<" => ordering == std::cmp::Ordering::Less,
                "<=" => ordering != std::cmp::Ordering::Greater,
                ">" => ordering == std::cmp::Ordering::Greater,
                ">=" => ordering != std::cmp::Ordering::Less,
                other => {
                    return Err(QuiverError::Internal(format!(
                        "unknown comparison {other}"
                    )))
                }
            };
            out.set_value(pos, Value::Bool(keep));
        }
        Ok(())
    })
}

pub fn compare_values(a: &Value, b: &Value) -> Result<std::cmp::Ordering> {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (Value::Int64(x), Value::Int64(y)) => Ok(x.cmp(y)),
        (Value::Float64(x), Value::Float64(y)) => {
            Ok(x.partial_cmp(y).unwrap_or(Ordering::Equal))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (
            Value::InternalId { table: ta, offset: oa },
            Value::InternalId { table: tb, offset: ob },
        ) => Ok((ta.0, oa).cmp(&(tb.0, ob))),
        (a, b) => Err(QuiverError::Internal(format!(
            "cannot compare {a:?} with {b:?}"
        ))),
    }
}

fn int_add(a: i64, b: i64) -> Result<i64> {
    a.checked_add(b)
        .ok_or_else(|| QuiverError::Runtime("integer overflow in +".into()))
}

fn int_sub(a: i64, b: i64) -> Result<i64> {
    a.checked_sub(b)
        .ok_or_else(|| QuiverError::Runtime("integer overflow in -".into()))
}

fn int_mul(a: i64, b: i64) -> Result<i64> {
    a.checked_mul(b)
        .ok_or_else(|| QuiverError::Runtime("integer overflow in *".into()))
}

fn int_div(a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        return Err(QuiverError::Runtime("division by zero".into()));
    }
    Ok(a.wrapping_div(b))
}

fn int_rem(a: i64, b: i64) -> Result<i64> {
    if b == 0 {
        return Err(QuiverError::Runtime("division by zero".into()));
    }
    Ok(a.wrapping_rem(b))
}

fn f64_add(a: f64, b: f64) -> f64 {
    a + b
}
fn f64_sub(a: f64, b: f64) -> f64 {
    a - b
}
fn f64_mul(a: f64, b: f64) -> f64 {
    a * b
}
fn f64_div(a: f64, b: f64) -> f64 {
    a / b
}
fn f64_rem(a: f64, b: f64) -> f64 {
    a % b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_of(values: &[Value], ty: LogicalType) -> ValueVector {
        let mut v = ValueVector::new(ty);
        for (i, value) in values.iter().enumerate() {
            v.set_value(i, value.clone());
        }
        v
    }

    #[test]
    fn unknown_signature_is_binder_error() {
        let registry = FunctionRegistry::standard();
        let err = registry
            .lookup("frobnicate", &[LogicalType::Int64])
            .unwrap_err();
        assert!(matches!(err, QuiverError::Binder(_)));
    }

    #[test]
    fn division_by_zero_is_runtime_error() {
        let registry = FunctionRegistry::standard();
        let f = registry
            .lookup("/", &[LogicalType::Int64, LogicalType::Int64])
            .expect("lookup");
        let a = vec_of(&[Value::Int64(4)], LogicalType::Int64);
        let b = vec_of(&[Value::Int64(0)], LogicalType::Int64);
        let mut out = ValueVector::new(LogicalType::Int64);
        let err = (f.kernel)(&[&a, &b], &[0], &mut out).unwrap_err();
        assert!(matches!(err, QuiverError::Runtime(_)));
    }

    #[test]
    fn null_argument_nulls_result() {
        let registry = FunctionRegistry::standard();
        let f = registry
            .lookup("+", &[LogicalType::Int64, LogicalType::Int64])
            .expect("lookup");
        let a = vec_of(&[Value::Int64(1), Value::Null], LogicalType::Int64);
        let b = vec_of(&[Value::Int64(2), Value::Int64(3)], LogicalType::Int64);
        let mut out = ValueVector::new(LogicalType::Int64);
        (f.kernel)(&[&a, &b], &[0, 1], &mut out).expect("eval");
        assert_eq!(out.value(0), &Value::Int64(3));
        assert!(out.is_null(1));
    }
}
