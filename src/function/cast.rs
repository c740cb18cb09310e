//! Numeric and string casts with range checks. Each cast signature is
//! registered exactly once; an out-of-range cast aborts the query.

use crate::error::{QuiverError, Result};
use crate::vector::{LogicalType, Value};

use super::{unary_kernel, FunctionRegistry};

pub(super) fn register(registry: &mut FunctionRegistry) {
    use LogicalType::*;

    registry.must_register(
        "to_int64",
        vec![Float64],
        Int64,
        unary_kernel(|a| match a {
            Value::Float64(v) => float_to_int(*v),
            _ => Err(QuiverError::Internal("to_int64 on non-DOUBLE".into())),
        }),
    );
    registry.must_register(
        "to_int64",
        vec![String],
        Int64,
        unary_kernel(|a| match a {
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int64)
                .map_err(|_| QuiverError::Runtime(format!("cannot cast '{s}' to INT64"))),
            _ => Err(QuiverError::Internal("to_int64 on non-STRING".into())),
        }),
    );
    registry.must_register(
        "to_int64",
        vec![Bool],
        Int64,
        unary_kernel(|a| Ok(Value::Int64(i64::from(a.as_bool()?)))),
    );

    registry.must_register(
        "to_double",
        vec![Int64],
        Float64,
        unary_kernel(|a| Ok(Value::Float64(a.as_int64()? as f64))),
    );
    registry.must_register(
        "to_double",
        vec![String],
        Float64,
        unary_kernel(|a| match a {
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float64)
                .map_err(|_| QuiverError::Runtime(format!("cannot cast '{s}' to DOUBLE"))),
            _ => Err(QuiverError::Internal("to_double on non-STRING".into())),
        }),
    );

    for ty in [Bool, Int64, Float64] {
        registry.must_register(
            "to_string",
            vec![ty],
            String,
            unary_kernel(|a| Ok(Value::String(a.to_string()))),
        );
    }
}

fn float_to_int(v: f64) -> Result<Value> {
    if !v.is_finite() || v < i64::MIN as f64 || v > i64::MAX as f64 {
        return Err(QuiverError::Runtime(format!(
            "cannot cast {v} to INT64: out of range"
        )));
    }
    Ok(Value::Int64(v as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_cast_checks_range() {
        assert_eq!(float_to_int(41.9).expect("cast"), Value::Int64(41));
        assert!(matches!(float_to_int(f64::NAN), Err(QuiverError::Runtime(_))));
        assert!(matches!(float_to_int(1e300), Err(QuiverError::Runtime(_))));
    }
}
