//! String functions. `substr` is 1-based and counts characters, not
//! bytes, so multi-byte UTF-8 input slices cleanly.

use crate::error::{QuiverError, Result};
use crate::vector::{LogicalType, Value};

use super::{binary_kernel, FunctionRegistry, ScalarKernel};

pub(super) fn register(registry: &mut FunctionRegistry) {
    use LogicalType::*;

    registry.must_register(
        "substr",
        vec![String, Int64, Int64],
        String,
        substr_kernel(),
    );
    registry.must_register(
        "contains",
        vec![String, String],
        Bool,
        binary_kernel(|a, b| match (a, b) {
            (Value::String(haystack), Value::String(needle)) => {
                Ok(Value::Bool(haystack.contains(needle.as_str())))
            }
            _ => Err(QuiverError::Internal("contains on non-STRING".into())),
        }),
    );
    registry.must_register(
        "concat",
        vec![String, String],
        String,
        binary_kernel(|a, b| match (a, b) {
            (Value::String(x), Value::String(y)) => {
                let mut out = x.clone();
                out.push_str(y);
                Ok(Value::String(out))
            }
            _ => Err(QuiverError::Internal("concat on non-STRING".into())),
        }),
    );
    registry.must_register(
        "lower",
        vec![String],
        String,
        super::unary_kernel(|a| match a {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            _ => Err(QuiverError::Internal("lower on non-STRING".into())),
        }),
    );
    registry.must_register(
        "upper",
        vec![String],
        String,
        super::unary_kernel(|a| match a {
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            _ => Err(QuiverError::Internal("upper on non-STRING".into())),
        }),
    );
}

fn substr_kernel() -> ScalarKernel {
    std::sync::Arc::new(|args, positions, out| {
        let (text, start, len) = (args[0], args[1], args[2]);
        for &pos in positions {
            if text.is_null(pos) || start.is_null(pos) || len.is_null(pos) {
                out.set_null(pos);
                continue;
            }
            let s = match text.value(pos) {
                Value::String(s) => s,
                other => {
                    return Err(QuiverError::Internal(format!(
                        "substr on non-STRING {other:?}"
                    )))
                }
            };
            let start = start.value(pos).as_int64()?;
            let len = len.value(pos).as_int64()?;
            out.set_value(pos, Value::String(substr(s, start, len)?));
        }
        Ok(())
    })
}

/// 1-based, character-counted substring.
fn substr(s: &str, start: i64, len: i64) -> Result<String> {
    if start < 1 {
        return Err(QuiverError::Runtime(format!(
            "substr start position {start} is not positive"
        )));
    }
    if len < 0 {
        return Err(QuiverError::Runtime(format!(
            "substr length {len} is negative"
        )));
    }
    Ok(s
        .chars()
        .skip((start - 1) as usize)
        .take(len as usize)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substr_is_one_based() {
        assert_eq!(substr("hello", 1, 2).expect("substr"), "he");
        assert_eq!(substr("hello", 3, 10).expect("substr"), "llo");
    }

    #[test]
    fn substr_counts_multibyte_characters() {
        let s = "héllo wörld";
        assert_eq!(substr(s, 2, 4).expect("substr"), "éllo");
        assert_eq!(substr(s, 8, 3).expect("substr"), "örl");
    }

    #[test]
    fn substr_rejects_nonpositive_start() {
        assert!(matches!(substr("abc", 0, 1), Err(QuiverError::Runtime(_))));
    }

    #[test]
    fn substr_past_end_is_empty() {
        assert_eq!(substr("abc", 9, 3).expect("substr"), "");
    }
}
