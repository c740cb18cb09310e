//! Expression compilation and vectorized evaluation.
//!
//! Registry lookups happen once, when the plan is instantiated; per-batch
//! evaluation only walks the compiled tree and runs kernels over the
//! chunk's selected positions.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{QuiverError, Result};
use crate::exec::plan::BoundExpr;
use crate::function::{FunctionRegistry, ScalarFunction};
use crate::vector::{DataChunk, LogicalType, Value, ValueVector};

pub enum CompiledExpr {
    Column(usize),
    Literal(Value, LogicalType),
    Call {
        function: ScalarFunction,
        args: Vec<CompiledExpr>,
        /// Binder-pinned result type, or the registered fallback.
        result_type: LogicalType,
        /// Re-tag the output vector from the produced values; set for a
        /// dynamic-result function with no binder-pinned type.
        retag_result: bool,
    },
}

impl CompiledExpr {
    pub fn result_type(&self, input_types: &[LogicalType]) -> LogicalType {
        match self {
            CompiledExpr::Column(idx) => input_types[*idx].clone(),
            CompiledExpr::Literal(_, ty) => ty.clone(),
            CompiledExpr::Call { result_type, .. } => result_type.clone(),
        }
    }
}

/// Resolves column types, parameters, and function signatures; fails
/// with a binder error on an unknown `(name, types)` pair or a missing
/// parameter.
pub fn compile(
    expr: &BoundExpr,
    input_types: &[LogicalType],
    registry: &Arc<FunctionRegistry>,
    params: &HashMap<String, Value>,
) -> Result<(CompiledExpr, LogicalType)> {
    match expr {
        BoundExpr::Column(idx) => {
            let ty = input_types.get(*idx).cloned().ok_or_else(|| {
                QuiverError::Binder(format!("column {idx} out of range"))
            })?;
            Ok((CompiledExpr::Column(*idx), ty))
        }
        BoundExpr::Literal(value) => {
            let ty = value.logical_type().unwrap_or(LogicalType::Int64);
            Ok((CompiledExpr::Literal(value.clone(), ty.clone()), ty))
        }
        BoundExpr::Parameter(name) => {
            let value = params.get(name).ok_or_else(|| {
                QuiverError::Binder(format!("missing parameter ${name}"))
            })?;
            let ty = value.logical_type().unwrap_or(LogicalType::Int64);
            Ok((CompiledExpr::Literal(value.clone(), ty.clone()), ty))
        }
        BoundExpr::Call { name, args, result } => {
            let mut compiled_args = Vec::with_capacity(args.len());
            let mut arg_types = Vec::with_capacity(args.len());
            for arg in args {
                let (compiled, ty) = compile(arg, input_types, registry, params)?;
                compiled_args.push(compiled);
                arg_types.push(ty);
            }
            let function = registry.lookup(name, &arg_types)?.clone();
            let (ty, retag_result) = match result {
                Some(ty) => (ty.clone(), false),
                None => (function.result_type.clone(), function.dynamic_result),
            };
            Ok((
                CompiledExpr::Call {
                    function,
                    args: compiled_args,
                    result_type: ty.clone(),
                    retag_result,
                },
                ty,
            ))
        }
    }
}

/// Evaluates the expression over the chunk's selected positions into a
/// position-aligned vector.
pub fn evaluate(expr: &CompiledExpr, chunk: &DataChunk) -> Result<ValueVector> {
    match expr {
        CompiledExpr::Column(idx) => Ok(chunk.vectors[*idx].clone()),
        CompiledExpr::Literal(value, ty) => {
            let mut out = ValueVector::new(ty.clone());
            for pos in chunk.state.selected() {
                out.set_value(pos, value.clone());
            }
            Ok(out)
        }
        CompiledExpr::Call {
            function,
            args,
            result_type,
            retag_result,
        } => {
            let arg_vectors: Vec<ValueVector> = args
                .iter()
                .map(|arg| evaluate(arg, chunk))
                .collect::<Result<_>>()?;
            let arg_refs: Vec<&ValueVector> = arg_vectors.iter().collect();
            let mut out = ValueVector::new(result_type.clone());
            let positions = chunk.state.selected();
            (function.kernel)(&arg_refs, &positions, &mut out)?;
            if *retag_result {
                out.retag_from_values(&positions);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::ChunkState;

    fn chunk_of_ints(values: &[i64]) -> DataChunk {
        let mut chunk = DataChunk::new(&[LogicalType::Int64]);
        for (i, v) in values.iter().enumerate() {
            chunk.vectors[0].set_value(i, Value::Int64(*v));
        }
        chunk.state = ChunkState::unflat(values.len());
        chunk
    }

    #[test]
    fn compiles_and_evaluates_nested_calls() {
        let registry = Arc::new(FunctionRegistry::standard());
        let expr = BoundExpr::call(
            ">",
            vec![
                BoundExpr::call(
                    "+",
                    vec![BoundExpr::Column(0), BoundExpr::Literal(Value::Int64(1))],
                ),
                BoundExpr::Literal(Value::Int64(3)),
            ],
        );
        let chunk = chunk_of_ints(&[1, 2, 3]);
        let (compiled, ty) =
            compile(&expr, &[LogicalType::Int64], &registry, &HashMap::new()).expect("compile");
        assert_eq!(ty, LogicalType::Bool);
        let out = evaluate(&compiled, &chunk).expect("evaluate");
        assert_eq!(out.value(0), &Value::Bool(false));
        assert_eq!(out.value(1), &Value::Bool(false));
        assert_eq!(out.value(2), &Value::Bool(true));
    }

    #[test]
    fn unknown_function_is_binder_error() {
        let registry = Arc::new(FunctionRegistry::standard());
        let expr = BoundExpr::call("nope", vec![BoundExpr::Column(0)]);
        assert!(matches!(
            compile(&expr, &[LogicalType::Int64], &registry, &HashMap::new()),
            Err(QuiverError::Binder(_))
        ));
    }

    #[test]
    fn parameters_substitute_at_compile_time() {
        let registry = Arc::new(FunctionRegistry::standard());
        let expr = BoundExpr::call(
            "=",
            vec![BoundExpr::Column(0), BoundExpr::Parameter("age".into())],
        );
        let mut params = HashMap::new();
        params.insert("age".to_string(), Value::Int64(2));
        let (compiled, _) =
            compile(&expr, &[LogicalType::Int64], &registry, &params).expect("compile");
        let chunk = chunk_of_ints(&[1, 2]);
        let out = evaluate(&compiled, &chunk).expect("evaluate");
        assert_eq!(out.value(1), &Value::Bool(true));

        assert!(matches!(
            compile(&expr, &[LogicalType::Int64], &registry, &HashMap::new()),
            Err(QuiverError::Binder(_))
        ));
    }
}
