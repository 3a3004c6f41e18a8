use tj_core::{Literal, Primitive, Shape, TensorValue, Value};

use crate::EvalError;

/// Integer and float kernels for one binary primitive. Integers are computed
/// in i64 with wrapping semantics and narrowed back to the operand width.
pub(crate) struct BinaryKernel {
    pub int_op: fn(i64, i64) -> i64,
    pub float_op: fn(f64, f64) -> f64,
}

pub(crate) fn eval_binary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    kernel: &BinaryKernel,
) -> Result<Value, EvalError> {
    if inputs.len() != 2 {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 2,
            actual: inputs.len(),
        });
    }

    let op = |lhs: Literal, rhs: Literal| binary_literal_op(primitive, lhs, rhs, kernel);
    match (&inputs[0], &inputs[1]) {
        (Value::Scalar(lhs), Value::Scalar(rhs)) => Ok(Value::Scalar(op(*lhs, *rhs)?)),
        (Value::Tensor(lhs), Value::Tensor(rhs)) => {
            if lhs.shape != rhs.shape {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: lhs.shape.clone(),
                    right: rhs.shape.clone(),
                });
            }
            let elements = lhs
                .elements
                .iter()
                .zip(&rhs.elements)
                .map(|(left, right)| op(*left, *right))
                .collect::<Result<Vec<_>, _>>()?;
            rebuild(lhs, lhs.shape.clone(), elements)
        }
        (Value::Scalar(lhs), Value::Tensor(rhs)) => {
            let elements = rhs
                .elements
                .iter()
                .map(|right| op(*lhs, *right))
                .collect::<Result<Vec<_>, _>>()?;
            rebuild(rhs, rhs.shape.clone(), elements)
        }
        (Value::Tensor(lhs), Value::Scalar(rhs)) => {
            let elements = lhs
                .elements
                .iter()
                .map(|left| op(*left, *rhs))
                .collect::<Result<Vec<_>, _>>()?;
            rebuild(lhs, lhs.shape.clone(), elements)
        }
        _ => Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected array operands",
        }),
    }
}

/// Float-only unary kernel (`exp`, `log`, `sqrt`, trig).
pub(crate) fn eval_unary_float(
    primitive: Primitive,
    inputs: &[Value],
    op: fn(f64) -> f64,
) -> Result<Value, EvalError> {
    map_unary(primitive, inputs, |literal| match literal {
        Literal::F32Bits(bits) => Ok(Literal::from_f32(op(f64::from(f32::from_bits(bits))) as f32)),
        Literal::F64Bits(bits) => Ok(Literal::from_f64(op(f64::from_bits(bits)))),
        _ => Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected floating-point operand",
        }),
    })
}

pub(crate) fn eval_neg(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Neg;
    map_unary(primitive, inputs, |literal| match literal {
        Literal::I32(value) => Ok(Literal::I32(value.wrapping_neg())),
        Literal::I64(value) => Ok(Literal::I64(value.wrapping_neg())),
        Literal::F32Bits(bits) => Ok(Literal::from_f32(-f32::from_bits(bits))),
        Literal::F64Bits(bits) => Ok(Literal::from_f64(-f64::from_bits(bits))),
        Literal::Bool(_) => Err(EvalError::TypeMismatch {
            primitive,
            detail: "cannot negate a boolean",
        }),
    })
}

fn map_unary(
    primitive: Primitive,
    inputs: &[Value],
    op: impl Fn(Literal) -> Result<Literal, EvalError>,
) -> Result<Value, EvalError> {
    if inputs.len() != 1 {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 1,
            actual: inputs.len(),
        });
    }
    match &inputs[0] {
        Value::Scalar(literal) => Ok(Value::Scalar(op(*literal)?)),
        Value::Tensor(tensor) => {
            let elements = tensor
                .elements
                .iter()
                .map(|literal| op(*literal))
                .collect::<Result<Vec<_>, _>>()?;
            rebuild(tensor, tensor.shape.clone(), elements)
        }
        Value::Unit | Value::Token => Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected array operand",
        }),
    }
}

fn rebuild(
    template: &TensorValue,
    shape: Shape,
    elements: Vec<Literal>,
) -> Result<Value, EvalError> {
    Ok(Value::Tensor(TensorValue::new(template.dtype, shape, elements)?))
}

fn binary_literal_op(
    primitive: Primitive,
    lhs: Literal,
    rhs: Literal,
    kernel: &BinaryKernel,
) -> Result<Literal, EvalError> {
    match (lhs, rhs) {
        (Literal::I32(a), Literal::I32(b)) => {
            Ok(Literal::I32((kernel.int_op)(i64::from(a), i64::from(b)) as i32))
        }
        (Literal::I64(a), Literal::I64(b)) => Ok(Literal::I64((kernel.int_op)(a, b))),
        (Literal::F32Bits(a), Literal::F32Bits(b)) => Ok(Literal::from_f32((kernel.float_op)(
            f64::from(f32::from_bits(a)),
            f64::from(f32::from_bits(b)),
        ) as f32)),
        (Literal::F64Bits(a), Literal::F64Bits(b)) => Ok(Literal::from_f64((kernel.float_op)(
            f64::from_bits(a),
            f64::from_bits(b),
        ))),
        (Literal::Bool(_), Literal::Bool(_)) => Err(EvalError::TypeMismatch {
            primitive,
            detail: "boolean arithmetic is not supported",
        }),
        _ => Err(EvalError::TypeMismatch {
            primitive,
            detail: "operand dtypes differ",
        }),
    }
}

pub(crate) const ADD: BinaryKernel = BinaryKernel {
    int_op: i64::wrapping_add,
    float_op: |a, b| a + b,
};

pub(crate) const SUB: BinaryKernel = BinaryKernel {
    int_op: i64::wrapping_sub,
    float_op: |a, b| a - b,
};

pub(crate) const MUL: BinaryKernel = BinaryKernel {
    int_op: i64::wrapping_mul,
    float_op: |a, b| a * b,
};

// Integer division by zero yields 0 rather than trapping.
pub(crate) const DIV: BinaryKernel = BinaryKernel {
    int_op: |a, b| if b == 0 { 0 } else { a.wrapping_div(b) },
    float_op: |a, b| a / b,
};

pub(crate) const MAX: BinaryKernel = BinaryKernel {
    int_op: i64::max,
    float_op: |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) },
};

pub(crate) const MIN: BinaryKernel = BinaryKernel {
    int_op: i64::min,
    float_op: |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) },
};
