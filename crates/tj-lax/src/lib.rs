#![forbid(unsafe_code)]

mod arithmetic;

use arithmetic::{
    ADD, DIV, MAX, MIN, MUL, SUB, eval_binary_elementwise, eval_neg, eval_unary_float,
};
use std::collections::BTreeMap;
use tj_core::{AbstractValue, DType, Primitive, Shape, ShapedArray, Value, ValueError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    TypeMismatch {
        primitive: Primitive,
        detail: &'static str,
    },
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    /// Primitive has no elementwise rule; structured primitives are
    /// evaluated by the interpreter.
    Unsupported {
        primitive: Primitive,
        detail: String,
    },
    InvalidTensor(ValueError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "arity mismatch for {primitive}: expected {expected}, got {actual}"
                )
            }
            Self::TypeMismatch { primitive, detail } => {
                write!(f, "type mismatch for {primitive}: {detail}")
            }
            Self::ShapeMismatch {
                primitive,
                left,
                right,
            } => {
                write!(f, "shape mismatch for {primitive}: left={left} right={right}")
            }
            Self::Unsupported { primitive, detail } => {
                write!(f, "unsupported {primitive} behavior: {detail}")
            }
            Self::InvalidTensor(err) => write!(f, "invalid tensor: {err}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<ValueError> for EvalError {
    fn from(value: ValueError) -> Self {
        Self::InvalidTensor(value)
    }
}

/// Evaluates one elementwise primitive on concrete values.
///
/// Binary operations broadcast scalars against arrays and otherwise require
/// equal shapes and equal dtypes. Floating-point math for `f32` runs in `f64`
/// and is rounded back per element.
#[inline]
pub fn eval_primitive(
    primitive: Primitive,
    inputs: &[Value],
    _params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    match primitive {
        Primitive::Add => eval_binary_elementwise(primitive, inputs, &ADD),
        Primitive::Sub => eval_binary_elementwise(primitive, inputs, &SUB),
        Primitive::Mul => eval_binary_elementwise(primitive, inputs, &MUL),
        Primitive::Div => eval_binary_elementwise(primitive, inputs, &DIV),
        Primitive::Max => eval_binary_elementwise(primitive, inputs, &MAX),
        Primitive::Min => eval_binary_elementwise(primitive, inputs, &MIN),
        Primitive::Neg => eval_neg(inputs),
        Primitive::Exp => eval_unary_float(primitive, inputs, f64::exp),
        Primitive::Log => eval_unary_float(primitive, inputs, f64::ln),
        Primitive::Sin => eval_unary_float(primitive, inputs, f64::sin),
        Primitive::Cos => eval_unary_float(primitive, inputs, f64::cos),
        Primitive::Sqrt => eval_unary_float(primitive, inputs, f64::sqrt),
        Primitive::XlaCall | Primitive::XlaPmap | Primitive::Cond | Primitive::Outfeed => {
            Err(EvalError::Unsupported {
                primitive,
                detail: "structured primitives are evaluated by the interpreter".to_owned(),
            })
        }
    }
}

/// Output type of an elementwise primitive given its input types.
pub fn abstract_eval(
    primitive: Primitive,
    inputs: &[AbstractValue],
) -> Result<AbstractValue, EvalError> {
    match primitive {
        Primitive::Add
        | Primitive::Sub
        | Primitive::Mul
        | Primitive::Div
        | Primitive::Max
        | Primitive::Min => {
            let [lhs, rhs] = inputs else {
                return Err(EvalError::ArityMismatch {
                    primitive,
                    expected: 2,
                    actual: inputs.len(),
                });
            };
            let lhs = shaped_operand(primitive, lhs)?;
            let rhs = shaped_operand(primitive, rhs)?;
            if lhs.dtype != rhs.dtype {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: "operand dtypes differ",
                });
            }
            let shape = if lhs.shape.rank() == 0 {
                rhs.shape.clone()
            } else if rhs.shape.rank() == 0 || lhs.shape == rhs.shape {
                lhs.shape.clone()
            } else {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: lhs.shape.clone(),
                    right: rhs.shape.clone(),
                });
            };
            Ok(AbstractValue::Shaped(ShapedArray::new(lhs.dtype, shape)))
        }
        Primitive::Neg | Primitive::Exp | Primitive::Log | Primitive::Sin | Primitive::Cos
        | Primitive::Sqrt => {
            let [operand] = inputs else {
                return Err(EvalError::ArityMismatch {
                    primitive,
                    expected: 1,
                    actual: inputs.len(),
                });
            };
            let operand = shaped_operand(primitive, operand)?;
            if primitive != Primitive::Neg && !operand.dtype.is_inexact() {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: "expected floating-point operand",
                });
            }
            Ok(AbstractValue::Shaped(operand.clone()))
        }
        Primitive::XlaCall | Primitive::XlaPmap | Primitive::Cond | Primitive::Outfeed => {
            Err(EvalError::Unsupported {
                primitive,
                detail: "structured primitives are typed by the interpreter".to_owned(),
            })
        }
    }
}

fn shaped_operand(primitive: Primitive, aval: &AbstractValue) -> Result<&ShapedArray, EvalError> {
    match aval {
        AbstractValue::Shaped(shaped)
            if shaped.dtype != DType::Bool && shaped.dtype != DType::Float0 =>
        {
            Ok(shaped)
        }
        AbstractValue::Shaped(_) => Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected numeric operand",
        }),
        AbstractValue::Unit | AbstractValue::Token => Err(EvalError::TypeMismatch {
            primitive,
            detail: "expected array operand",
        }),
    }
}
