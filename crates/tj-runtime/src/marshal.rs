//! Value <-> byte conversion for device buffers.
//!
//! Elements are stored densely in row-major order, little-endian. `bool` uses
//! one byte per element and `float0` occupies no bytes at all.

use tj_core::{AbstractValue, DType, Literal, TensorValue, Value, ValueError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    ByteCount {
        aval: AbstractValue,
        expected: usize,
        actual: usize,
    },
    ShapeOverflow {
        aval: AbstractValue,
    },
    Value(ValueError),
}

impl std::fmt::Display for MarshalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByteCount {
                aval,
                expected,
                actual,
            } => write!(
                f,
                "buffer for {aval} holds {actual} bytes, expected {expected}"
            ),
            Self::ShapeOverflow { aval } => write!(f, "buffer size of {aval} overflows"),
            Self::Value(err) => write!(f, "decoded value is invalid: {err}"),
        }
    }
}

impl std::error::Error for MarshalError {}

impl From<ValueError> for MarshalError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

#[must_use]
pub fn value_to_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Scalar(lit) => {
            let mut out = Vec::with_capacity(lit.dtype().size_bytes());
            push_literal(&mut out, *lit);
            out
        }
        Value::Tensor(tensor) if tensor.dtype == DType::Float0 => Vec::new(),
        Value::Tensor(tensor) => {
            let mut out = Vec::with_capacity(tensor.len() * tensor.dtype.size_bytes());
            for lit in &tensor.elements {
                push_literal(&mut out, *lit);
            }
            out
        }
        Value::Unit | Value::Token => Vec::new(),
    }
}

pub fn value_from_bytes(aval: &AbstractValue, bytes: &[u8]) -> Result<Value, MarshalError> {
    let shaped = match aval {
        AbstractValue::Unit => return Ok(Value::Unit),
        AbstractValue::Token => return Ok(Value::Token),
        AbstractValue::Shaped(shaped) => shaped,
    };

    let expected = shaped
        .size_bytes()
        .ok_or_else(|| MarshalError::ShapeOverflow { aval: aval.clone() })?;
    if bytes.len() != expected {
        return Err(MarshalError::ByteCount {
            aval: aval.clone(),
            expected,
            actual: bytes.len(),
        });
    }

    if shaped.dtype == DType::Float0 {
        return Ok(Value::zeros(aval)?);
    }

    let width = shaped.dtype.size_bytes();
    let elements = bytes
        .chunks_exact(width)
        .map(|chunk| literal_from_le(shaped.dtype, chunk))
        .collect::<Vec<_>>();

    if shaped.shape.rank() == 0 {
        // A scalar always decodes to exactly one element.
        if let [lit] = elements.as_slice() {
            return Ok(Value::Scalar(*lit));
        }
    }
    Ok(Value::Tensor(TensorValue::new(
        shaped.dtype,
        shaped.shape.clone(),
        elements,
    )?))
}

fn push_literal(out: &mut Vec<u8>, lit: Literal) {
    match lit {
        Literal::I32(value) => out.extend_from_slice(&value.to_le_bytes()),
        Literal::I64(value) => out.extend_from_slice(&value.to_le_bytes()),
        Literal::Bool(value) => out.push(u8::from(value)),
        Literal::F32Bits(bits) => out.extend_from_slice(&bits.to_le_bytes()),
        Literal::F64Bits(bits) => out.extend_from_slice(&bits.to_le_bytes()),
    }
}

fn literal_from_le(dtype: DType, chunk: &[u8]) -> Literal {
    let mut wide = [0_u8; 8];
    wide[..chunk.len()].copy_from_slice(chunk);
    let mut narrow = [0_u8; 4];
    narrow.copy_from_slice(&wide[..4]);
    match dtype {
        DType::I32 => Literal::I32(i32::from_le_bytes(narrow)),
        DType::I64 => Literal::I64(i64::from_le_bytes(wide)),
        DType::F32 => Literal::F32Bits(u32::from_le_bytes(narrow)),
        DType::F64 => Literal::F64Bits(u64::from_le_bytes(wide)),
        DType::Bool | DType::Float0 => Literal::Bool(wide[0] != 0),
    }
}
