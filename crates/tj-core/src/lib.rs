#![forbid(unsafe_code)]

#[cfg(test)]
pub mod proptest_strategies;
pub mod visit;

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
    /// Zero-width tangent type. Carries a shape but no data.
    Float0,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Bool => "bool",
            Self::Float0 => "float0",
        }
    }

    /// Floating-point types eligible for NaN/Inf inspection.
    #[must_use]
    pub fn is_inexact(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[must_use]
    pub fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
            Self::Bool => 1,
            Self::Float0 => 0,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_char('[')?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_char(',')?;
            }
            write!(f, "{dim}")?;
        }
        f.write_char(']')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapedArray {
    pub dtype: DType,
    pub shape: Shape,
}

impl ShapedArray {
    #[must_use]
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, Shape::scalar())
    }

    /// Number of bytes a dense buffer of this type occupies.
    #[must_use]
    pub fn size_bytes(&self) -> Option<usize> {
        let count = usize::try_from(self.shape.element_count()?).ok()?;
        count.checked_mul(self.dtype.size_bytes())
    }
}

impl std::fmt::Display for ShapedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// Tag identifying which family an abstract value belongs to. Result
/// handlers are registered per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AvalKind {
    Unit,
    Token,
    ShapedArray,
}

impl AvalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unit => "AbstractUnit",
            Self::Token => "AbstractToken",
            Self::ShapedArray => "ShapedArray",
        }
    }
}

impl std::fmt::Display for AvalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural description of a value, independent of its data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbstractValue {
    Unit,
    Token,
    Shaped(ShapedArray),
}

impl AbstractValue {
    #[must_use]
    pub fn shaped(dtype: DType, shape: Shape) -> Self {
        Self::Shaped(ShapedArray::new(dtype, shape))
    }

    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self::Shaped(ShapedArray::scalar(dtype))
    }

    #[must_use]
    pub fn kind(&self) -> AvalKind {
        match self {
            Self::Unit => AvalKind::Unit,
            Self::Token => AvalKind::Token,
            Self::Shaped(_) => AvalKind::ShapedArray,
        }
    }

    #[must_use]
    pub fn as_shaped(&self) -> Option<&ShapedArray> {
        match self {
            Self::Shaped(shaped) => Some(shaped),
            Self::Unit | Self::Token => None,
        }
    }
}

impl std::fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit => f.write_str("*"),
            Self::Token => f.write_str("AbstractToken()"),
            Self::Shaped(shaped) => write!(f, "ShapedArray({shaped})"),
        }
    }
}

/// Structural type equality used by the call-time safety check.
#[must_use]
pub fn typematch(expected: &AbstractValue, actual: &AbstractValue) -> bool {
    match (expected, actual) {
        (AbstractValue::Unit, AbstractValue::Unit)
        | (AbstractValue::Token, AbstractValue::Token) => true,
        (AbstractValue::Shaped(a), AbstractValue::Shaped(b)) => {
            a.dtype == b.dtype && a.shape == b.shape
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Primitive {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Neg,
    Exp,
    Log,
    Sin,
    Cos,
    Sqrt,
    /// Nested call of a sub-program (`sub_jaxprs[0]`).
    XlaCall,
    /// Replica-mapped call: `axis_size` copies of `sub_jaxprs[0]` over the leading axis.
    XlaPmap,
    /// Branch selection: `sub_jaxprs[i]` chosen by the first operand.
    Cond,
    /// Emits its operands on the out-of-band channel; threads a token.
    Outfeed,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
            Self::Neg => "neg",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Sqrt => "sqrt",
            Self::XlaCall => "xla_call",
            Self::XlaPmap => "xla_pmap",
            Self::Cond => "cond",
            Self::Outfeed => "outfeed",
        }
    }

    /// Call-style primitives carrying their body as a `call_jaxpr`.
    #[must_use]
    pub fn has_call_jaxpr(self) -> bool {
        matches!(self, Self::XlaCall | Self::XlaPmap)
    }

    /// Replica-introducing constructs multiply their body's replica count by
    /// their `axis_size`.
    #[must_use]
    pub fn introduces_replicas(self) -> bool {
        matches!(self, Self::XlaPmap)
    }

    /// Control-flow primitives whose bodies are passed as ordinary params.
    #[must_use]
    pub fn is_initial_style(self) -> bool {
        matches!(self, Self::Cond)
    }

    #[must_use]
    pub fn multiple_results(self) -> bool {
        matches!(self, Self::XlaCall | Self::XlaPmap | Self::Cond)
    }

    #[must_use]
    pub fn requires_subprograms(self) -> bool {
        self.has_call_jaxpr() || self.is_initial_style()
    }
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I32(i32),
    I64(i64),
    Bool(bool),
    F32Bits(u32),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f32(value: f32) -> Self {
        Self::F32Bits(value.to_bits())
    }

    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn zero(dtype: DType) -> Self {
        match dtype {
            DType::F32 => Self::F32Bits(0),
            DType::F64 => Self::F64Bits(0),
            DType::I32 => Self::I32(0),
            DType::I64 => Self::I64(0),
            DType::Bool | DType::Float0 => Self::Bool(false),
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F32Bits(_) => DType::F32,
            Self::F64Bits(_) => DType::F64,
        }
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F32Bits(bits) => Some(f64::from(f32::from_bits(bits))),
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I32(value) => Some(f64::from(value)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I32(value) => Some(i64::from(value)),
            Self::I64(value) => Some(value),
            Self::Bool(value) => Some(i64::from(value)),
            Self::F32Bits(_) | Self::F64Bits(_) => None,
        }
    }

    /// True for NaN floating-point literals.
    #[must_use]
    pub fn is_nan(self) -> bool {
        match self {
            Self::F32Bits(bits) => f32::from_bits(bits).is_nan(),
            Self::F64Bits(bits) => f64::from_bits(bits).is_nan(),
            _ => false,
        }
    }

    /// True for infinite floating-point literals.
    #[must_use]
    pub fn is_infinite(self) -> bool {
        match self {
            Self::F32Bits(bits) => f32::from_bits(bits).is_infinite(),
            Self::F64Bits(bits) => f64::from_bits(bits).is_infinite(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
    Unit,
    Token,
}

impl Value {
    #[must_use]
    pub fn scalar_f32(value: f32) -> Self {
        Self::Scalar(Literal::from_f32(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_i32(value: i32) -> Self {
        Self::Scalar(Literal::I32(value))
    }

    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    pub fn vector_f32(values: &[f32]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::from_f32).collect();
        Ok(Self::Tensor(TensorValue::new(
            DType::F32,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::from_f64).collect();
        Ok(Self::Tensor(TensorValue::new(
            DType::F64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect();
        Ok(Self::Tensor(TensorValue::new(
            DType::I64,
            Shape::vector(values.len() as u32),
            elements,
        )?))
    }

    /// Builds a value of the given abstract type filled with zeros.
    pub fn zeros(aval: &AbstractValue) -> Result<Self, ValueError> {
        match aval {
            AbstractValue::Unit => Ok(Self::Unit),
            AbstractValue::Token => Ok(Self::Token),
            AbstractValue::Shaped(shaped)
                if shaped.shape.rank() == 0 && shaped.dtype != DType::Float0 =>
            {
                Ok(Self::Scalar(Literal::zero(shaped.dtype)))
            }
            AbstractValue::Shaped(shaped) => {
                Ok(Self::Tensor(TensorValue::zeros(shaped.dtype, shaped.shape.clone())?))
            }
        }
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(_) | Self::Unit | Self::Token => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_scalar_literal().and_then(Literal::as_f64)
    }

    #[must_use]
    pub fn as_i64_scalar(&self) -> Option<i64> {
        self.as_scalar_literal().and_then(Literal::as_i64)
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::Scalar(_) | Self::Unit | Self::Token => None,
        }
    }

    #[must_use]
    pub fn is_token(&self) -> bool {
        matches!(self, Self::Token)
    }

    #[must_use]
    pub fn aval(&self) -> AbstractValue {
        match self {
            Self::Scalar(lit) => AbstractValue::scalar(lit.dtype()),
            Self::Tensor(tensor) => AbstractValue::shaped(tensor.dtype, tensor.shape.clone()),
            Self::Unit => AbstractValue::Unit,
            Self::Token => AbstractValue::Token,
        }
    }

    /// Every element literal of an array value; empty for unit/token.
    #[must_use]
    pub fn literals(&self) -> &[Literal] {
        match self {
            Self::Scalar(lit) => std::slice::from_ref(lit),
            Self::Tensor(tensor) => &tensor.elements,
            Self::Unit | Self::Token => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    pub fn zeros(dtype: DType, shape: Shape) -> Result<Self, ValueError> {
        let count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;
        let count = usize::try_from(count).map_err(|_| ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;
        Self::new(dtype, shape, vec![Literal::zero(dtype); count])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn leading_dim(&self) -> Option<u32> {
        self.shape.dims.first().copied()
    }

    pub fn slice_axis0(&self, index: usize) -> Result<Value, ValueError> {
        let axis_size = self
            .leading_dim()
            .ok_or(ValueError::RankZeroAxisSliceUnsupported)?;
        if index >= axis_size as usize {
            return Err(ValueError::SliceIndexOutOfBounds {
                index,
                axis_size: axis_size as usize,
            });
        }

        if self.rank() == 1 {
            return Ok(Value::Scalar(self.elements[index]));
        }

        let slice_len = self.shape.dims[1..]
            .iter()
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim as usize))
            .ok_or(ValueError::ShapeOverflow {
                shape: self.shape.clone(),
            })?;
        let start = index * slice_len;
        let elements = self.elements[start..start + slice_len].to_vec();
        let subshape = Shape {
            dims: self.shape.dims[1..].to_vec(),
        };
        Ok(Value::Tensor(TensorValue::new(self.dtype, subshape, elements)?))
    }

    pub fn stack_axis0(slices: &[Value]) -> Result<Self, ValueError> {
        let Some(first) = slices.first() else {
            return Err(ValueError::EmptyAxisStack);
        };
        let first_aval = first.aval();
        let AbstractValue::Shaped(inner) = &first_aval else {
            return Err(ValueError::NonArrayStack);
        };

        let mut elements = Vec::with_capacity(slices.len() * first.literals().len());
        for value in slices {
            let aval = value.aval();
            if aval != first_aval {
                return Err(ValueError::AxisStackMismatch {
                    expected: first_aval.clone(),
                    actual: aval,
                });
            }
            elements.extend_from_slice(value.literals());
        }

        let mut dims = Vec::with_capacity(inner.shape.rank() + 1);
        dims.push(slices.len() as u32);
        dims.extend_from_slice(&inner.shape.dims);
        TensorValue::new(inner.dtype, Shape { dims }, elements)
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }

    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.elements.iter().copied().map(Literal::as_i64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    RankZeroAxisSliceUnsupported,
    SliceIndexOutOfBounds {
        index: usize,
        axis_size: usize,
    },
    EmptyAxisStack,
    NonArrayStack,
    AxisStackMismatch {
        expected: AbstractValue,
        actual: AbstractValue,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {shape}")
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => {
                write!(
                    f,
                    "tensor element count mismatch for shape {shape}: expected {expected_count}, got {actual_count}"
                )
            }
            Self::RankZeroAxisSliceUnsupported => {
                write!(f, "cannot axis-slice rank-0 scalar tensor")
            }
            Self::SliceIndexOutOfBounds { index, axis_size } => {
                write!(
                    f,
                    "axis-slice index {index} out of bounds for axis size {axis_size}"
                )
            }
            Self::EmptyAxisStack => write!(f, "cannot stack empty slice list"),
            Self::NonArrayStack => write!(f, "only array values can be stacked"),
            Self::AxisStackMismatch { expected, actual } => {
                write!(f, "stack type mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for ValueError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Var(VarId),
    Lit(Literal),
}

impl Atom {
    #[must_use]
    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Self::Var(var) => Some(*var),
            Self::Lit(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub primitive: Primitive,
    pub inputs: SmallVec<[Atom; 4]>,
    pub outputs: SmallVec<[VarId; 2]>,
    pub params: BTreeMap<String, String>,
    /// Nested programs: the `call_jaxpr` of call-style primitives, or the
    /// branches of `cond`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_jaxprs: Vec<Jaxpr>,
}

impl Equation {
    #[must_use]
    pub fn new(primitive: Primitive, inputs: &[Atom], outputs: &[VarId]) -> Self {
        Self {
            primitive,
            inputs: inputs.iter().cloned().collect(),
            outputs: outputs.iter().copied().collect(),
            params: BTreeMap::new(),
            sub_jaxprs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_sub_jaxpr(mut self, jaxpr: Jaxpr) -> Self {
        self.sub_jaxprs.push(jaxpr);
        self
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parsed `axis_size` parameter, if present and well-formed.
    #[must_use]
    pub fn axis_size(&self) -> Option<usize> {
        self.param("axis_size")?.trim().parse::<usize>().ok()
    }

    /// The `call_jaxpr` body of call-style primitives.
    #[must_use]
    pub fn call_jaxpr(&self) -> Option<&Jaxpr> {
        if self.primitive.has_call_jaxpr() {
            self.sub_jaxprs.first()
        } else {
            None
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Jaxpr {
    pub invars: Vec<VarId>,
    pub constvars: Vec<VarId>,
    pub outvars: Vec<Atom>,
    pub equations: Vec<Equation>,
    #[serde(skip)]
    fingerprint_cache: std::sync::OnceLock<String>,
}

impl Clone for Jaxpr {
    fn clone(&self) -> Self {
        Self::new(
            self.invars.clone(),
            self.constvars.clone(),
            self.outvars.clone(),
            self.equations.clone(),
        )
    }
}

impl PartialEq for Jaxpr {
    fn eq(&self, other: &Self) -> bool {
        self.invars == other.invars
            && self.constvars == other.constvars
            && self.outvars == other.outvars
            && self.equations == other.equations
    }
}

impl Eq for Jaxpr {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JaxprValidationError {
    DuplicateBinding {
        section: &'static str,
        var: VarId,
    },
    UnboundInputVar {
        equation_index: usize,
        var: VarId,
    },
    OutputShadowsBinding {
        equation_index: usize,
        var: VarId,
    },
    UnknownOutvar {
        var: VarId,
    },
    MissingSubprogram {
        equation_index: usize,
        primitive: Primitive,
    },
    MalformedParam {
        equation_index: usize,
        key: &'static str,
    },
    NestedProgram {
        equation_index: usize,
        source: Box<JaxprValidationError>,
    },
}

impl std::fmt::Display for JaxprValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateBinding { section, var } => {
                write!(f, "duplicate binding in {section} for var {var}")
            }
            Self::UnboundInputVar {
                equation_index,
                var,
            } => {
                write!(
                    f,
                    "equation {equation_index} references unbound input var {var}"
                )
            }
            Self::OutputShadowsBinding {
                equation_index,
                var,
            } => {
                write!(
                    f,
                    "equation {equation_index} output var {var} shadows an existing binding"
                )
            }
            Self::UnknownOutvar { var } => {
                write!(f, "outvar {var} does not have a defining binding")
            }
            Self::MissingSubprogram {
                equation_index,
                primitive,
            } => {
                write!(
                    f,
                    "equation {equation_index} ({primitive}) has no nested program"
                )
            }
            Self::MalformedParam {
                equation_index,
                key,
            } => {
                write!(f, "equation {equation_index} has a malformed `{key}` param")
            }
            Self::NestedProgram {
                equation_index,
                source,
            } => {
                write!(f, "nested program of equation {equation_index}: {source}")
            }
        }
    }
}

impl std::error::Error for JaxprValidationError {}

impl Jaxpr {
    #[must_use]
    pub fn new(
        invars: Vec<VarId>,
        constvars: Vec<VarId>,
        outvars: Vec<Atom>,
        equations: Vec<Equation>,
    ) -> Self {
        Self {
            invars,
            constvars,
            outvars,
            equations,
            fingerprint_cache: std::sync::OnceLock::new(),
        }
    }

    #[must_use]
    pub fn canonical_fingerprint(&self) -> &str {
        self.fingerprint_cache.get_or_init(|| {
            let mut out = String::new();
            write_var_list(&mut out, "in", &self.invars);
            write_var_list(&mut out, "const", &self.constvars);
            out.push_str("out=[");
            for atom in &self.outvars {
                write_atom(&mut out, atom);
                out.push(',');
            }
            out.push(']');

            for eqn in &self.equations {
                let _ = write!(&mut out, "eqn:{}(", eqn.primitive.as_str());
                for atom in &eqn.inputs {
                    write_atom(&mut out, atom);
                    out.push(',');
                }
                out.push_str(")->");
                for outvar in &eqn.outputs {
                    let _ = write!(&mut out, "{outvar},");
                }
                out.push('{');
                for (key, value) in &eqn.params {
                    let _ = write!(&mut out, "{key}={value};");
                }
                out.push('}');
                for sub in &eqn.sub_jaxprs {
                    let _ = write!(&mut out, "sub[{}]", sub.canonical_fingerprint());
                }
                out.push('|');
            }

            out
        })
    }

    /// Checks that every referenced variable is bound before use, that no
    /// binding is shadowed, and that nested programs are themselves valid.
    pub fn validate_well_formed(&self) -> Result<(), JaxprValidationError> {
        let mut bindings = BTreeSet::new();

        for var in &self.invars {
            if !bindings.insert(*var) {
                return Err(JaxprValidationError::DuplicateBinding {
                    section: "invars",
                    var: *var,
                });
            }
        }
        for var in &self.constvars {
            if !bindings.insert(*var) {
                return Err(JaxprValidationError::DuplicateBinding {
                    section: "constvars",
                    var: *var,
                });
            }
        }

        for (equation_index, eqn) in self.equations.iter().enumerate() {
            for atom in &eqn.inputs {
                if let Atom::Var(var) = atom
                    && !bindings.contains(var)
                {
                    return Err(JaxprValidationError::UnboundInputVar {
                        equation_index,
                        var: *var,
                    });
                }
            }
            if eqn.primitive.requires_subprograms() && eqn.sub_jaxprs.is_empty() {
                return Err(JaxprValidationError::MissingSubprogram {
                    equation_index,
                    primitive: eqn.primitive,
                });
            }
            if eqn.primitive.introduces_replicas() && eqn.axis_size().is_none() {
                return Err(JaxprValidationError::MalformedParam {
                    equation_index,
                    key: "axis_size",
                });
            }
            for sub in &eqn.sub_jaxprs {
                sub.validate_well_formed()
                    .map_err(|source| JaxprValidationError::NestedProgram {
                        equation_index,
                        source: Box::new(source),
                    })?;
            }
            for out_var in &eqn.outputs {
                if !bindings.insert(*out_var) {
                    return Err(JaxprValidationError::OutputShadowsBinding {
                        equation_index,
                        var: *out_var,
                    });
                }
            }
        }

        for outvar in &self.outvars {
            if let Atom::Var(var) = outvar
                && !bindings.contains(var)
            {
                return Err(JaxprValidationError::UnknownOutvar { var: *var });
            }
        }

        Ok(())
    }
}

fn write_var_list(out: &mut String, label: &str, vars: &[VarId]) {
    let _ = write!(out, "{label}=[");
    for var in vars {
        let _ = write!(out, "{var},");
    }
    out.push(']');
}

fn write_atom(out: &mut String, atom: &Atom) {
    match atom {
        Atom::Var(var) => {
            let _ = write!(out, "{var}");
        }
        Atom::Lit(lit) => write_literal(out, *lit),
    }
}

fn write_literal(out: &mut String, lit: Literal) {
    let _ = match lit {
        Literal::I32(value) => write!(out, "i32:{value}"),
        Literal::I64(value) => write!(out, "i64:{value}"),
        Literal::Bool(value) => write!(out, "bool:{value}"),
        Literal::F32Bits(bits) => write!(out, "f32bits:{bits}"),
        Literal::F64Bits(bits) => write!(out, "f64bits:{bits}"),
    };
}

/// A program together with the concrete values bound to its constvars.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClosedJaxpr {
    pub jaxpr: Jaxpr,
    pub consts: Vec<Value>,
    #[serde(skip)]
    digest_cache: std::sync::OnceLock<String>,
}

impl Clone for ClosedJaxpr {
    fn clone(&self) -> Self {
        Self {
            jaxpr: self.jaxpr.clone(),
            consts: self.consts.clone(),
            digest_cache: std::sync::OnceLock::new(),
        }
    }
}

impl PartialEq for ClosedJaxpr {
    fn eq(&self, other: &Self) -> bool {
        self.jaxpr == other.jaxpr && self.consts == other.consts
    }
}

impl Eq for ClosedJaxpr {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstArityError {
    pub expected: usize,
    pub actual: usize,
}

impl std::fmt::Display for ConstArityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "program declares {} constvars but {} constants were bound",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for ConstArityError {}

impl ClosedJaxpr {
    pub fn new(jaxpr: Jaxpr, consts: Vec<Value>) -> Result<Self, ConstArityError> {
        if jaxpr.constvars.len() != consts.len() {
            return Err(ConstArityError {
                expected: jaxpr.constvars.len(),
                actual: consts.len(),
            });
        }
        Ok(Self {
            jaxpr,
            consts,
            digest_cache: std::sync::OnceLock::new(),
        })
    }

    /// Wraps a program that closes over no constants.
    #[must_use]
    pub fn open(jaxpr: Jaxpr) -> Self {
        Self {
            jaxpr,
            consts: Vec::new(),
            digest_cache: std::sync::OnceLock::new(),
        }
    }

    /// The program's content digest, computed by `compute` on first use and
    /// kept for the lifetime of this value. Clones start without one, so
    /// edit a clone rather than a program that has already been digested.
    pub fn digest_with(&self, compute: impl FnOnce(&Self) -> String) -> &str {
        self.digest_cache.get_or_init(|| compute(self))
    }

    /// `(constvar, value)` pairs in declaration order.
    pub fn const_bindings(&self) -> impl Iterator<Item = (VarId, &Value)> {
        self.jaxpr.constvars.iter().copied().zip(self.consts.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramSpec {
    Add2,
    Sub2,
    Mul2,
    Square,
    SquarePlusLinear,
    AddOne,
    SinX,
    ExpX,
    /// `x + x`, ignoring its second input.
    IgnoreSecond,
    /// Returns its only input without any equation.
    Identity,
}

#[must_use]
pub fn build_program(spec: ProgramSpec) -> Jaxpr {
    match spec {
        ProgramSpec::Add2 => binary_program(Primitive::Add),
        ProgramSpec::Sub2 => binary_program(Primitive::Sub),
        ProgramSpec::Mul2 => binary_program(Primitive::Mul),
        ProgramSpec::Square => Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![Atom::Var(VarId(2))],
            vec![Equation::new(
                Primitive::Mul,
                &[Atom::Var(VarId(1)), Atom::Var(VarId(1))],
                &[VarId(2)],
            )],
        ),
        ProgramSpec::SquarePlusLinear => Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![Atom::Var(VarId(4))],
            vec![
                Equation::new(
                    Primitive::Mul,
                    &[Atom::Var(VarId(1)), Atom::Var(VarId(1))],
                    &[VarId(2)],
                ),
                Equation::new(
                    Primitive::Mul,
                    &[Atom::Var(VarId(1)), Atom::Lit(Literal::I64(2))],
                    &[VarId(3)],
                ),
                Equation::new(
                    Primitive::Add,
                    &[Atom::Var(VarId(2)), Atom::Var(VarId(3))],
                    &[VarId(4)],
                ),
            ],
        ),
        ProgramSpec::AddOne => Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![Atom::Var(VarId(2))],
            vec![Equation::new(
                Primitive::Add,
                &[Atom::Var(VarId(1)), Atom::Lit(Literal::I64(1))],
                &[VarId(2)],
            )],
        ),
        ProgramSpec::SinX => unary_program(Primitive::Sin),
        ProgramSpec::ExpX => unary_program(Primitive::Exp),
        ProgramSpec::IgnoreSecond => Jaxpr::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![Atom::Var(VarId(3))],
            vec![Equation::new(
                Primitive::Add,
                &[Atom::Var(VarId(1)), Atom::Var(VarId(1))],
                &[VarId(3)],
            )],
        ),
        ProgramSpec::Identity => {
            Jaxpr::new(vec![VarId(1)], vec![], vec![Atom::Var(VarId(1))], vec![])
        }
    }
}

fn unary_program(primitive: Primitive) -> Jaxpr {
    Jaxpr::new(
        vec![VarId(1)],
        vec![],
        vec![Atom::Var(VarId(2))],
        vec![Equation {
            primitive,
            inputs: smallvec![Atom::Var(VarId(1))],
            outputs: smallvec![VarId(2)],
            params: BTreeMap::new(),
            sub_jaxprs: vec![],
        }],
    )
}

fn binary_program(primitive: Primitive) -> Jaxpr {
    Jaxpr::new(
        vec![VarId(1), VarId(2)],
        vec![],
        vec![Atom::Var(VarId(3))],
        vec![Equation {
            primitive,
            inputs: smallvec![Atom::Var(VarId(1)), Atom::Var(VarId(2))],
            outputs: smallvec![VarId(3)],
            params: BTreeMap::new(),
            sub_jaxprs: vec![],
        }],
    )
}
