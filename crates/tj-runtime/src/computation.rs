//! Backend build requests.
//!
//! A `Computation` is a flat, topologically ordered list of instructions
//! produced by `ComputationBuilder`. Each instruction refers to earlier ones
//! through `NodeId`s. Backends compile it together with `CompileOptions`.

use serde::{Deserialize, Serialize};
use tj_core::{AbstractValue, Equation, Value};

use crate::backend::BackendError;
use crate::device::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Flat argument `index`.
    Parameter { index: usize, aval: AbstractValue },
    /// All arguments packed into one tuple.
    TupleParameter { avals: Vec<AbstractValue> },
    GetTupleElement { tuple: NodeId, index: usize },
    Constant { value: Value },
    CreateToken,
    /// One primitive application. Multi-result primitives produce a tuple.
    Op {
        equation: Equation,
        operands: Vec<NodeId>,
    },
    Tuple { elements: Vec<NodeId> },
}

/// Request that output `output_index` reuse the buffer of argument
/// `param_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputOutputAlias {
    pub output_index: usize,
    pub param_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Computation {
    name: String,
    instructions: Vec<Instruction>,
    root: NodeId,
    param_avals: Vec<AbstractValue>,
    tupled_params: bool,
    aliases: Vec<InputOutputAlias>,
}

impl Computation {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Types of the flat argument buffers, in order.
    #[must_use]
    pub fn param_avals(&self) -> &[AbstractValue] {
        &self.param_avals
    }

    #[must_use]
    pub fn tupled_params(&self) -> bool {
        self.tupled_params
    }

    #[must_use]
    pub fn aliases(&self) -> &[InputOutputAlias] {
        &self.aliases
    }

    /// Number of `Op` instructions.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|instr| matches!(instr, Instruction::Op { .. }))
            .count()
    }
}

#[derive(Debug)]
pub struct ComputationBuilder {
    name: String,
    instructions: Vec<Instruction>,
    param_avals: Vec<AbstractValue>,
    tupled_params: bool,
    aliases: Vec<InputOutputAlias>,
}

impl ComputationBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
            param_avals: Vec::new(),
            tupled_params: false,
            aliases: Vec::new(),
        }
    }

    fn push(&mut self, instruction: Instruction) -> NodeId {
        let id = NodeId(self.instructions.len() as u32);
        self.instructions.push(instruction);
        id
    }

    pub fn parameter(&mut self, aval: AbstractValue) -> NodeId {
        let index = self.param_avals.len();
        self.param_avals.push(aval.clone());
        self.push(Instruction::Parameter { index, aval })
    }

    /// Declares every argument at once as a single tuple parameter and
    /// returns one projection per element.
    pub fn tupled_parameters(&mut self, avals: Vec<AbstractValue>) -> Vec<NodeId> {
        self.tupled_params = true;
        self.param_avals.extend(avals.iter().cloned());
        let count = avals.len();
        let tuple = self.push(Instruction::TupleParameter { avals });
        (0..count)
            .map(|index| self.get_tuple_element(tuple, index))
            .collect()
    }

    pub fn constant(&mut self, value: Value) -> NodeId {
        self.push(Instruction::Constant { value })
    }

    pub fn create_token(&mut self) -> NodeId {
        self.push(Instruction::CreateToken)
    }

    pub fn op(&mut self, equation: Equation, operands: Vec<NodeId>) -> NodeId {
        self.push(Instruction::Op { equation, operands })
    }

    pub fn get_tuple_element(&mut self, tuple: NodeId, index: usize) -> NodeId {
        self.push(Instruction::GetTupleElement { tuple, index })
    }

    pub fn tuple(&mut self, elements: Vec<NodeId>) -> NodeId {
        self.push(Instruction::Tuple { elements })
    }

    pub fn setup_alias(&mut self, output_index: usize, param_index: usize) {
        self.aliases.push(InputOutputAlias {
            output_index,
            param_index,
        });
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.param_avals.len()
    }

    /// Finishes the request, checking that every node reference points
    /// backwards.
    pub fn build(self, root: NodeId) -> Result<Computation, BackendError> {
        let malformed = |detail: String| BackendError::CompilationFailed {
            detail: format!("malformed computation `{}`: {detail}", self.name),
        };
        for (position, instruction) in self.instructions.iter().enumerate() {
            let refs: &[NodeId] = match instruction {
                Instruction::GetTupleElement { tuple, .. } => std::slice::from_ref(tuple),
                Instruction::Op { operands, .. } => operands,
                Instruction::Tuple { elements } => elements,
                Instruction::Parameter { .. }
                | Instruction::TupleParameter { .. }
                | Instruction::Constant { .. }
                | Instruction::CreateToken => &[],
            };
            if let Some(bad) = refs.iter().find(|node| node.0 as usize >= position) {
                return Err(malformed(format!(
                    "instruction {position} refers forward to node {}",
                    bad.0
                )));
            }
        }
        if root.0 as usize >= self.instructions.len() {
            return Err(malformed(format!("root node {} does not exist", root.0)));
        }
        for alias in &self.aliases {
            if alias.param_index >= self.param_avals.len() {
                return Err(malformed(format!(
                    "alias refers to missing parameter {}",
                    alias.param_index
                )));
            }
        }

        Ok(Computation {
            name: self.name,
            instructions: self.instructions,
            root,
            param_avals: self.param_avals,
            tupled_params: self.tupled_params,
            aliases: self.aliases,
        })
    }
}

/// Options submitted alongside a `Computation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub num_replicas: usize,
    pub num_partitions: usize,
    /// Explicit placement, one device per replica.
    pub device_assignment: Option<Vec<Device>>,
    pub parameter_is_tupled_arguments: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            num_replicas: 1,
            num_partitions: 1,
            device_assignment: None,
            parameter_is_tupled_arguments: false,
        }
    }
}
