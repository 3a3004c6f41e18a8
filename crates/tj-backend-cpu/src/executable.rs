use serde::{Deserialize, Serialize};
use tj_core::{Value, typematch};
use tj_interpreters::eval_equation;
use tj_runtime::marshal::{value_from_bytes, value_to_bytes};
use tj_runtime::{
    BackendError, Buffer, CompileOptions, Computation, Device, Executable, Instruction,
};

/// A compiled computation bound to one device per replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuExecutable {
    computation: Computation,
    options: CompileOptions,
    devices: Vec<Device>,
}

#[derive(Debug, Clone)]
enum Slot {
    Value(Value),
    Tuple(Vec<Value>),
}

impl CpuExecutable {
    pub(crate) fn new(
        computation: Computation,
        options: CompileOptions,
        devices: Vec<Device>,
    ) -> Self {
        Self {
            computation,
            options,
            devices,
        }
    }

    #[must_use]
    pub fn computation(&self) -> &Computation {
        &self.computation
    }

    #[must_use]
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    fn run_replica(&self, device: Device, args: &[Buffer]) -> Result<Vec<Buffer>, BackendError> {
        let params = self.computation.param_avals();
        if args.len() != params.len() {
            return Err(execution_failed(format!(
                "`{}` takes {} arguments, got {}",
                self.computation.name(),
                params.len(),
                args.len()
            )));
        }

        let mut inputs = Vec::with_capacity(args.len());
        for (index, (buffer, expected)) in args.iter().zip(params).enumerate() {
            if buffer.device() != device {
                return Err(execution_failed(format!(
                    "argument {index} lives on {} but replica runs on {device}",
                    buffer.device()
                )));
            }
            if !typematch(expected, buffer.aval()) {
                return Err(execution_failed(format!(
                    "argument {index} has type {}, expected {expected}",
                    buffer.aval()
                )));
            }
            let value = value_from_bytes(buffer.aval(), buffer.as_bytes())
                .map_err(|err| execution_failed(err.to_string()))?;
            inputs.push(value);
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(self.computation.instructions().len());
        for instruction in self.computation.instructions() {
            let slot = match instruction {
                Instruction::Parameter { index, .. } => Slot::Value(inputs[*index].clone()),
                Instruction::TupleParameter { .. } => Slot::Tuple(inputs.clone()),
                Instruction::GetTupleElement { tuple, index } => match &slots[tuple.0 as usize] {
                    Slot::Tuple(elements) => Slot::Value(
                        elements
                            .get(*index)
                            .cloned()
                            .ok_or_else(|| {
                                execution_failed(format!("tuple has no element {index}"))
                            })?,
                    ),
                    Slot::Value(_) => {
                        return Err(execution_failed("projection from a non-tuple".to_owned()));
                    }
                },
                Instruction::Constant { value } => Slot::Value(value.clone()),
                Instruction::CreateToken => Slot::Value(Value::Token),
                Instruction::Op { equation, operands } => {
                    let operand_values = operands
                        .iter()
                        .map(|node| match &slots[node.0 as usize] {
                            Slot::Value(value) => Ok(value.clone()),
                            Slot::Tuple(_) => {
                                Err(execution_failed("tuple used as an operand".to_owned()))
                            }
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let mut outputs = eval_equation(equation, &operand_values, &mut |_, _| Ok(()))
                        .map_err(|err| execution_failed(err.to_string()))?;
                    if equation.primitive.multiple_results() {
                        Slot::Tuple(outputs)
                    } else {
                        let single = outputs.pop().ok_or_else(|| {
                            execution_failed(format!("{} produced no output", equation.primitive))
                        })?;
                        Slot::Value(single)
                    }
                }
                Instruction::Tuple { elements } => Slot::Tuple(
                    elements
                        .iter()
                        .map(|node| match &slots[node.0 as usize] {
                            Slot::Value(value) => Ok(value.clone()),
                            Slot::Tuple(_) => {
                                Err(execution_failed("nested tuples are not supported".to_owned()))
                            }
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                ),
            };
            slots.push(slot);
        }

        let results = match slots.swap_remove(self.computation.root().0 as usize) {
            Slot::Value(value) => vec![value],
            Slot::Tuple(values) => values,
        };
        Ok(results
            .into_iter()
            .filter_map(|value| match value {
                Value::Unit => None,
                Value::Token => Some(Buffer::token(device)),
                value => Some(Buffer::new(value_to_bytes(&value), value.aval(), device)),
            })
            .collect())
    }
}

fn execution_failed(detail: String) -> BackendError {
    BackendError::ExecutionFailed { detail }
}

impl Executable for CpuExecutable {
    fn name(&self) -> &str {
        self.computation.name()
    }

    fn local_devices(&self) -> &[Device] {
        &self.devices
    }

    fn execute(&self, args: &[Buffer]) -> Result<Vec<Buffer>, BackendError> {
        match self.devices.as_slice() {
            [device] => self.run_replica(*device, args),
            devices => Err(execution_failed(format!(
                "`{}` has {} replicas; use execute_sharded",
                self.computation.name(),
                devices.len()
            ))),
        }
    }

    fn execute_sharded(
        &self,
        per_device_args: &[Vec<Buffer>],
    ) -> Result<Vec<Vec<Buffer>>, BackendError> {
        if per_device_args.len() != self.devices.len() {
            return Err(execution_failed(format!(
                "`{}` expects argument lists for {} replicas, got {}",
                self.computation.name(),
                self.devices.len(),
                per_device_args.len()
            )));
        }
        self.devices
            .iter()
            .zip(per_device_args)
            .map(|(device, args)| self.run_replica(*device, args))
            .collect()
    }

    fn serialize(&self) -> Result<Vec<u8>, BackendError> {
        serde_json::to_vec(self).map_err(|err| BackendError::CompilationFailed {
            detail: format!("cannot serialize executable: {err}"),
        })
    }
}
