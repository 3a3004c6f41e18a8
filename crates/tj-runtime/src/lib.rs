#![forbid(unsafe_code)]

pub mod array;
pub mod backend;
pub mod buffer;
pub mod computation;
pub mod device;
pub mod marshal;

pub use array::{DeviceArray, RuntimeValue, ValueKind};
pub use backend::{Backend, BackendError, BackendRegistry, Executable};
pub use buffer::Buffer;
pub use computation::{
    CompileOptions, Computation, ComputationBuilder, InputOutputAlias, Instruction, NodeId,
};
pub use device::{Device, DeviceId, DeviceInfo, Platform};
