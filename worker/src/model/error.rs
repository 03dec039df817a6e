use std::{
    error::Error,
    fmt::{self, Display},
};

/// The model module's result type.
pub type Result<T> = std::result::Result<T, ModelErr>;

/// Model and optimizer failures. None of them is retried.
#[derive(Debug)]
pub enum ModelErr {
    /// The step doesn't fit in accelerator memory.
    OutOfMemory { requested: usize, available: usize },
    /// Two buffers that must agree in size don't.
    Shape {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// A tensor the model needs is absent from a restored state.
    MissingTensor(String),
    /// The computation itself failed.
    Compute(String),
}

impl Display for ModelErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelErr::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: step needs {requested} bytes but {available} are available, \
                 lower the device batch size and resume from the latest checkpoint"
            ),
            ModelErr::Shape {
                what,
                got,
                expected,
            } => write!(f, "size mismatch for {what}: got {got}, expected {expected}"),
            ModelErr::MissingTensor(name) => write!(f, "tensor {name:?} missing from state"),
            ModelErr::Compute(msg) => write!(f, "compute failed: {msg}"),
        }
    }
}

impl Error for ModelErr {}
