//! Python bridge for the model runtime and metrics library in a worker process.

pub mod backend;
pub mod protocol;
pub mod runtime;
pub mod worker;

pub use backend::PythonBackend;
pub use runtime::{PythonInfo, PythonRuntime};
pub use worker::PythonWorker;
