mod epoch;
pub use epoch::{Epoch, Stamped};

pub mod logging;
pub use logging::{FileLogger, Level, Logger, NoopLogger, StdoutLogger};

mod tensor;
pub use tensor::{Tensor, TensorError};
