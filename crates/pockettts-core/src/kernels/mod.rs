pub mod activation;
pub mod attention;
pub mod conv;
pub mod matmul;
pub mod norm;
pub mod rng;
pub mod rope;

pub use activation::{gelu, sigmoid, silu, softmax_in_place};
pub use attention::{attend_single_step, KVCache};
pub use conv::{conv1d, conv_transpose1d};
pub use matmul::{linear, matmul};
pub use norm::{layer_norm, rms_norm};
pub use rng::DeterministicRng;
pub use rope::RotaryTables;
