mod conditioner;
mod flow_lm;
mod lsd;
mod vocoder;

pub use conditioner::{run_text_conditioner, ConditioningSequence};
pub use flow_lm::{run_flow_lm, FlowLmOutput};
pub use lsd::run_lsd;
pub use vocoder::run_vocoder;
