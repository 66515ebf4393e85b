pub mod sampler;
pub mod stream;

pub use sampler::{SampledToken, Sampler, SamplingParams};
pub use stream::{CancellationToken, GenerateOptions, GenerationOutput, GenerationStream, StopReason};
