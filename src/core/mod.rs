pub mod cache;
pub mod device;
pub mod error;
pub mod model;
pub mod tokenizer;

pub use cache::{CausalKVCache, KVCache};
pub use device::select_device;
pub use error::VlmError;
pub use model::{ModelConfig, ModelMeta, TokenId, VisionLanguageModel};
pub use tokenizer::{HfTokenizer, TokenStream, Tokenizer};

pub type Result<T> = std::result::Result<T, VlmError>;
