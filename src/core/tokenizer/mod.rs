pub mod hf;
pub mod stream;
pub mod traits;

pub use hf::HfTokenizer;
pub use stream::TokenStream;
pub use traits::{DecodeOptions, EncodeOptions, Tokenizer};
