pub mod builder;
pub mod error;
pub mod latex;
pub mod vocab;

pub use builder::VocabBuilder;
pub use error::TokenizerError;
pub use latex::LatexTokenizer;
pub use vocab::Vocab;
