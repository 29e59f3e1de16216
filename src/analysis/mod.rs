//! Static analysis of scanner sources: classification, parameter
//! extraction and multi-pattern decomposition.

pub mod classifier;
pub mod decomposer;
pub mod lexer;
pub mod params;
pub mod patterns;

pub use classifier::SourceClassifier;
pub use decomposer::PatternDecomposer;
pub use params::ParameterExtractor;
