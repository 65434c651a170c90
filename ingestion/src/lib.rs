pub mod chunker;
pub mod extract;
pub mod graph;
pub mod language;
pub mod oracle;
pub mod parser;
pub mod pipeline;

pub use graph::{GraphBuildReport, GraphConstructor};
pub use oracle::{OracleClient, StaticOracle, TypeOracle};
pub use pipeline::{FileIndexResult, FileStatus, IndexingPipeline};
