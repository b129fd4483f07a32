//! Neural Architecture Search (NAS) Module
//!
//! Search-space graphs and the NAS-Bench-301 space:
//! - Nested cell graphs with scoped bulk updates
//! - Edge operation choices and architecture weights
//! - Compact architecture encodings
//! - Discretization and evaluation transforms
//! - Benchmark queries through surrogate models

mod compact;
mod edge;
mod graph;
mod primitives;
mod query;
mod search_space;

pub use compact::{
    convert_compact_to_genotype, convert_compact_to_naslib, convert_naslib_to_compact, Compact,
    COMPACT_OPS, NUM_OPS, NUM_VERTICES,
};
pub use edge::{EdgeData, EdgeOp};
pub use graph::{Graph, InEdge, Node, NodeId, Scope};
pub use primitives::{darts_primitives, CellType, CombineOp, Layer, Operation, OperationType};
pub use query::{DatasetApi, Genotype, Metric, QueryableSpace, SurrogateModel};
pub use search_space::{channel_maps, NasBench301SearchSpace, OPTIMIZER_SCOPE};
