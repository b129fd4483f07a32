//! NAS Search Space Definition
//!
//! The NAS-Bench-301 (DARTS) search space: a 13-node macro-graph of stem,
//! normal and reduction cells, each cell a 7-node graph whose edges choose
//! among eight primitives.

use std::collections::BTreeMap;

use rand::prelude::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use super::compact::{
    convert_compact_to_genotype, convert_compact_to_naslib, convert_naslib_to_compact, Compact,
    CELL_OUTPUT, FIRST_INTERMEDIATE,
};
use super::edge::EdgeData;
use super::graph::{Graph, InEdge, NodeId, Scope};
use super::primitives::{darts_primitives, CellType, CombineOp, Layer, Operation};
use super::query::{DatasetApi, Genotype, Metric, QueryableSpace};
use crate::error::{KolosalError, Result};

/// Scopes holding the searchable cells
pub const OPTIMIZER_SCOPE: [Scope; 5] = [
    Scope::NormalStage1,
    Scope::NormalStage2,
    Scope::NormalStage3,
    Scope::ReductionStage1,
    Scope::ReductionStage2,
];

/// Hard-coded multiplier on the stem output in DARTS
const STEM_MULTIPLIER: usize = 3;

/// Intermediate nodes concatenated into each cell output
const NUM_IN_EDGES: usize = 4;

const REDUCTION_CELL_INDICES: [NodeId; 2] = [6, 9];

/// First node id past the cells
const MAX_INDEX: NodeId = 12;

/// Incoming edges each intermediate node keeps after discretization
const KEEP_EDGES: usize = 2;

/// Cell nodes with their scope and input wiring
const CELL_LAYOUT: [(NodeId, CellType, Scope, [NodeId; 2]); 8] = [
    (4, CellType::Normal, Scope::NormalStage1, [2, 3]),
    (5, CellType::Normal, Scope::NormalStage1, [2, 4]),
    (6, CellType::Reduction, Scope::ReductionStage1, [4, 5]),
    (7, CellType::Normal, Scope::NormalStage2, [5, 6]),
    (8, CellType::Normal, Scope::NormalStage2, [6, 7]),
    (9, CellType::Reduction, Scope::ReductionStage2, [7, 8]),
    (10, CellType::Normal, Scope::NormalStage3, [8, 9]),
    (11, CellType::Normal, Scope::NormalStage3, [9, 10]),
];

/// Stage index of the source (`from`) and target (`to`) of macro edges
pub fn channel_maps(
    reduction_cell_indices: [NodeId; 2],
    max_index: NodeId,
) -> (BTreeMap<NodeId, usize>, BTreeMap<NodeId, usize>) {
    let [r1, r2] = reduction_cell_indices;

    let mut from = BTreeMap::new();
    from.extend((2..r1).map(|i| (i, 0)));
    from.extend((r1..r2).map(|i| (i, 1)));
    from.extend((r2..max_index).map(|i| (i, 2)));

    let mut to = BTreeMap::new();
    to.extend((3..=r1).map(|i| (i, 0)));
    to.extend((r1 + 1..=r2).map(|i| (i, 1)));
    to.extend((r2 + 1..max_index).map(|i| (i, 2)));

    (from, to)
}

fn build_cell(cell_type: CellType) -> Result<Graph> {
    let mut cell = Graph::with_name(cell_type.cell_name());
    for id in 1..=CELL_OUTPUT {
        cell.add_node(id);
    }

    // every intermediate node sees both inputs and all earlier intermediates
    for v in FIRST_INTERMEDIATE..CELL_OUTPUT {
        for u in 1..v {
            let mut data = EdgeData::new();
            data.set("cell_name", cell_type.cell_name());
            cell.add_edge_with_data(u, v, data)?;
        }
    }
    for u in FIRST_INTERMEDIATE..CELL_OUTPUT {
        cell.add_edge_with_data(u, CELL_OUTPUT, EdgeData::finalized(Operation::identity()))?;
    }
    cell.set_comb_op(CELL_OUTPUT, CombineOp::ChannelConcat)?;
    Ok(cell)
}

/// NAS-Bench-301 search space
#[derive(Debug, Clone)]
pub struct NasBench301SearchSpace {
    graph: Graph,
    /// Channel width per stage
    channels: [usize; 3],
    num_classes: usize,
    in_channels: usize,
    auxiliary: bool,
    max_epoch: usize,
    compact: Option<Compact>,
    /// Encodings with known labels to sample from
    labeled_archs: Option<Vec<Compact>>,
    load_labeled: bool,
    /// Whether encodings are written into the graph or only stored
    instantiate_model: bool,
}

impl NasBench301SearchSpace {
    /// Build the search space; CIFAR-10 uses `(10, 3, true)`
    pub fn new(num_classes: usize, in_channels: usize, auxiliary: bool) -> Result<Self> {
        let mut space = Self {
            graph: Graph::with_name("makrograph"),
            channels: [32, 64, 128],
            num_classes,
            in_channels,
            auxiliary,
            max_epoch: 100,
            compact: None,
            labeled_archs: None,
            load_labeled: false,
            instantiate_model: true,
        };

        space.build_makrograph()?;
        let (from, to) = channel_maps(REDUCTION_CELL_INDICES, MAX_INDEX);
        space.set_makrograph_ops(&from, &to)?;
        space.set_cell_ops()?;
        space.graph.freeze();

        debug!(
            num_classes,
            in_channels,
            auxiliary,
            edges = space.graph.num_edges(),
            "Built NAS-Bench-301 search space"
        );
        Ok(space)
    }

    /// Search space with the CIFAR-10 defaults
    pub fn try_default() -> Result<Self> {
        Self::new(10, 3, true)
    }

    /// Encodings to draw from when sampling labeled architectures
    pub fn with_labeled_archs(mut self, archs: Vec<Compact>) -> Self {
        self.labeled_archs = Some(archs);
        self
    }

    /// Make random sampling draw from the labeled architectures
    pub fn with_load_labeled(mut self, load_labeled: bool) -> Self {
        self.load_labeled = load_labeled;
        self
    }

    /// Toggle writing encodings into the graph
    pub fn with_instantiate_model(mut self, instantiate_model: bool) -> Self {
        self.instantiate_model = instantiate_model;
        self
    }

    fn build_makrograph(&mut self) -> Result<()> {
        let normal_cell = build_cell(CellType::Normal)?;
        let reduction_cell = build_cell(CellType::Reduction)?;

        // input, stem, stem copy
        for id in 1..=3 {
            self.graph.add_node(id);
        }
        for (id, cell_type, scope, inputs) in CELL_LAYOUT {
            let template = match cell_type {
                CellType::Normal => &normal_cell,
                CellType::Reduction => &reduction_cell,
            };
            let cell = template.clone().set_scope(scope).set_input(inputs.to_vec());
            self.graph.add_node_with_subgraph(id, cell)?;
        }
        self.graph.add_node(MAX_INDEX);

        self.graph.add_edges_from((1..=10).map(|i| (i, i + 1)))?;
        self.graph.add_edges_from((4..=9).map(|i| (i, i + 2)))?;
        self.graph.add_edges_from([(2, 4), (2, 5)])?;

        if self.auxiliary {
            // node 12 becomes the auxiliary head, 13 the final output
            self.graph.add_node(MAX_INDEX + 1);
            self.graph.add_edges_from([(11, MAX_INDEX), (11, MAX_INDEX + 1)])?;
        } else {
            self.graph.add_edge(11, MAX_INDEX)?;
        }
        Ok(())
    }

    fn set_makrograph_ops(
        &mut self,
        channel_map_from: &BTreeMap<NodeId, usize>,
        channel_map_to: &BTreeMap<NodeId, usize>,
    ) -> Result<()> {
        let channels = self.channels;
        let stem = Operation::stem(self.in_channels, channels[0] * STEM_MULTIPLIER);
        self.graph
            .edge_mut(1, 2)
            .ok_or_else(|| KolosalError::GraphError("missing stem edge 1 -> 2".to_string()))?
            .set_op(stem)?;

        let stage = |map: &BTreeMap<NodeId, usize>, id: NodeId| {
            map.get(&id)
                .copied()
                .ok_or_else(|| KolosalError::GraphError(format!("node {} has no channel stage", id)))
        };

        for (u, v, data) in self.graph.edges_mut() {
            if u <= 1 || v >= MAX_INDEX || u == 3 {
                continue;
            }
            let c_in = channels[stage(channel_map_from, u)?];
            let mut c_out = channels[stage(channel_map_to, v)?];

            if c_in == c_out {
                let c_in = if u == 2 { c_in * STEM_MULTIPLIER } else { c_in * NUM_IN_EDGES };
                if REDUCTION_CELL_INDICES.contains(&v) {
                    c_out *= 2;
                }
                data.set_op(Operation::relu_conv_bn(c_in, c_out, 1))?;
            } else {
                data.set_op(Operation::factorized_reduce(c_in * NUM_IN_EDGES, c_out, 2))?;
            }
        }

        let (u, v) = self
            .graph
            .edges()
            .last()
            .map(|(u, v, _)| (u, v))
            .ok_or_else(|| KolosalError::GraphError("makrograph has no edges".to_string()))?;
        let classifier = Operation::sequential(vec![
            Layer::AdaptiveAvgPool2d { output_size: 1 },
            Layer::Flatten,
            Layer::Linear {
                in_features: channels[2] * NUM_IN_EDGES,
                out_features: self.num_classes,
            },
        ]);
        if let Some(data) = self.graph.edge_mut(u, v) {
            data.set_op(classifier)?;
        }
        Ok(())
    }

    fn set_cell_ops(&mut self) -> Result<()> {
        for (scope, c) in Scope::normal_stages().into_iter().zip(self.channels) {
            self.graph
                .update_edges(&[scope], |_, _, data| data.set_candidates(darts_primitives(c, 1)))?;
        }

        // stride 2 only on edges leaving the two cell inputs
        for (n, c) in REDUCTION_CELL_INDICES.into_iter().zip(&self.channels[1..]) {
            let cell = self
                .graph
                .subgraph_mut(n)
                .ok_or_else(|| KolosalError::GraphError(format!("node {} has no reduction cell", n)))?;
            for (u, _, data) in cell.edges_mut() {
                if data.is_final() {
                    continue;
                }
                let stride = if u <= 2 { 2 } else { 1 };
                data.set_candidates(darts_primitives(*c, stride))?;
            }
        }
        Ok(())
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable graph access, e.g. for attaching architecture weights
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn channels(&self) -> [usize; 3] {
        self.channels
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn max_epoch(&self) -> usize {
        self.max_epoch
    }

    pub fn get_type(&self) -> &'static str {
        "nasbench301"
    }

    /// Reduce every intermediate node to two incoming edges.
    ///
    /// Runs once per cell type; the other instances copy the result.
    pub fn prepare_discretization<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let removed = self
            .graph
            .update_nodes(&OPTIMIZER_SCOPE, true, |_, in_edges| truncate_input_edges(rng, in_edges))?;

        if self.instantiate_model {
            self.compact = None;
        }
        info!(
            normal_removed = removed.get(CellType::Normal.cell_name()).copied().unwrap_or(0),
            reduction_removed = removed.get(CellType::Reduction.cell_name()).copied().unwrap_or(0),
            "Discretized cells"
        );
        Ok(())
    }

    /// Check that every intermediate cell node has exactly two inputs
    pub fn validate_discretization(&self) -> Result<()> {
        for (id, cell) in self.graph.cells() {
            for v in FIRST_INTERMEDIATE..CELL_OUTPUT {
                let degree = cell.in_degree(v);
                if degree != KEEP_EDGES {
                    return Err(KolosalError::InvariantViolation(format!(
                        "node {} of cell {} has {} incoming edges",
                        v, id, degree
                    )));
                }
            }
        }
        Ok(())
    }

    /// Swap in the auxiliary classifier used for final evaluation
    pub fn prepare_evaluation(&mut self) -> Result<()> {
        if !self.auxiliary {
            return Ok(());
        }

        let c = self.channels[2] * NUM_IN_EDGES;
        let head = Operation::sequential(vec![
            Layer::ReLU,
            // image size = 2 x 2
            Layer::AvgPool2d {
                kernel_size: 5,
                stride: 3,
                padding: 0,
            },
            Layer::Conv2d {
                c_in: c,
                c_out: 128,
                kernel_size: 1,
            },
            Layer::BatchNorm2d { num_features: 128 },
            Layer::ReLU,
            Layer::Conv2d {
                c_in: 128,
                c_out: 768,
                kernel_size: 2,
            },
            Layer::BatchNorm2d { num_features: 768 },
            Layer::ReLU,
            Layer::Flatten,
            Layer::Linear {
                in_features: 768,
                out_features: self.num_classes,
            },
        ]);

        self.graph
            .edge_mut(11, MAX_INDEX)
            .ok_or_else(|| KolosalError::GraphError("missing auxiliary edge 11 -> 12".to_string()))?
            .set_op(head)
    }

    /// Current encoding without caching it
    pub fn compact(&self) -> Result<Compact> {
        match &self.compact {
            Some(compact) => Ok(compact.clone()),
            None => convert_naslib_to_compact(&self.graph),
        }
    }

    /// Current encoding, derived from the graph on first use
    pub fn get_compact(&mut self) -> Result<&Compact> {
        let compact = match self.compact.take() {
            Some(compact) => compact,
            None => convert_naslib_to_compact(&self.graph)?,
        };
        Ok(&*self.compact.insert(compact))
    }

    pub fn get_hash(&mut self) -> Result<u64> {
        Ok(self.get_compact()?.hash_u64())
    }

    /// Store an encoding and, if enabled, write it into every cell
    pub fn set_compact(&mut self, compact: Compact) -> Result<()> {
        compact.validate()?;
        if self.instantiate_model {
            convert_compact_to_naslib(&compact, &mut self.graph)?;
        }
        self.compact = Some(compact);
        Ok(())
    }

    pub fn set_spec(&mut self, compact: Compact, _dataset_api: Option<&DatasetApi>) -> Result<()> {
        self.set_compact(compact)
    }

    pub fn genotype(&self) -> Result<Genotype> {
        Ok(convert_compact_to_genotype(&self.compact()?))
    }

    /// Replace the architecture with a random one
    pub fn sample_random_architecture<R: Rng + ?Sized>(&mut self, rng: &mut R, load_labeled: bool) -> Result<()> {
        if load_labeled {
            return self.sample_random_labeled_architecture(rng);
        }
        let compact = Compact::sample_random(rng);
        debug!(hash = compact.hash_u64(), "Sampled random architecture");
        self.set_compact(compact)
    }

    pub fn sample_random_labeled_architecture<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let compact = self
            .labeled_archs
            .as_ref()
            .ok_or_else(|| KolosalError::ConfigError("labeled archs not provided to sample from".to_string()))?
            .choose(rng)
            .cloned()
            .ok_or_else(|| KolosalError::ConfigError("labeled archs are empty".to_string()))?;
        self.set_spec(compact, None)
    }

    fn fresh_like(&self) -> Result<Self> {
        let mut child = Self::new(self.num_classes, self.in_channels, self.auxiliary)?;
        child.labeled_archs = self.labeled_archs.clone();
        child.load_labeled = self.load_labeled;
        child.instantiate_model = self.instantiate_model;
        Ok(child)
    }

    /// New search space holding a mutated copy of this architecture
    pub fn mutate<R: Rng + ?Sized>(&self, rng: &mut R, max_mutations: usize) -> Result<Self> {
        let compact = self.compact()?.mutate(rng, max_mutations);
        let mut child = self.fresh_like()?;
        child.set_compact(compact)?;
        Ok(child)
    }

    /// New search space combining the cells of two parents
    pub fn crossover<R: Rng + ?Sized>(&self, other: &Self, rng: &mut R) -> Result<Self> {
        let compact = self.compact()?.crossover(&other.compact()?, rng);
        let mut child = self.fresh_like()?;
        child.set_compact(compact)?;
        Ok(child)
    }
}

/// Keep two incoming edges of a cell node.
///
/// With architecture weights the two strongest edges survive; otherwise
/// zero edges go first and random edges are dropped until two remain.
fn truncate_input_edges<R: Rng + ?Sized>(rng: &mut R, in_edges: &mut [InEdge<'_>]) -> Result<()> {
    if in_edges.len() < KEEP_EDGES || in_edges.iter().any(|(_, data)| data.is_final()) {
        return Ok(());
    }

    if in_edges.iter().any(|(_, data)| data.has_alpha()) {
        for (_, data) in in_edges.iter_mut() {
            data.suppress_zero_weight();
        }
        let mut ranked: Vec<(usize, f64)> = in_edges
            .iter()
            .enumerate()
            .map(|(i, (_, data))| (i, data.largest_softmax_weight().unwrap_or(f64::NEG_INFINITY)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        for &(i, _) in ranked.iter().skip(KEEP_EDGES) {
            in_edges[i].1.delete();
        }
    } else {
        for (_, data) in in_edges.iter_mut() {
            data.remove_zero_candidate();
            if data.is_zero() {
                data.delete();
            }
        }
        let mut alive: Vec<usize> = (0..in_edges.len())
            .filter(|&i| !in_edges[i].1.is_deleted())
            .collect();
        while alive.len() > KEEP_EDGES {
            let i = alive.swap_remove(rng.gen_range(0..alive.len()));
            in_edges[i].1.delete();
        }
    }
    Ok(())
}

impl QueryableSpace for NasBench301SearchSpace {
    type Encoding = Compact;

    const QUERYABLE: bool = true;

    fn sample_random_architecture<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        _dataset_api: Option<&DatasetApi>,
    ) -> Result<()> {
        let load_labeled = self.load_labeled;
        NasBench301SearchSpace::sample_random_architecture(self, rng, load_labeled)
    }

    fn query(
        &self,
        metric: Metric,
        _dataset: &str,
        epoch: Option<usize>,
        dataset_api: Option<&DatasetApi>,
    ) -> Result<f64> {
        let api = dataset_api.ok_or_else(|| {
            KolosalError::ConfigError("must pass in dataset_api to query NAS-Bench-301".to_string())
        })?;
        if let Some(epoch) = epoch {
            debug_assert!(api.supports_epoch(epoch), "NAS-Bench-301 cannot answer epoch {}", epoch);
        }

        let genotype = self.genotype()?;
        match metric {
            Metric::ValAccuracy => api.accuracy_model().predict(&genotype),
            Metric::TrainTime => api.runtime_model().predict(&genotype),
            _ => Ok(-1.0),
        }
    }

    fn arch_hash(&self) -> Result<u64> {
        Ok(self.compact()?.hash_u64())
    }

    fn encoding(&self) -> Result<Compact> {
        self.compact()
    }

    fn space_name(&self) -> &str {
        self.get_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::edge::EdgeOp;
    use crate::nas::primitives::OperationType;
    use crate::nas::query::SurrogateModel;
    use ndarray::Array1;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    struct Constant(f64);

    impl SurrogateModel for Constant {
        fn predict(&self, _genotype: &Genotype) -> Result<f64> {
            Ok(self.0)
        }
    }

    fn fixed_op(data: &EdgeData) -> &Operation {
        match data.op() {
            EdgeOp::Fixed(op) | EdgeOp::Finalized(op) => op,
            EdgeOp::Candidates { .. } => panic!("expected a single operation"),
        }
    }

    #[test]
    fn test_channel_maps() {
        let (from, to) = channel_maps([6, 9], 12);
        assert_eq!(from[&2], 0);
        assert_eq!(from[&5], 0);
        assert_eq!(from[&6], 1);
        assert_eq!(from[&11], 2);
        assert!(!from.contains_key(&12));
        assert_eq!(to[&3], 0);
        assert_eq!(to[&6], 0);
        assert_eq!(to[&7], 1);
        assert_eq!(to[&10], 2);
    }

    #[test]
    fn test_makrograph_shape() {
        let space = NasBench301SearchSpace::try_default().unwrap();
        let g = space.graph();
        assert_eq!(g.num_nodes(), 13);
        assert_eq!(g.num_edges(), 20);
        assert_eq!(g.cells().count(), 8);
        assert_eq!(g.scope_nodes(Scope::NormalStage1), &[4, 5]);
        assert_eq!(g.scope_nodes(Scope::ReductionStage2), &[9]);
        assert_eq!(g.subgraph(7).unwrap().input_nodes(), &[5, 6]);
        assert!(g.is_frozen());

        let plain = NasBench301SearchSpace::new(10, 3, false).unwrap();
        assert_eq!(plain.graph().num_nodes(), 12);
        assert_eq!(plain.graph().num_edges(), 19);
    }

    #[test]
    fn test_makrograph_rewire_rejected() {
        let mut space = NasBench301SearchSpace::try_default().unwrap();
        assert!(space.graph_mut().rewire_cell(5, vec![3, 4]).is_err());
    }

    #[test]
    fn test_makrograph_ops() {
        let space = NasBench301SearchSpace::try_default().unwrap();
        let g = space.graph();

        let stem = fixed_op(g.edge(1, 2).unwrap());
        assert_eq!(stem.op_type, OperationType::Stem);
        assert_eq!(stem.c_out, Some(96));

        let pre = fixed_op(g.edge(2, 4).unwrap());
        assert_eq!(pre.op_type, OperationType::ReLUConvBN);
        assert_eq!((pre.c_in, pre.c_out), (Some(96), Some(32)));

        let into_reduction = fixed_op(g.edge(4, 6).unwrap());
        assert_eq!((into_reduction.c_in, into_reduction.c_out), (Some(128), Some(64)));

        let across = fixed_op(g.edge(5, 7).unwrap());
        assert_eq!(across.op_type, OperationType::FactorizedReduce);
        assert_eq!((across.c_in, across.c_out), (Some(128), Some(64)));

        assert_eq!(fixed_op(g.edge(3, 4).unwrap()).op_type, OperationType::Identity);

        let classifier = fixed_op(g.edge(11, 13).unwrap());
        assert_eq!(classifier.op_type, OperationType::Sequential);
        assert_eq!(
            classifier.layers.last(),
            Some(&Layer::Linear {
                in_features: 512,
                out_features: 10
            })
        );
    }

    #[test]
    fn test_cell_ops() {
        let space = NasBench301SearchSpace::try_default().unwrap();
        let g = space.graph();

        let reduction = g.subgraph(6).unwrap();
        assert_eq!(reduction.name(), "reduction_cell");
        let from_input = reduction.edge(1, 3).unwrap().candidates().unwrap();
        assert_eq!(from_input[0].op_type, OperationType::FactorizedReduce);
        assert_eq!(from_input[0].c_in, Some(64));
        assert!(from_input.iter().all(|op| op.stride == 2));
        let inner = reduction.edge(3, 4).unwrap().candidates().unwrap();
        assert!(inner.iter().all(|op| op.stride == 1));

        let normal = g.subgraph(10).unwrap();
        let ops = normal.edge(2, 5).unwrap().candidates().unwrap();
        assert_eq!(ops.len(), 8);
        assert_eq!(ops[2].c_in, Some(128));
        assert_eq!(
            normal.edge(2, 5).unwrap().get("cell_name").and_then(|v| v.as_str()),
            Some("normal_cell")
        );

        assert_eq!(normal.num_edges(), 18);
        assert!(normal.edge(4, 7).unwrap().is_final());
        assert_eq!(normal.node(7).unwrap().comb_op(), CombineOp::ChannelConcat);
    }

    #[test]
    fn test_compact_round_trip() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let mut space = NasBench301SearchSpace::try_default().unwrap();
        space.sample_random_architecture(&mut rng, false).unwrap();

        let stored = space.compact().unwrap();
        assert_eq!(convert_naslib_to_compact(space.graph()).unwrap(), stored);
    }

    #[test]
    fn test_discrete_discretization() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let mut space = NasBench301SearchSpace::try_default().unwrap();
        space.sample_random_architecture(&mut rng, false).unwrap();
        let before = space.compact().unwrap();

        space.prepare_discretization(&mut rng).unwrap();
        space.validate_discretization().unwrap();
        for (_, cell) in space.graph().cells() {
            assert_eq!(cell.num_edges(), 12);
        }
        assert_eq!(space.get_compact().unwrap(), &before);
    }

    #[test]
    fn test_random_truncation_shares_topology() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let mut space = NasBench301SearchSpace::try_default().unwrap();
        space.prepare_discretization(&mut rng).unwrap();
        space.validate_discretization().unwrap();

        let topology = |id| -> Vec<(NodeId, NodeId)> {
            space.graph().subgraph(id).unwrap().edges().map(|(u, v, _)| (u, v)).collect()
        };
        for id in [5, 7, 8, 10, 11] {
            assert_eq!(topology(id), topology(4));
        }
        assert_eq!(topology(9), topology(6));
    }

    #[test]
    fn test_one_shot_discretization() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let mut space = NasBench301SearchSpace::try_default().unwrap();
        space
            .graph_mut()
            .update_edges(&OPTIMIZER_SCOPE, |u, _, data| {
                let mut alpha = Array1::<f64>::zeros(8);
                // a dominant zero weight must not decide the ranking
                alpha[1] = 100.0;
                alpha[4] = u as f64;
                data.set_alpha(alpha)
            })
            .unwrap();

        space.prepare_discretization(&mut rng).unwrap();
        space.validate_discretization().unwrap();

        let cell = space.graph().subgraph(4).unwrap();
        let sources = |v| -> Vec<NodeId> { cell.in_edges(v).into_iter().map(|(u, _)| u).collect() };
        assert_eq!(sources(3), vec![1, 2]);
        assert_eq!(sources(4), vec![2, 3]);
        assert_eq!(sources(5), vec![3, 4]);
        assert_eq!(sources(6), vec![4, 5]);

        let compact = space.compact().unwrap();
        assert_eq!(
            compact.normal,
            vec![(0, 4), (1, 4), (1, 4), (2, 4), (2, 4), (3, 4), (3, 4), (4, 4)]
        );
    }

    #[test]
    fn test_prepare_evaluation() {
        let mut space = NasBench301SearchSpace::try_default().unwrap();
        space.prepare_evaluation().unwrap();
        let head = fixed_op(space.graph().edge(11, 12).unwrap());
        assert_eq!(head.layers.len(), 10);
        assert_eq!(
            head.layers[2],
            Layer::Conv2d {
                c_in: 512,
                c_out: 128,
                kernel_size: 1
            }
        );

        let mut plain = NasBench301SearchSpace::new(100, 3, false).unwrap();
        plain.prepare_evaluation().unwrap();
        let classifier = fixed_op(plain.graph().edge(11, 12).unwrap());
        assert_eq!(classifier.layers.len(), 3);
    }

    #[test]
    fn test_query() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        let mut space = NasBench301SearchSpace::try_default().unwrap();
        space.sample_random_architecture(&mut rng, false).unwrap();

        let err = space.query(Metric::ValAccuracy, "cifar10", None, None).unwrap_err();
        assert!(matches!(err, KolosalError::ConfigError(_)));

        let api = DatasetApi::new(Box::new(Constant(93.5)), Box::new(Constant(1200.0))).with_checkpoint_epoch(100);
        assert_eq!(space.query(Metric::ValAccuracy, "cifar10", Some(100), Some(&api)).unwrap(), 93.5);
        assert_eq!(space.query(Metric::TrainTime, "cifar10", None, Some(&api)).unwrap(), 1200.0);
        assert_eq!(space.query(Metric::TestAccuracy, "cifar10", None, Some(&api)).unwrap(), -1.0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "cannot answer epoch 1")]
    fn test_query_outside_checkpoint_epoch() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        let mut space = NasBench301SearchSpace::try_default().unwrap();
        space.sample_random_architecture(&mut rng, false).unwrap();

        let api = DatasetApi::new(Box::new(Constant(93.5)), Box::new(Constant(1200.0))).with_checkpoint_epoch(100);
        let _ = space.query(Metric::ValAccuracy, "cifar10", Some(1), Some(&api));
    }

    #[test]
    fn test_stored_compact_without_model() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let mut space = NasBench301SearchSpace::try_default()
            .unwrap()
            .with_instantiate_model(false);
        space.sample_random_architecture(&mut rng, false).unwrap();

        assert!(space.compact().is_ok());
        let cell = space.graph().subgraph(4).unwrap();
        assert!(cell.edges().filter(|(_, _, d)| !d.is_final()).all(|(_, _, d)| d.candidates().is_some()));
    }

    #[test]
    fn test_labeled_sampling() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(4);
        let mut space = NasBench301SearchSpace::try_default().unwrap();
        let err = space.sample_random_labeled_architecture(&mut rng).unwrap_err();
        assert!(matches!(err, KolosalError::ConfigError(_)));

        let labeled = vec![Compact::sample_random(&mut rng), Compact::sample_random(&mut rng)];
        let mut space = space.with_labeled_archs(labeled.clone());
        space.sample_random_architecture(&mut rng, true).unwrap();
        assert!(labeled.contains(&space.compact().unwrap()));
    }

    #[test]
    fn test_mutate_and_crossover() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(8);
        let mut parent = NasBench301SearchSpace::try_default().unwrap();
        parent.sample_random_architecture(&mut rng, false).unwrap();

        let child = parent.mutate(&mut rng, 1).unwrap();
        assert_ne!(child.compact().unwrap(), parent.compact().unwrap());
        assert_eq!(convert_naslib_to_compact(child.graph()).unwrap(), child.compact().unwrap());

        for _ in 0..50 {
            let child = parent.mutate(&mut rng, 4).unwrap();
            assert_ne!(child.compact().unwrap(), parent.compact().unwrap());
        }

        let mixed = parent.crossover(&child, &mut rng).unwrap();
        mixed.compact().unwrap().validate().unwrap();
        assert_eq!(mixed.get_type(), "nasbench301");
    }
}
