//! Compact Architecture Encoding
//!
//! A DARTS cell pair encoded as two sequences of (input, operation) pairs,
//! two pairs per intermediate node. Used for sampling, mutation, crossover
//! and as the identity of an architecture.

use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::graph::{Graph, NodeId};
use super::primitives::CellType;
use super::query::Genotype;
use crate::error::{KolosalError, Result};

/// Intermediate nodes per cell
pub const NUM_VERTICES: usize = 4;

/// Operations available in the encoding (`none` excluded)
pub const NUM_OPS: usize = 7;

/// Operation names indexed by compact op index
pub const COMPACT_OPS: [&str; NUM_OPS] = [
    "max_pool_3x3",
    "avg_pool_3x3",
    "skip_connect",
    "sep_conv_3x3",
    "sep_conv_5x5",
    "dil_conv_3x3",
    "dil_conv_5x5",
];

/// Cell node receiving the first intermediate result
pub const FIRST_INTERMEDIATE: NodeId = 3;

/// Cell output node
pub const CELL_OUTPUT: NodeId = FIRST_INTERMEDIATE + NUM_VERTICES;

const PAIRS_PER_CELL: usize = 2 * NUM_VERTICES;

/// Compact encoding of a normal and a reduction cell
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Compact {
    pub normal: Vec<(usize, usize)>,
    pub reduction: Vec<(usize, usize)>,
}

impl Compact {
    /// Create a validated encoding
    pub fn new(normal: Vec<(usize, usize)>, reduction: Vec<(usize, usize)>) -> Result<Self> {
        let compact = Self { normal, reduction };
        compact.validate()?;
        Ok(compact)
    }

    /// Pairs of one cell type
    pub fn cell(&self, cell_type: CellType) -> &[(usize, usize)] {
        match cell_type {
            CellType::Normal => &self.normal,
            CellType::Reduction => &self.reduction,
        }
    }

    fn cell_mut(&mut self, cell_type: CellType) -> &mut Vec<(usize, usize)> {
        match cell_type {
            CellType::Normal => &mut self.normal,
            CellType::Reduction => &mut self.reduction,
        }
    }

    /// Check pair count, input range, op range and distinct inputs per node
    pub fn validate(&self) -> Result<()> {
        for cell_type in CellType::all() {
            let pairs = self.cell(cell_type);
            if pairs.len() != PAIRS_PER_CELL {
                return Err(KolosalError::InvalidInput(format!(
                    "{} encoding needs {} pairs, got {}",
                    cell_type.cell_name(),
                    PAIRS_PER_CELL,
                    pairs.len()
                )));
            }

            for (pos, node_pairs) in pairs.chunks(2).enumerate() {
                for &(input, op) in node_pairs {
                    if input >= pos + 2 {
                        return Err(KolosalError::InvalidInput(format!(
                            "{} node {} cannot take input {}",
                            cell_type.cell_name(),
                            pos,
                            input
                        )));
                    }
                    if op >= NUM_OPS {
                        return Err(KolosalError::InvalidInput(format!(
                            "operation index {} out of range",
                            op
                        )));
                    }
                }
                if node_pairs[0].0 == node_pairs[1].0 {
                    return Err(KolosalError::InvalidInput(format!(
                        "{} node {} uses input {} twice",
                        cell_type.cell_name(),
                        pos,
                        node_pairs[0].0
                    )));
                }
            }
        }
        Ok(())
    }

    /// Sample a uniformly random encoding
    pub fn sample_random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut normal = Vec::with_capacity(PAIRS_PER_CELL);
        let mut reduction = Vec::with_capacity(PAIRS_PER_CELL);

        for i in 0..NUM_VERTICES {
            let ops: Vec<usize> = (0..4).map(|_| rng.gen_range(0..NUM_OPS)).collect();
            let nodes_in_normal = index::sample(rng, i + 2, 2).into_vec();
            let nodes_in_reduce = index::sample(rng, i + 2, 2).into_vec();

            normal.extend([(nodes_in_normal[0], ops[0]), (nodes_in_normal[1], ops[1])]);
            reduction.extend([(nodes_in_reduce[0], ops[2]), (nodes_in_reduce[1], ops[3])]);
        }

        Self { normal, reduction }
    }

    /// Copy with between 1 and `max_mutations` single-pair changes.
    ///
    /// Every mutation hits a different pair, so the child never equals `self`.
    pub fn mutate<R: Rng + ?Sized>(&self, rng: &mut R, max_mutations: usize) -> Self {
        let mut child = self.clone();
        let n_mutations = rng.gen_range(1..=max_mutations.clamp(1, 2 * PAIRS_PER_CELL));

        for slot in index::sample(rng, 2 * PAIRS_PER_CELL, n_mutations) {
            let cell_type = if slot < PAIRS_PER_CELL { CellType::Normal } else { CellType::Reduction };
            let pairs = child.cell_mut(cell_type);
            let pair_idx = slot % PAIRS_PER_CELL;
            let pos = pair_idx / 2;
            let sibling_input = pairs[pair_idx ^ 1].0;
            let (input, op) = pairs[pair_idx];

            let free_inputs: Vec<usize> = (0..pos + 2)
                .filter(|&i| i != input && i != sibling_input)
                .collect();

            if free_inputs.is_empty() || rng.gen_bool(0.5) {
                let new_op = (op + rng.gen_range(1..NUM_OPS)) % NUM_OPS;
                pairs[pair_idx].1 = new_op;
            } else {
                pairs[pair_idx].0 = free_inputs[rng.gen_range(0..free_inputs.len())];
            }
        }

        child
    }

    /// Child taking each node's pair of inputs from either parent
    pub fn crossover<R: Rng + ?Sized>(&self, other: &Compact, rng: &mut R) -> Self {
        let mut child = self.clone();
        for cell_type in CellType::all() {
            let donor = other.cell(cell_type);
            let pairs = child.cell_mut(cell_type);
            for pos in 0..NUM_VERTICES {
                if rng.gen_bool(0.5) {
                    pairs[2 * pos] = donor[2 * pos];
                    pairs[2 * pos + 1] = donor[2 * pos + 1];
                }
            }
        }
        child
    }

    /// Identity hash, stable across builds and platforms (SHA-256 prefix)
    pub fn hash_u64(&self) -> u64 {
        let mut hasher = Sha256::new();
        for pairs in [&self.normal, &self.reduction] {
            hasher.update((pairs.len() as u64).to_le_bytes());
            for &(input, op) in pairs {
                hasher.update((input as u64).to_le_bytes());
                hasher.update((op as u64).to_le_bytes());
            }
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(prefix)
    }
}

/// Write a compact encoding into every cell of a macro-graph.
///
/// Edges named by the encoding get the chosen primitive and their pair
/// slot; all other non-final cell edges get the zero operation.
pub fn convert_compact_to_naslib(compact: &Compact, graph: &mut Graph) -> Result<()> {
    compact.validate()?;

    for (id, cell) in graph.cells_mut() {
        let Some(cell_type) = CellType::from_cell_name(cell.name()) else {
            continue;
        };
        let pairs = compact.cell(cell_type);

        for (pos, node_pairs) in pairs.chunks(2).enumerate() {
            for &(input, _) in node_pairs {
                if !cell.has_edge(input + 1, pos + FIRST_INTERMEDIATE) {
                    return Err(KolosalError::GraphError(format!(
                        "cell {} has no edge {} -> {}",
                        id,
                        input + 1,
                        pos + FIRST_INTERMEDIATE
                    )));
                }
            }
        }

        for (u, v, data) in cell.edges_mut() {
            if data.is_final() || !(FIRST_INTERMEDIATE..CELL_OUTPUT).contains(&v) {
                continue;
            }
            let pos = v - FIRST_INTERMEDIATE;
            let chosen = (0..2).find(|&slot| pairs[2 * pos + slot].0 + 1 == u);

            match chosen {
                Some(slot) => {
                    let op = pairs[2 * pos + slot].1;
                    data.select_by_name(COMPACT_OPS[op], Some(slot))?;
                }
                None => data.select_by_name("none", None)?,
            }
        }
    }
    Ok(())
}

/// Read the compact encoding back from the first cell of each type
pub fn convert_naslib_to_compact(graph: &Graph) -> Result<Compact> {
    let mut compact = Compact {
        normal: Vec::with_capacity(PAIRS_PER_CELL),
        reduction: Vec::with_capacity(PAIRS_PER_CELL),
    };

    for cell_type in CellType::all() {
        let cell = graph
            .cells()
            .find(|(_, cell)| cell.name() == cell_type.cell_name())
            .map(|(_, cell)| cell)
            .ok_or_else(|| {
                KolosalError::InvariantViolation(format!("graph has no {}", cell_type.cell_name()))
            })?;

        for v in FIRST_INTERMEDIATE..CELL_OUTPUT {
            let mut chosen = Vec::with_capacity(2);
            for (u, data) in cell.in_edges(v) {
                let Some(op) = data.chosen_op() else {
                    continue;
                };
                if op.is_zero() {
                    continue;
                }
                let op_idx = op
                    .genotype_name()
                    .and_then(|name| COMPACT_OPS.iter().position(|&o| o == name))
                    .ok_or_else(|| {
                        KolosalError::InvariantViolation(format!(
                            "edge {} -> {} holds a non-cell operation",
                            u, v
                        ))
                    })?;
                chosen.push((data.slot().unwrap_or(usize::MAX), u, op_idx));
            }

            if chosen.len() != 2 {
                return Err(KolosalError::InvariantViolation(format!(
                    "{} node {} has {} selected inputs, expected 2",
                    cell_type.cell_name(),
                    v,
                    chosen.len()
                )));
            }
            chosen.sort_unstable();
            compact
                .cell_mut(cell_type)
                .extend(chosen.into_iter().map(|(_, u, op)| (u - 1, op)));
        }
    }

    Ok(compact)
}

/// Genotype of a compact encoding
pub fn convert_compact_to_genotype(compact: &Compact) -> Genotype {
    let ops = |pairs: &[(usize, usize)]| -> Vec<(String, usize)> {
        pairs
            .iter()
            .map(|&(input, op)| (COMPACT_OPS[op].to_string(), input))
            .collect()
    };
    let concat: Vec<usize> = (2..2 + NUM_VERTICES).collect();

    Genotype {
        normal: ops(&compact.normal),
        normal_concat: concat.clone(),
        reduce: ops(&compact.reduction),
        reduce_concat: concat,
    }
}
