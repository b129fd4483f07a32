//! Edge Data
//!
//! Attribute container for a graph edge: the operation choice, the
//! architecture weights of a one-shot search and free-form attributes.

use std::collections::BTreeMap;

use ndarray::Array1;
use serde_json::Value;

use super::primitives::Operation;
use crate::error::{KolosalError, Result};

/// Operation state of an edge
#[derive(Debug, Clone)]
pub enum EdgeOp {
    /// A single concrete operation
    Fixed(Operation),
    /// Candidate operations, optionally with architecture weights (alpha)
    Candidates {
        ops: Vec<Operation>,
        alpha: Option<Array1<f64>>,
    },
    /// Operation that can no longer be reassigned
    Finalized(Operation),
}

/// Data attached to a graph edge
#[derive(Debug, Clone)]
pub struct EdgeData {
    op: EdgeOp,
    /// Candidate list kept after a primitive was selected
    primitives: Option<Vec<Operation>>,
    /// Index of the selected primitive
    op_index: Option<usize>,
    /// Position of this edge among the chosen inputs of its target node
    slot: Option<usize>,
    deleted: bool,
    attributes: BTreeMap<String, Value>,
}

impl Default for EdgeData {
    fn default() -> Self {
        Self::with_op(Operation::identity())
    }
}

impl EdgeData {
    /// Create edge data holding the identity operation
    pub fn new() -> Self {
        Self::default()
    }

    /// Create edge data holding a single operation
    pub fn with_op(op: Operation) -> Self {
        Self {
            op: EdgeOp::Fixed(op),
            primitives: None,
            op_index: None,
            slot: None,
            deleted: false,
            attributes: BTreeMap::new(),
        }
    }

    /// Create edge data whose operation is already final
    pub fn finalized(op: Operation) -> Self {
        let mut data = Self::with_op(op);
        data.op = match data.op {
            EdgeOp::Fixed(op) => EdgeOp::Finalized(op),
            other => other,
        };
        data
    }

    pub fn op(&self) -> &EdgeOp {
        &self.op
    }

    pub fn is_final(&self) -> bool {
        matches!(self.op, EdgeOp::Finalized(_))
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_final() {
            return Err(KolosalError::GraphError(
                "cannot reassign the operation of a finalized edge".to_string(),
            ));
        }
        Ok(())
    }

    /// Replace the operation with a single one
    pub fn set_op(&mut self, op: Operation) -> Result<()> {
        self.ensure_mutable()?;
        self.op = EdgeOp::Fixed(op);
        Ok(())
    }

    /// Replace the operation with a candidate set
    pub fn set_candidates(&mut self, ops: Vec<Operation>) -> Result<()> {
        self.ensure_mutable()?;
        self.op = EdgeOp::Candidates { ops, alpha: None };
        self.primitives = None;
        self.op_index = None;
        self.slot = None;
        Ok(())
    }

    /// Attach architecture weights to the candidate set
    pub fn set_alpha(&mut self, weights: Array1<f64>) -> Result<()> {
        match &mut self.op {
            EdgeOp::Candidates { ops, alpha } => {
                if ops.len() != weights.len() {
                    return Err(KolosalError::InvalidInput(format!(
                        "expected {} architecture weights, got {}",
                        ops.len(),
                        weights.len()
                    )));
                }
                *alpha = Some(weights);
                Ok(())
            }
            _ => Err(KolosalError::GraphError(
                "architecture weights require a candidate set".to_string(),
            )),
        }
    }

    pub fn alpha(&self) -> Option<&Array1<f64>> {
        match &self.op {
            EdgeOp::Candidates { alpha, .. } => alpha.as_ref(),
            _ => None,
        }
    }

    pub fn has_alpha(&self) -> bool {
        self.alpha().is_some()
    }

    /// Candidate operations, if the edge still holds a candidate set
    pub fn candidates(&self) -> Option<&[Operation]> {
        match &self.op {
            EdgeOp::Candidates { ops, .. } => Some(ops),
            _ => None,
        }
    }

    /// Candidate set, or the one retained after a primitive was selected
    pub fn primitives(&self) -> Option<&[Operation]> {
        match &self.op {
            EdgeOp::Candidates { ops, .. } => Some(ops),
            _ => self.primitives.as_deref(),
        }
    }

    /// Mark the current single operation as final
    pub fn finalize(&mut self) -> Result<()> {
        let op = match &self.op {
            EdgeOp::Finalized(_) => return Ok(()),
            EdgeOp::Fixed(op) => op.clone(),
            EdgeOp::Candidates { .. } => {
                return Err(KolosalError::GraphError(
                    "cannot finalize an edge that still holds candidates".to_string(),
                ))
            }
        };
        self.op = EdgeOp::Finalized(op);
        Ok(())
    }

    /// Select one primitive of the candidate set as the edge operation
    pub fn select_primitive(&mut self, index: usize, slot: Option<usize>) -> Result<()> {
        self.ensure_mutable()?;
        let primitives = self
            .primitives()
            .map(|ops| ops.to_vec())
            .ok_or_else(|| KolosalError::GraphError("edge has no candidate primitives".to_string()))?;

        let op = primitives.get(index).cloned().ok_or_else(|| {
            KolosalError::GraphError(format!(
                "primitive index {} out of range for {} candidates",
                index,
                primitives.len()
            ))
        })?;

        self.op = EdgeOp::Fixed(op);
        self.primitives = Some(primitives);
        self.op_index = Some(index);
        self.slot = slot;
        Ok(())
    }

    /// Select the primitive with the given genotype name
    pub fn select_by_name(&mut self, name: &str, slot: Option<usize>) -> Result<()> {
        let index = self
            .primitives()
            .and_then(|ops| ops.iter().position(|op| op.genotype_name() == Some(name)))
            .ok_or_else(|| KolosalError::GraphError(format!("edge has no primitive named {}", name)))?;
        self.select_primitive(index, slot)
    }

    pub fn op_index(&self) -> Option<usize> {
        self.op_index
    }

    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Drop the zero operation from the candidate set, returns whether one was removed
    pub fn remove_zero_candidate(&mut self) -> bool {
        let EdgeOp::Candidates { ops, alpha } = &mut self.op else {
            return false;
        };
        let Some(pos) = ops.iter().position(|op| op.is_zero()) else {
            return false;
        };

        ops.remove(pos);
        if let Some(weights) = alpha.as_mut() {
            *weights = weights
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != pos)
                .map(|(_, w)| *w)
                .collect();
        }
        true
    }

    /// Force the weight of the zero operation to negative infinity
    pub fn suppress_zero_weight(&mut self) {
        if let EdgeOp::Candidates { ops, alpha: Some(weights) } = &mut self.op {
            if let Some(pos) = ops.iter().position(|op| op.is_zero()) {
                weights[pos] = f64::NEG_INFINITY;
            }
        }
    }

    /// Largest post-softmax architecture weight of this edge
    pub fn largest_softmax_weight(&self) -> Option<f64> {
        self.alpha()
            .map(|alpha| softmax(alpha).iter().cloned().fold(f64::NEG_INFINITY, f64::max))
    }

    /// The operation this edge stands for in a discrete architecture
    pub fn chosen_op(&self) -> Option<&Operation> {
        match &self.op {
            EdgeOp::Fixed(op) | EdgeOp::Finalized(op) => Some(op),
            EdgeOp::Candidates { ops, alpha: Some(alpha) } => ops
                .iter()
                .zip(alpha.iter())
                .filter(|(op, _)| !op.is_zero())
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(op, _)| op),
            EdgeOp::Candidates { .. } => None,
        }
    }

    /// Whether the edge currently holds the zero operation
    pub fn is_zero(&self) -> bool {
        matches!(&self.op, EdgeOp::Fixed(op) | EdgeOp::Finalized(op) if op.is_zero())
    }

    /// Mark for removal; the owning graph drops it after the current update
    pub fn delete(&mut self) {
        self.deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Set a named attribute
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Apply the choice made on a template edge of another cell instance
    pub fn mirror_choice_from(&mut self, template: &EdgeData) -> Result<()> {
        if self.is_final() {
            return Ok(());
        }

        match &template.op {
            EdgeOp::Candidates { ops: template_ops, alpha: template_alpha } => {
                if let EdgeOp::Candidates { ops, alpha } = &mut self.op {
                    ops.retain(|op| template_ops.iter().any(|t| t.same_primitive(op)));
                    if let Some(weights) = template_alpha {
                        if weights.len() == ops.len() {
                            *alpha = Some(weights.clone());
                        }
                    }
                }
            }
            EdgeOp::Fixed(chosen) | EdgeOp::Finalized(chosen) => {
                let index = self
                    .primitives()
                    .and_then(|ops| ops.iter().position(|op| op.same_primitive(chosen)));
                match index {
                    Some(index) => self.select_primitive(index, template.slot)?,
                    None => self.set_op(chosen.clone())?,
                }
                if template.is_final() {
                    self.finalize()?;
                }
            }
        }
        Ok(())
    }
}

/// Softmax function
pub(crate) fn softmax(logits: &Array1<f64>) -> Array1<f64> {
    let max_val = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max_val.is_finite() {
        return Array1::from_elem(logits.len(), 1.0 / logits.len().max(1) as f64);
    }
    let exp: Array1<f64> = logits.mapv(|x| (x - max_val).exp());
    let sum: f64 = exp.sum();
    exp / sum
}
