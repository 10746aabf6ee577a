//! Axis bookkeeping for int8 einsum.
//!
//! Quantizing an operand over its reduced axes (the ones the contraction
//! sums away) leaves a scale tensor with the operand's rank and size 1 on
//! every reduced axis. To descale the contraction output with a plain
//! broadcasting multiply, that scale has to be rearranged into the output
//! layout:
//!
//! 1. `transpose`: surviving axes in output order, reduced axes parked on
//!    output positions the operand does not contribute to ("expand slots").
//! 2. `expand`: size-1 axes for the expand slots left over.
//! 3. `squeeze`: reduced axes that found no slot, removed again.
//!
//! Reduced axes always prefer a slot; they are squeezed only once the
//! slots run out. Overflow axes are appended to the permutation, so after
//! step 2 they sit at `output_rank..` and `squeeze` lists those positions.

use std::collections::VecDeque;

use candle_core::Tensor;
use serde::Serialize;

use qdense_common::{QDenseError, Result};

use crate::einsum::{expand_dims, squeeze, transpose};
use crate::equation::ParsedEquation;

/// Per-operand part of an [`AxisPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperandAxes {
    /// Operand axes absent from the output spec.
    pub reduced: Vec<usize>,
    /// Full permutation of the operand axes.
    pub transpose: Vec<usize>,
    /// Output positions that receive an inserted size-1 axis.
    pub expand: Vec<usize>,
    /// Positions (after `expand`) that are removed.
    pub squeeze: Vec<usize>,
}

/// Everything the int8 path derives from an equation and the input rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AxisPlan {
    /// Specs with the ellipsis expanded into explicit labels.
    pub input_spec: String,
    pub weight_spec: String,
    pub output_spec: String,
    pub input: OperandAxes,
    pub weight: OperandAxes,
    /// `output,weight->input`: the input-gradient contraction.
    pub reciprocal_equation: String,
}

impl AxisPlan {
    /// Build the plan for `equation` applied to an input of `input_rank`.
    pub fn analyze(equation: &str, input_rank: usize) -> Result<Self> {
        let parsed = ParsedEquation::parse(equation)?;
        Self::from_parsed(&parsed, input_rank)
    }

    pub fn from_parsed(equation: &ParsedEquation, input_rank: usize) -> Result<Self> {
        let expanded = equation.expand(input_rank)?;
        let input = OperandAxes::derive(&expanded.input_spec, &expanded.output_spec);
        let weight = OperandAxes::derive(&expanded.weight_spec, &expanded.output_spec);
        let output_rank = expanded.output_spec.len();
        for (name, axes) in [("input", &input), ("weight", &weight)] {
            if axes.aligned_rank() != output_rank {
                return Err(QDenseError::ShapeMismatch(format!(
                    "{name} scale of equation '{equation}' aligns to rank {}, output rank is \
                     {output_rank}",
                    axes.aligned_rank()
                )));
            }
        }
        let reciprocal_equation = format!(
            "{},{}->{}",
            expanded.output_spec, expanded.weight_spec, expanded.input_spec
        );
        tracing::debug!(
            equation = %equation,
            input_rank,
            ?input,
            ?weight,
            %reciprocal_equation,
            "derived axis plan"
        );
        Ok(Self {
            input_spec: expanded.input_spec,
            weight_spec: expanded.weight_spec,
            output_spec: expanded.output_spec,
            input,
            weight,
            reciprocal_equation,
        })
    }

    /// The forward contraction with every axis labelled.
    pub fn equation(&self) -> String {
        format!(
            "{},{}->{}",
            self.input_spec, self.weight_spec, self.output_spec
        )
    }

    pub fn output_rank(&self) -> usize {
        self.output_spec.len()
    }
}

impl OperandAxes {
    /// Derive the axis lists for one operand spec against the output spec.
    pub fn derive(operand_spec: &str, output_spec: &str) -> Self {
        let reduced: Vec<usize> = operand_spec
            .chars()
            .enumerate()
            .filter(|&(_, c)| !output_spec.contains(c))
            .map(|(i, _)| i)
            .collect();
        let mut surviving = Vec::new();
        let mut slots = Vec::new();
        for (i, label) in output_spec.chars().enumerate() {
            match operand_spec.find(label) {
                Some(src) => surviving.push(src),
                None => slots.push(i),
            }
        }
        let (transpose, expand, squeeze) =
            allocate_reduced_axes(&reduced, surviving, slots, output_spec.len());
        Self {
            reduced,
            transpose,
            expand,
            squeeze,
        }
    }

    /// Rank of a scale tensor after [`OperandAxes::align`].
    pub fn aligned_rank(&self) -> usize {
        self.transpose.len() + self.expand.len() - self.squeeze.len()
    }

    /// Shape of the aligned scale for an operand of `operand_shape`.
    pub fn scale_shape(&self, operand_shape: &[usize]) -> Vec<usize> {
        let mut shape: Vec<usize> = self
            .transpose
            .iter()
            .map(|&axis| {
                if self.reduced.contains(&axis) {
                    1
                } else {
                    operand_shape[axis]
                }
            })
            .collect();
        let mut expand = self.expand.clone();
        expand.sort_unstable();
        for axis in expand {
            shape.insert(axis, 1);
        }
        let mut squeeze = self.squeeze.clone();
        squeeze.sort_unstable_by(|a, b| b.cmp(a));
        for axis in squeeze {
            shape.remove(axis);
        }
        shape
    }

    /// Rearrange a keep-dims scale (operand layout) into the output layout.
    pub fn align(&self, scale: &Tensor) -> Result<Tensor> {
        let t = transpose(scale, &self.transpose)?;
        let t = expand_dims(&t, &self.expand)?;
        squeeze(&t, &self.squeeze)
    }

    /// Exact inverse of [`OperandAxes::align`].
    pub fn unalign(&self, aligned: &Tensor) -> Result<Tensor> {
        if aligned.rank() != self.aligned_rank() {
            return Err(QDenseError::ShapeMismatch(format!(
                "aligned scale of shape {:?} should have rank {}",
                aligned.dims(),
                self.aligned_rank()
            )));
        }
        let t = expand_dims(aligned, &self.squeeze)?;
        let t = squeeze(&t, &self.expand)?;
        let mut inverse = vec![0; self.transpose.len()];
        for (pos, &axis) in self.transpose.iter().enumerate() {
            inverse[axis] = pos;
        }
        transpose(&t, &inverse)
    }
}

/// Place reduced axes into the permutation.
///
/// Each reduced axis, in operand order, takes the next free expand slot and
/// is inserted into `transpose` there. Once slots run out the remaining
/// reduced axes go to the end of the permutation and their post-expand
/// positions (`output_rank`, `output_rank + 1`, ...) become squeeze axes.
///
/// Returns `(transpose, expand, squeeze)`.
pub fn allocate_reduced_axes(
    reduced: &[usize],
    mut transpose: Vec<usize>,
    slots: Vec<usize>,
    output_rank: usize,
) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
    let mut slots: VecDeque<usize> = slots.into();
    let mut overflow = Vec::new();
    for &axis in reduced {
        match slots.pop_front() {
            Some(slot) => transpose.insert(slot, axis),
            None => overflow.push(axis),
        }
    }
    let squeeze = (output_rank..output_rank + overflow.len()).collect();
    transpose.extend(overflow);
    (transpose, slots.into(), squeeze)
}

// ── Tests ───────────────────────────────────────────────────────────────────
