//! Tensor-ops helpers the quantization path is written against.
//!
//! candle ships `matmul`, `permute`, `unsqueeze` and `squeeze` but no
//! einsum, so [`einsum`] lowers a two-operand contraction onto a single
//! batched matmul:
//!
//! ```text
//! lhs → permute [batch, lhs_free, contracted] → reshape (B, M, K)
//! rhs → permute [batch, contracted, rhs_free] → reshape (B, K, N)
//! (B, M, N) → reshape [batch, lhs_free, rhs_free] → permute output order
//! ```
//!
//! Everything goes through ordinary candle ops, so the result is
//! differentiable with candle's autodiff.

use std::collections::HashMap;

use candle_core::Tensor;

use qdense_common::{QDenseError, Result};

/// Split `"lhs,rhs->out"` into per-operand label lists. Letters only.
pub fn split_contraction(equation: &str) -> Result<(Vec<char>, Vec<char>, Vec<char>)> {
    let (operands, output) = equation
        .split_once("->")
        .ok_or_else(|| QDenseError::equation(equation, "missing '->'"))?;
    let (lhs, rhs) = operands
        .split_once(',')
        .ok_or_else(|| QDenseError::equation(equation, "expected two comma-separated operands"))?;
    let labels = |spec: &str| -> Result<Vec<char>> {
        if let Some(bad) = spec.chars().find(|c| !c.is_ascii_alphabetic()) {
            return Err(QDenseError::equation(
                equation,
                format!("unexpected character '{bad}'"),
            ));
        }
        let chars: Vec<char> = spec.chars().collect();
        for (i, c) in chars.iter().enumerate() {
            if chars[..i].contains(c) {
                return Err(QDenseError::equation(
                    equation,
                    format!("label '{c}' repeated within '{spec}'"),
                ));
            }
        }
        Ok(chars)
    };
    Ok((labels(lhs)?, labels(rhs)?, labels(output)?))
}

/// Two-operand einsum over single-letter labels, e.g. `"abc,cd->abd"`.
///
/// Labels that appear in only one operand and not in the output are summed
/// away before the contraction. Both operands must share a dtype.
pub fn einsum(equation: &str, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let (lhs_labels, rhs_labels, out_labels) = split_contraction(equation)?;

    if let Some(&missing) = out_labels
        .iter()
        .find(|&l| !lhs_labels.contains(l) && !rhs_labels.contains(l))
    {
        return Err(QDenseError::equation(
            equation,
            format!("output label '{missing}' appears in neither operand"),
        ));
    }

    let mut sizes: HashMap<char, usize> = HashMap::new();
    for (labels, t) in [(&lhs_labels, lhs), (&rhs_labels, rhs)] {
        if labels.len() != t.rank() {
            return Err(QDenseError::ShapeMismatch(format!(
                "equation '{equation}' labels '{}' an operand of shape {:?}",
                labels.iter().collect::<String>(),
                t.dims()
            )));
        }
        for (&label, &dim) in labels.iter().zip(t.dims()) {
            match sizes.get(&label) {
                Some(&prev) if prev != dim => {
                    return Err(QDenseError::ShapeMismatch(format!(
                        "label '{label}' has size {prev} in one operand and {dim} in the other \
                         (lhs {:?}, rhs {:?})",
                        lhs.dims(),
                        rhs.dims()
                    )));
                }
                _ => {
                    sizes.insert(label, dim);
                }
            }
        }
    }
    let (lhs, lhs_labels) = sum_private(lhs, &lhs_labels, &rhs_labels, &out_labels)?;
    let (rhs, rhs_labels) = sum_private(rhs, &rhs_labels, &lhs_labels, &out_labels)?;

    let batch: Vec<char> = out_labels
        .iter()
        .filter(|&l| lhs_labels.contains(l) && rhs_labels.contains(l))
        .copied()
        .collect();
    let contracted: Vec<char> = lhs_labels
        .iter()
        .filter(|&l| rhs_labels.contains(l) && !out_labels.contains(l))
        .copied()
        .collect();
    let lhs_free: Vec<char> = lhs_labels
        .iter()
        .filter(|&l| !rhs_labels.contains(l))
        .copied()
        .collect();
    let rhs_free: Vec<char> = rhs_labels
        .iter()
        .filter(|&l| !lhs_labels.contains(l))
        .copied()
        .collect();

    let numel = |labels: &[char]| labels.iter().map(|l| sizes[l]).product::<usize>();
    let (b, m, k, n) = (
        numel(&batch),
        numel(&lhs_free),
        numel(&contracted),
        numel(&rhs_free),
    );

    let lhs_order = [batch.as_slice(), lhs_free.as_slice(), contracted.as_slice()].concat();
    let rhs_order = [batch.as_slice(), contracted.as_slice(), rhs_free.as_slice()].concat();
    let lhs3 = permute_labels(&lhs, &lhs_labels, &lhs_order)?.reshape((b, m, k))?;
    let rhs3 = permute_labels(&rhs, &rhs_labels, &rhs_order)?.reshape((b, k, n))?;
    let product = lhs3.matmul(&rhs3)?;

    let result_labels = [batch.as_slice(), lhs_free.as_slice(), rhs_free.as_slice()].concat();
    let result_dims: Vec<usize> = result_labels.iter().map(|l| sizes[l]).collect();
    let product = product.reshape(result_dims)?;
    permute_labels(&product, &result_labels, &out_labels)
}

/// Sum over labels that only `labels` carries and the output drops.
fn sum_private(
    t: &Tensor,
    labels: &[char],
    other: &[char],
    output: &[char],
) -> Result<(Tensor, Vec<char>)> {
    let private: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|&(_, l)| !other.contains(l) && !output.contains(l))
        .map(|(i, _)| i)
        .collect();
    if private.is_empty() {
        return Ok((t.clone(), labels.to_vec()));
    }
    let kept = labels
        .iter()
        .enumerate()
        .filter(|(i, _)| !private.contains(i))
        .map(|(_, &l)| l)
        .collect();
    Ok((t.sum(private)?, kept))
}

/// Permute `t`, currently laid out as `from`, into the order `to`.
fn permute_labels(t: &Tensor, from: &[char], to: &[char]) -> Result<Tensor> {
    let perm: Vec<usize> = to
        .iter()
        .map(|l| from.iter().position(|f| f == l))
        .collect::<Option<_>>()
        .ok_or_else(|| {
            QDenseError::ShapeMismatch(format!(
                "cannot permute labels {from:?} into {to:?}"
            ))
        })?;
    transpose(t, &perm)
}

/// `transpose(tensor, perm)`; the identity permutation is a no-op.
pub fn transpose(t: &Tensor, perm: &[usize]) -> Result<Tensor> {
    if perm.iter().enumerate().all(|(i, &p)| i == p) {
        return Ok(t.clone());
    }
    Ok(t.permute(perm.to_vec())?.contiguous()?)
}

/// Insert size-1 axes. `axes` are positions in the result.
pub fn expand_dims(t: &Tensor, axes: &[usize]) -> Result<Tensor> {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    let mut out = t.clone();
    for axis in sorted {
        out = out.unsqueeze(axis)?;
    }
    Ok(out)
}

/// Remove size-1 axes. `axes` are positions in the input.
pub fn squeeze(t: &Tensor, axes: &[usize]) -> Result<Tensor> {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let mut out = t.clone();
    for axis in sorted {
        if out.dim(axis)? != 1 {
            return Err(QDenseError::ShapeMismatch(format!(
                "cannot squeeze axis {axis} of shape {:?}",
                out.dims()
            )));
        }
        out = out.squeeze(axis)?;
    }
    Ok(out)
}

// ── Tests ───────────────────────────────────────────────────────────────────
