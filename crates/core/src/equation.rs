//! Einsum equation parsing and build-time shape inference.
//!
//! A layer equation has one of three shapes:
//!
//! | Grammar | Example |
//! |---------|---------|
//! | no ellipsis | `ab,bc->ac` |
//! | ellipsis on the left | `...ab,bc->...ac` |
//! | ellipsis on the right | `ab...,bc->ac...` |
//!
//! The ellipsis stands for a run of unlabeled, batch-like axes. It must
//! appear on the same side of the input and output specs and never in the
//! weight spec.

use std::fmt;
use std::str::FromStr;

use qdense_common::{QDenseError, Result};

const ELLIPSIS: &str = "...";

/// Where the elided axes sit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EllipsisSide {
    NoEllipsis,
    EllipsisLeft,
    EllipsisRight,
}

/// An equation split into its three label specs, ellipsis removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEquation {
    pub input_spec: String,
    pub weight_spec: String,
    pub output_spec: String,
    pub ellipsis: EllipsisSide,
}

/// Label specs with elided axes replaced by fresh labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedEquation {
    pub input_spec: String,
    pub weight_spec: String,
    pub output_spec: String,
}

impl ExpandedEquation {
    /// The plain contraction `input,weight->output`.
    pub fn contraction(&self) -> String {
        format!(
            "{},{}->{}",
            self.input_spec, self.weight_spec, self.output_spec
        )
    }
}

impl ParsedEquation {
    pub fn parse(equation: &str) -> Result<Self> {
        let invalid = || {
            QDenseError::equation(
                equation,
                "equations must be in the form [X],[Y]->[Z], ...[X],[Y]->...[Z], or [X]...,[Y]->[Z]...",
            )
        };

        let (operands, output) = equation.split_once("->").ok_or_else(invalid)?;
        let (input, weight) = operands.split_once(',').ok_or_else(invalid)?;
        if output.contains("->") || weight.contains(',') {
            return Err(invalid());
        }

        let (ellipsis, input_spec, output_spec) = match (
            input.strip_prefix(ELLIPSIS),
            output.strip_prefix(ELLIPSIS),
            input.strip_suffix(ELLIPSIS),
            output.strip_suffix(ELLIPSIS),
        ) {
            (Some(i), Some(o), _, _) => (EllipsisSide::EllipsisLeft, i, o),
            (None, None, Some(i), Some(o)) => {
                // The right-elided form needs at least two explicit input labels.
                if i.len() < 2 {
                    return Err(invalid());
                }
                (EllipsisSide::EllipsisRight, i, o)
            }
            (None, None, None, None) => (EllipsisSide::NoEllipsis, input, output),
            _ => return Err(invalid()),
        };

        for spec in [input_spec, weight, output_spec] {
            if spec.is_empty() || !spec.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(invalid());
            }
            let mut seen = String::new();
            for c in spec.chars() {
                if seen.contains(c) {
                    return Err(QDenseError::equation(
                        equation,
                        format!("label '{c}' repeated within '{spec}'"),
                    ));
                }
                seen.push(c);
            }
        }

        if let Some(dim) = output_spec
            .chars()
            .find(|&c| !input_spec.contains(c) && !weight.contains(c))
        {
            return Err(QDenseError::equation(
                equation,
                format!(
                    "dimension '{dim}' was specified in the output '{output_spec}' but has no \
                     corresponding dim in the input spec '{input_spec}' or weight spec '{weight}'"
                ),
            ));
        }

        Ok(Self {
            input_spec: input_spec.to_string(),
            weight_spec: weight.to_string(),
            output_spec: output_spec.to_string(),
            ellipsis,
        })
    }

    /// Number of elided axes for an input of rank `input_rank`.
    pub fn elided(&self, input_rank: usize) -> Result<usize> {
        let explicit = self.input_spec.len();
        match self.ellipsis {
            EllipsisSide::NoEllipsis if input_rank != explicit => {
                Err(QDenseError::ShapeMismatch(format!(
                    "equation '{self}' expects an input of rank {explicit}, got rank {input_rank}"
                )))
            }
            EllipsisSide::NoEllipsis => Ok(0),
            _ if input_rank < explicit => Err(QDenseError::ShapeMismatch(format!(
                "equation '{self}' expects an input of rank >= {explicit}, got rank {input_rank}"
            ))),
            _ => Ok(input_rank - explicit),
        }
    }

    /// Replace the ellipsis with fresh labels so every axis is named.
    ///
    /// Padding labels come, in sorted order, from the ASCII letters used
    /// nowhere in the equation.
    pub fn expand(&self, input_rank: usize) -> Result<ExpandedEquation> {
        let elided = self.elided(input_rank)?;
        let unused: Vec<char> = ('A'..='Z')
            .chain('a'..='z')
            .filter(|&c| {
                !self.input_spec.contains(c)
                    && !self.weight_spec.contains(c)
                    && !self.output_spec.contains(c)
            })
            .collect();
        if elided > unused.len() {
            return Err(QDenseError::equation(
                &self.to_string(),
                format!("{elided} elided axes but only {} free labels", unused.len()),
            ));
        }
        let pad: String = unused[..elided].iter().collect();
        let (input_spec, output_spec) = match self.ellipsis {
            EllipsisSide::NoEllipsis => (self.input_spec.clone(), self.output_spec.clone()),
            EllipsisSide::EllipsisLeft => (
                format!("{pad}{}", self.input_spec),
                format!("{pad}{}", self.output_spec),
            ),
            EllipsisSide::EllipsisRight => (
                format!("{}{pad}", self.input_spec),
                format!("{}{pad}", self.output_spec),
            ),
        };
        Ok(ExpandedEquation {
            input_spec,
            weight_spec: self.weight_spec.clone(),
            output_spec,
        })
    }
}

impl FromStr for ParsedEquation {
    type Err = QDenseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ParsedEquation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pre, post) = match self.ellipsis {
            EllipsisSide::NoEllipsis => ("", ""),
            EllipsisSide::EllipsisLeft => (ELLIPSIS, ""),
            EllipsisSide::EllipsisRight => ("", ELLIPSIS),
        };
        write!(
            f,
            "{pre}{}{post},{}->{pre}{}{post}",
            self.input_spec, self.weight_spec, self.output_spec
        )
    }
}

// ── Shape inference ─────────────────────────────────────────────────────────

/// Shapes resolved at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EinsumShapes {
    pub kernel_shape: Vec<usize>,
    pub bias_shape: Option<Vec<usize>>,
    /// Full output shape including batch and elided axes.
    pub output_shape: Vec<Option<usize>>,
}

/// Resolve kernel, bias and output shapes for `equation` applied to an
/// input of `input_shape` (batch dimension first, `None` = unknown).
///
/// `partial_output_shape` excludes the batch dimension and elided axes.
pub fn analyze_shapes(
    equation: &ParsedEquation,
    bias_axes: Option<&str>,
    input_shape: &[Option<usize>],
    partial_output_shape: &[Option<usize>],
) -> Result<EinsumShapes> {
    let input_spec: Vec<char> = equation.input_spec.chars().collect();
    let output_spec: Vec<char> = equation.output_spec.chars().collect();
    let left_elided = equation.ellipsis == EllipsisSide::EllipsisLeft;
    if input_shape.is_empty() {
        return Err(QDenseError::ShapeMismatch(
            "input shape must have at least a batch dimension".to_string(),
        ));
    }
    let elided = equation.elided(input_shape.len())?;

    // Batch dim, then the partial shape, then elided dims on the ellipsis side.
    // On the left the batch dim is itself the first elided axis.
    let mut output_shape: Vec<Option<usize>> = Vec::with_capacity(output_spec.len() + elided);
    output_shape.push(input_shape[0]);
    if left_elided && elided > 0 {
        output_shape.extend_from_slice(&input_shape[1..elided]);
    }
    output_shape.extend_from_slice(partial_output_shape);
    if !left_elided && elided > 0 {
        output_shape.extend_from_slice(&input_shape[input_shape.len() - elided..]);
    }
    if output_shape.len() != output_spec.len() + elided {
        return Err(QDenseError::ShapeMismatch(format!(
            "output shape {output_shape:?} (from partial {partial_output_shape:?}) does not \
             match output spec '{}' with {elided} elided axes",
            equation.output_spec
        )));
    }

    let offset = if left_elided { elided } else { 0 };
    let input_index = |label: char| input_spec.iter().position(|&c| c == label).map(|i| i + offset);
    let output_index =
        |label: char| output_spec.iter().position(|&c| c == label).map(|i| i + offset);

    for &dim in &input_spec {
        let (Some(i), Some(o)) = (input_index(dim), output_index(dim)) else {
            continue;
        };
        match (input_shape[i], output_shape[o]) {
            (Some(a), Some(b)) if a != b => {
                return Err(QDenseError::ShapeMismatch(format!(
                    "input shape and output shape do not match at shared dimension '{dim}': \
                     input shape is {input_shape:?}, output shape is {output_shape:?}"
                )));
            }
            (Some(a), None) => output_shape[o] = Some(a),
            _ => {}
        }
    }

    let mut kernel_shape = Vec::with_capacity(equation.weight_spec.len());
    for dim in equation.weight_spec.chars() {
        let size = match (input_index(dim), output_index(dim)) {
            (Some(i), _) => input_shape[i],
            (None, Some(o)) => output_shape[o],
            (None, None) => None,
        };
        kernel_shape.push(size.ok_or_else(|| QDenseError::UnresolvedWeightDim {
            label: dim,
            input_spec: equation.input_spec.clone(),
            output_spec: equation.output_spec.clone(),
        })?);
    }

    let bias_shape = match bias_axes {
        Some(axes) => Some(bias_shape(equation, axes, &output_shape, elided)?),
        None => None,
    };

    Ok(EinsumShapes {
        kernel_shape,
        bias_shape,
        output_shape,
    })
}

/// Bias shape: one entry per output label from the first bias-bearing
/// label on (size 1 for labels without bias), plus trailing 1s for axes
/// elided on the right.
fn bias_shape(
    equation: &ParsedEquation,
    bias_axes: &str,
    output_shape: &[Option<usize>],
    elided: usize,
) -> Result<Vec<usize>> {
    let output_spec = &equation.output_spec;
    let left_elided = equation.ellipsis == EllipsisSide::EllipsisLeft;
    let num_left_elided = if left_elided { elided } else { 0 };

    let mut first = output_spec.len();
    for axis in bias_axes.chars() {
        let pos = output_spec
            .find(axis)
            .ok_or_else(|| QDenseError::InvalidBiasAxis {
                axis,
                output_spec: output_spec.clone(),
            })?;
        first = first.min(pos);
    }
    if first == output_spec.len() {
        return Err(QDenseError::InvalidArgument(
            "bias_axes must name at least one output axis".to_string(),
        ));
    }

    let mut shape = Vec::with_capacity(output_spec.len() - first + elided);
    for (i, label) in output_spec.chars().enumerate().skip(first) {
        if bias_axes.contains(label) {
            let size = output_shape[i + num_left_elided].ok_or_else(|| {
                QDenseError::ShapeMismatch(format!(
                    "bias dimension '{label}' has unknown size in output shape {output_shape:?}"
                ))
            })?;
            shape.push(size);
        } else {
            shape.push(1);
        }
    }
    if !left_elided {
        shape.extend(std::iter::repeat(1).take(elided));
    }
    Ok(shape)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes(
        equation: &str,
        bias_axes: Option<&str>,
        input: &[Option<usize>],
        output: &[Option<usize>],
    ) -> Result<EinsumShapes> {
        analyze_shapes(&ParsedEquation::parse(equation)?, bias_axes, input, output)
    }

    #[test]
    fn parses_three_grammars() {
        let p = ParsedEquation::parse("ab,bc->ac").unwrap();
        assert_eq!(p.ellipsis, EllipsisSide::NoEllipsis);
        assert_eq!((p.input_spec.as_str(), p.weight_spec.as_str()), ("ab", "bc"));

        let p = ParsedEquation::parse("...b,bc->...c").unwrap();
        assert_eq!(p.ellipsis, EllipsisSide::EllipsisLeft);
        assert_eq!(p.output_spec, "c");

        let p = ParsedEquation::parse("ab...,bc->ac...").unwrap();
        assert_eq!(p.ellipsis, EllipsisSide::EllipsisRight);
        assert_eq!(p.to_string(), "ab...,bc->ac...");
    }

    #[test]
    fn rejects_malformed_equations() {
        for eq in [
            "ab,bc",
            "ab->ac",
            "ab,bc,cd->ad",
            "...ab,bc->ac",
            "ab,bc->...ac",
            "...ab,bc->ac...",
            "ab,...bc->ac",
            "a...,ab->b...",
            "ab,bc->ac0",
            "a.b,bc->ac",
            "aab,bc->ac",
            "ab,bc->ad",
        ] {
            let err = ParsedEquation::parse(eq).unwrap_err();
            assert!(
                matches!(err, QDenseError::InvalidEquation { .. }),
                "{eq} gave {err}"
            );
        }
    }

    #[test]
    fn expand_pads_with_unused_letters() {
        let p = ParsedEquation::parse("...b,bc->...c").unwrap();
        let e = p.expand(3).unwrap();
        assert_eq!(e.input_spec, "ABb");
        assert_eq!(e.output_spec, "ABc");
        assert_eq!(e.contraction(), "ABb,bc->ABc");

        let p = ParsedEquation::parse("Ab...,bc->Ac...").unwrap();
        let e = p.expand(3).unwrap();
        assert_eq!(e.input_spec, "AbB");
        assert_eq!(e.output_spec, "AcB");

        let p = ParsedEquation::parse("ab,bc->ac").unwrap();
        assert!(matches!(p.expand(3), Err(QDenseError::ShapeMismatch(_))));
    }

    #[test]
    fn dense_shapes() {
        let s = shapes("ab,bc->ac", Some("c"), &[None, Some(32)], &[Some(64)]).unwrap();
        assert_eq!(s.kernel_shape, vec![32, 64]);
        assert_eq!(s.bias_shape, Some(vec![64]));
        assert_eq!(s.output_shape, vec![None, Some(64)]);
    }

    #[test]
    fn end_weight_1d() {
        let s = shapes("ab,b->a", None, &[Some(2), Some(32)], &[]).unwrap();
        assert_eq!(s.kernel_shape, vec![32]);
        assert_eq!(s.bias_shape, None);
        assert_eq!(s.output_shape, vec![Some(2)]);
    }

    #[test]
    fn bert_style_projection_and_bias_variants() {
        let input = [Some(2), Some(1), Some(2)];
        let output = [Some(1), Some(3), Some(4)];
        let s = shapes("abc,cde->abde", None, &input, &output).unwrap();
        assert_eq!(s.kernel_shape, vec![2, 3, 4]);
        assert_eq!(s.output_shape, vec![Some(2), Some(1), Some(3), Some(4)]);

        let s = shapes("abc,cde->abde", Some("e"), &input, &output).unwrap();
        assert_eq!(s.bias_shape, Some(vec![4]));
        let s = shapes("abc,cde->abde", Some("d"), &input, &output).unwrap();
        assert_eq!(s.bias_shape, Some(vec![3, 1]));
        let s = shapes("abc,cde->abde", Some("be"), &input, &output).unwrap();
        assert_eq!(s.bias_shape, Some(vec![1, 1, 4]));
    }

    #[test]
    fn left_ellipsis_shapes() {
        let s = shapes("...b,bc->...c", Some("c"), &[None, Some(32), Some(128)], &[Some(64)])
            .unwrap();
        assert_eq!(s.kernel_shape, vec![128, 64]);
        assert_eq!(s.bias_shape, Some(vec![64]));
        assert_eq!(s.output_shape, vec![None, Some(32), Some(64)]);
    }

    #[test]
    fn right_ellipsis_shapes() {
        let s = shapes("ab...,bc->ac...", Some("c"), &[None, Some(4), Some(5)], &[Some(6)])
            .unwrap();
        assert_eq!(s.kernel_shape, vec![4, 6]);
        // One elided axis on the right: bias broadcasts over it.
        assert_eq!(s.bias_shape, Some(vec![6, 1]));
        assert_eq!(s.output_shape, vec![None, Some(6), Some(5)]);
    }

    #[test]
    fn unknown_output_dim_is_taken_from_input() {
        let s = shapes("abc,cd->abd", Some("d"), &[None, Some(32), Some(128)], &[None, Some(64)])
            .unwrap();
        assert_eq!(s.output_shape, vec![None, Some(32), Some(64)]);
    }

    #[test]
    fn shared_dim_disagreement_is_fatal() {
        let err = shapes("abc,cd->abd", None, &[None, Some(32), Some(128)], &[Some(16), Some(64)])
            .unwrap_err();
        assert!(matches!(err, QDenseError::ShapeMismatch(_)));
    }

    #[test]
    fn bias_axis_outside_output_is_fatal() {
        let err = shapes("ab,bc->ac", Some("b"), &[None, Some(32)], &[Some(64)]).unwrap_err();
        assert!(matches!(err, QDenseError::InvalidBiasAxis { axis: 'b', .. }));
    }

    #[test]
    fn unspecified_weight_dim_is_fatal() {
        let err = shapes("ab,bc->ac", None, &[None, Some(32)], &[None]).unwrap_err();
        assert!(matches!(err, QDenseError::UnresolvedWeightDim { label: 'c', .. }));
    }

    #[test]
    fn wrong_partial_output_rank_is_fatal() {
        let err = shapes("ab,bc->ac", None, &[None, Some(32)], &[Some(4), Some(4)]).unwrap_err();
        assert!(matches!(err, QDenseError::ShapeMismatch(_)));
    }
}
