//! Einsum expression to kernel graph generator
//!
//! `"ij,jk->ik"` becomes a single-region graph: one loop per index (output
//! indices first, then reduction indices in order of appearance), reads of
//! `inp0, inp1, ...`, and a write of `out`. When a reduction index exists the
//! region also reads `out`, since it accumulates into it.
//!
//! Without `->` the output is the sorted set of indices that appear exactly
//! once (`"ij,jk"` is `"ij,jk->ik"`). Every index `x` gets the extent symbol
//! `Nx`.

use crate::expr::SymExpr;
use crate::sdg::{GraphError, KernelGraph, Region};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EinsumError {
    #[error("einsum '{expr}': {reason}")]
    Malformed { expr: String, reason: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Parsed einsum operands
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EinsumSpec {
    pub inputs: Vec<Vec<char>>,
    pub output: Vec<char>,
}

/// Extent symbol of index `x`.
pub fn extent_symbol(index: char) -> String {
    format!("N{}", index)
}

impl EinsumSpec {
    pub fn parse(expr: &str) -> Result<Self, EinsumError> {
        let malformed = |reason: String| EinsumError::Malformed {
            expr: expr.to_string(),
            reason,
        };
        let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();

        let (lhs, explicit_output) = match compact.split_once("->") {
            Some((lhs, rhs)) => (lhs, Some(rhs)),
            None => (compact.as_str(), None),
        };

        let mut inputs = Vec::new();
        for operand in lhs.split(',') {
            if operand.is_empty() {
                return Err(malformed("empty operand".to_string()));
            }
            inputs.push(parse_indices(operand).map_err(&malformed)?);
        }

        let mut counts: BTreeMap<char, usize> = BTreeMap::new();
        for index in inputs.iter().flatten() {
            *counts.entry(*index).or_default() += 1;
        }

        let output = match explicit_output {
            Some(rhs) => {
                let output = parse_indices(rhs).map_err(&malformed)?;
                for (pos, index) in output.iter().enumerate() {
                    if !counts.contains_key(index) {
                        return Err(malformed(format!("output index '{}' appears in no input", index)));
                    }
                    if output[..pos].contains(index) {
                        return Err(malformed(format!("output index '{}' is repeated", index)));
                    }
                }
                output
            }
            None => counts
                .iter()
                .filter(|(_, &count)| count == 1)
                .map(|(&index, _)| index)
                .collect(),
        };

        if output.is_empty() {
            return Err(malformed("scalar outputs are not supported".to_string()));
        }
        Ok(EinsumSpec { inputs, output })
    }

    /// Output indices, then reduction indices in order of appearance.
    pub fn loop_order(&self) -> Vec<char> {
        let mut order = self.output.clone();
        for index in self.inputs.iter().flatten() {
            if !order.contains(index) {
                order.push(*index);
            }
        }
        order
    }

    pub fn has_reduction(&self) -> bool {
        self.loop_order().len() > self.output.len()
    }

    /// The kernel graph computing this contraction.
    pub fn to_graph(&self, name: &str) -> Result<KernelGraph, EinsumError> {
        let mut region = Region::new("einsum");
        for index in self.loop_order() {
            region = region.with_loop(index.to_string(), SymExpr::sym(extent_symbol(index)));
        }
        for (position, operand) in self.inputs.iter().enumerate() {
            region = region
                .read(format!("inp{}", position), &access_text(operand))
                .map_err(GraphError::from)?;
        }
        let output_access = access_text(&self.output);
        if self.has_reduction() {
            region = region.read("out", &output_access).map_err(GraphError::from)?;
        }
        region = region.write("out", &output_access).map_err(GraphError::from)?;

        let mut graph = KernelGraph::new(name);
        graph.add_region(region)?;
        Ok(graph)
    }
}

fn parse_indices(operand: &str) -> Result<Vec<char>, String> {
    let mut indices = Vec::new();
    for c in operand.chars() {
        if !c.is_ascii_alphabetic() {
            return Err(format!("'{}' is not an index letter", c));
        }
        indices.push(c);
    }
    if indices.is_empty() {
        return Err("operand has no indices".to_string());
    }
    Ok(indices)
}

fn access_text(indices: &[char]) -> String {
    indices.iter().map(|c| c.to_string()).collect::<Vec<_>>().join("*")
}

/// Build the kernel graph of an einsum expression.
pub fn einsum_graph(expr: &str) -> Result<KernelGraph, EinsumError> {
    EinsumSpec::parse(expr)?.to_graph(expr.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_matmul() {
        let spec = EinsumSpec::parse("ik, kj -> ij").unwrap();
        assert_eq!(spec.inputs, vec![vec!['i', 'k'], vec!['k', 'j']]);
        assert_eq!(spec.output, vec!['i', 'j']);
        assert_eq!(spec.loop_order(), vec!['i', 'j', 'k']);
        assert!(spec.has_reduction());
    }

    #[test]
    fn test_implicit_output() {
        let spec = EinsumSpec::parse("ij,jk").unwrap();
        assert_eq!(spec.output, vec!['i', 'k']);
    }

    #[test]
    fn test_graph_shape() {
        let graph = einsum_graph("ik,kj->ij").unwrap();
        assert_eq!(graph.len(), 1);
        let region = graph.region(0).unwrap();
        assert_eq!(region.variables(), vec!["i", "j", "k"]);
        assert_eq!(region.loops[2].extent, SymExpr::sym("Nk"));
        assert!(region.reads_array("inp0"));
        assert!(region.reads_array("out"), "reduction accumulates into the output");
        assert!(region.writes_array("out"));
        assert!(graph.check_connected().is_ok());
    }

    #[test]
    fn test_elementwise_does_not_read_output() {
        let graph = einsum_graph("ij,ij->ij").unwrap();
        assert!(!graph.region(0).unwrap().reads_array("out"));
    }

    #[test]
    fn test_malformed_expressions() {
        for bad in ["ij,->i", "i1,jk->ik", "ij,jk->iz", "ij,jk->ii", "i,i->"] {
            assert!(
                matches!(EinsumSpec::parse(bad), Err(EinsumError::Malformed { .. })),
                "'{}' should be rejected",
                bad
            );
        }
    }
}
