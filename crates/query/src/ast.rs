//! Filter AST.
//!
//! Two node shapes: a field comparison and a logical combinator.
//! `And`/`Or` nest freely; the only depth bound is the global node cap
//! enforced by the parser.

use serde_json::Value;

/// Comparison operators of the filter dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "$eq",
            CompareOp::Ne => "$ne",
            CompareOp::Gt => "$gt",
            CompareOp::Gte => "$gte",
            CompareOp::Lt => "$lt",
            CompareOp::Lte => "$lte",
            CompareOp::In => "$in",
        }
    }

    /// Operators usable as a B+Tree range bound.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte
        )
    }
}

/// One filter node.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field <op> literal`, with dotted-path field access.
    Field {
        path: String,
        op: CompareOp,
        literal: Value,
    },
    /// All children must match. `And(vec![])` matches everything (the
    /// empty query).
    And(Vec<Filter>),
    /// At least one child must match.
    Or(Vec<Filter>),
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn is_trivial(&self) -> bool {
        matches!(self, Filter::And(children) if children.is_empty())
    }

    /// Number of nodes in this subtree, for the complexity cap.
    pub fn node_count(&self) -> usize {
        match self {
            Filter::Field { .. } => 1,
            Filter::And(children) | Filter::Or(children) => {
                1 + children.iter().map(Filter::node_count).sum::<usize>()
            }
        }
    }

    /// The top-level conjuncts: the children of a root `And`, or the
    /// node itself.
    pub fn conjuncts(&self) -> &[Filter] {
        match self {
            Filter::And(children) => children,
            _ => std::slice::from_ref(self),
        }
    }
}
