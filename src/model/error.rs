// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for transformation-graph errors.

use thiserror::Error;

use super::TransformKind;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Node index {node} is not registered; the arena has {num_nodes} nodes")]
    UnknownNode { node: usize, num_nodes: usize },

    #[error(
        "Parameter index {iparam} is out of range for {kind} node {node} with {nparam} parameters"
    )]
    InvalidParamIndex {
        node: usize,
        kind: TransformKind,
        iparam: usize,
        nparam: usize,
    },

    #[error("Node {node} is a {found} transformation; expected {expected}")]
    WrongKind {
        node: usize,
        expected: TransformKind,
        found: TransformKind,
    },

    #[error(
        "Flattened parameter index {iparam} exceeds the {nparam} parameters reachable from node {node}"
    )]
    FlatIndexOutOfRange {
        node: usize,
        iparam: usize,
        nparam: usize,
    },

    #[error("Parameter {iparam} of node {node} is already bound to a time function")]
    AlreadyBound { node: usize, iparam: usize },

    #[error("Parameter {iparam} of node {node} is not bound to a time function")]
    NotBound { node: usize, iparam: usize },

    #[error("A bound time function must have at least one coefficient")]
    EmptyPolynomial,

    #[error("Parameter structures do not match: {dest} parameters here vs {src} in the source")]
    StructureMismatch { dest: usize, src: usize },
}
