// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The transformation graph: composable parametric Jones operators with
//! analytic gradients.
//!
//! All transformations live in a [ModelArena] and are addressed by stable
//! integer handles ([NodeId]); the arena owns every node and every other
//! reference is a non-owning handle, so graphs with shared sub-chains (e.g.
//! a common frontend across the target and calibrator paths) have a single
//! unambiguous owner and serialize trivially.
//!
//! The set of transformation kinds is closed ([TransformKind]); every
//! operation over kinds dispatches with an exhaustive `match`, so adding a
//! kind is a compile-time-checked, localized change.
//!
//! Evaluation takes the observation epoch explicitly; nothing in the graph
//! is a stateful subscriber to time changes. Bound parameters are pure
//! functions of the epoch.

mod error;
#[cfg(test)]
mod tests;
mod varying;

pub use error::ModelError;
pub use varying::TimePolynomial;

use std::collections::{HashMap, HashSet};

use hifitime::Epoch;
use indexmap::IndexMap;
use marlu::{c64, Jones};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use vec1::{vec1, Vec1};

/// A non-owning handle to a transformation node in a [ModelArena].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub(crate) usize);

/// An axis of the Poincaré sphere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter, Serialize, Deserialize)]
pub enum StokesAxis {
    Q,
    U,
    V,
}

impl StokesAxis {
    /// The Pauli matrix associated with this axis.
    pub(crate) fn sigma(self) -> Jones<f64> {
        let zero = c64::new(0.0, 0.0);
        let one = c64::new(1.0, 0.0);
        let i = c64::new(0.0, 1.0);
        match self {
            StokesAxis::Q => Jones::from([one, zero, zero, -one]),
            StokesAxis::U => Jones::from([zero, one, one, zero]),
            StokesAxis::V => Jones::from([zero, -i, i, zero]),
        }
    }
}

/// The closed set of transformation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter, Serialize, Deserialize)]
pub enum TransformKind {
    /// An absolute gain: J = g·I.
    Gain,

    /// The receiver backend: absolute gain, differential gain (hyperbolic
    /// radians) and differential phase (radians) between the two receptors.
    DiffGainPhase,

    /// A rotation of the Poincaré sphere about an axis:
    /// J = cos θ·I + i sin θ·σ.
    AxisRotation,

    /// A Lorentz boost along an axis of the Poincaré sphere:
    /// J = cosh β·I + sinh β·σ.
    AxisBoost,

    /// An ordered product of other transformations; the last member is
    /// applied to the signal first.
    Product,

    /// A piecewise-constant-in-time transformation: one independent
    /// parameter copy per time segment.
    Segmented,

    /// A wrapper that binds parameters of an inner transformation to
    /// polynomials of time.
    Bound,
}

/// A model parameter: its value, its variance (zero until a fit or an
/// estimator sets it) and whether it is free in the fit.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Parameter {
    pub value: f64,
    pub variance: f64,
    pub free: bool,
}

impl Parameter {
    fn new(value: f64) -> Parameter {
        Parameter {
            value,
            variance: 0.0,
            free: true,
        }
    }
}

/// A parameter of an inner transformation bound to a [TimePolynomial].
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Binding {
    /// The resolved (node, local parameter) the polynomial drives.
    target: (NodeId, usize),

    poly: TimePolynomial,

    /// The target parameter's free flag before it was bound, restored on
    /// unbind.
    restore_free: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum NodeSpec {
    Gain,
    DiffGainPhase,
    AxisRotation(StokesAxis),
    AxisBoost(StokesAxis),
    Product(Vec<NodeId>),
    Segmented {
        /// boundaries[i] starts segments[i + 1]; segments are half-open
        /// [start, end), and epochs outside the partition clamp to the
        /// nearest segment.
        #[serde(with = "varying::epoch_vec_serde")]
        boundaries: Vec<Epoch>,
        segments: Vec1<NodeId>,
    },
    Bound {
        inner: NodeId,
        /// Keyed by the flattened parameter index within `inner`'s subtree.
        /// The coefficients of each polynomial live in this node's parameter
        /// vector, concatenated in map order.
        bindings: IndexMap<usize, Binding>,
    },
}

impl NodeSpec {
    fn kind(&self) -> TransformKind {
        match self {
            NodeSpec::Gain => TransformKind::Gain,
            NodeSpec::DiffGainPhase => TransformKind::DiffGainPhase,
            NodeSpec::AxisRotation(_) => TransformKind::AxisRotation,
            NodeSpec::AxisBoost(_) => TransformKind::AxisBoost,
            NodeSpec::Product(_) => TransformKind::Product,
            NodeSpec::Segmented { .. } => TransformKind::Segmented,
            NodeSpec::Bound { .. } => TransformKind::Bound,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Node {
    spec: NodeSpec,
    params: Vec<Parameter>,
}

/// The result of evaluating a transformation at an epoch.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub jones: Jones<f64>,

    /// ∂J/∂p for every parameter in the arena (dense, indexed by
    /// [ModelArena::param_offset]); zero for parameters the evaluated
    /// subtree does not touch. `None` if the gradient was not requested.
    pub gradient: Option<Vec<Jones<f64>>>,
}

/// A value overriding a node parameter during evaluation, together with the
/// chain-rule redirection of its gradient onto polynomial coefficients.
struct Override {
    node: NodeId,
    iparam: usize,
    value: f64,
    /// (dense offset of coefficient, ∂value/∂coefficient).
    coeffs: Vec<(usize, f64)>,
}

/// An arena of transformation nodes. See the [module docs](self).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelArena {
    nodes: Vec<Node>,
}

impl ModelArena {
    pub fn new() -> ModelArena {
        ModelArena::default()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn push(&mut self, spec: NodeSpec, params: Vec<Parameter>) -> NodeId {
        self.nodes.push(Node { spec, params });
        NodeId(self.nodes.len() - 1)
    }

    fn check_node(&self, id: NodeId) -> Result<&Node, ModelError> {
        self.nodes.get(id.0).ok_or(ModelError::UnknownNode {
            node: id.0,
            num_nodes: self.nodes.len(),
        })
    }

    /// Add an absolute gain, initially unity.
    pub fn add_gain(&mut self) -> NodeId {
        self.push(NodeSpec::Gain, vec![Parameter::new(1.0)])
    }

    /// Add a receiver backend: unit gain, zero differential gain and phase.
    pub fn add_backend(&mut self) -> NodeId {
        self.push(
            NodeSpec::DiffGainPhase,
            vec![
                Parameter::new(1.0),
                Parameter::new(0.0),
                Parameter::new(0.0),
            ],
        )
    }

    /// Add a rotation about `axis`, initially zero.
    pub fn add_rotation(&mut self, axis: StokesAxis) -> NodeId {
        self.push(NodeSpec::AxisRotation(axis), vec![Parameter::new(0.0)])
    }

    /// Add a boost along `axis`, initially zero.
    pub fn add_boost(&mut self, axis: StokesAxis) -> NodeId {
        self.push(NodeSpec::AxisBoost(axis), vec![Parameter::new(0.0)])
    }

    /// Add an ordered product of existing nodes. The last member is applied
    /// to the signal first.
    pub fn add_product(&mut self, members: Vec<NodeId>) -> Result<NodeId, ModelError> {
        for &member in &members {
            self.check_node(member)?;
        }
        Ok(self.push(NodeSpec::Product(members), vec![]))
    }

    /// Wrap an existing node as the first segment of a piecewise-constant
    /// transformation covering all time.
    pub fn add_segmented(&mut self, first: NodeId) -> Result<NodeId, ModelError> {
        self.check_node(first)?;
        Ok(self.push(
            NodeSpec::Segmented {
                boundaries: vec![],
                segments: vec1![first],
            },
            vec![],
        ))
    }

    /// Wrap an existing node so that its parameters may be bound to
    /// polynomials of time. With no bindings the wrapper is transparent.
    pub fn add_bound(&mut self, inner: NodeId) -> Result<NodeId, ModelError> {
        self.check_node(inner)?;
        Ok(self.push(
            NodeSpec::Bound {
                inner,
                bindings: IndexMap::new(),
            },
            vec![],
        ))
    }

    pub fn kind(&self, id: NodeId) -> Result<TransformKind, ModelError> {
        Ok(self.check_node(id)?.spec.kind())
    }

    pub(crate) fn spec(&self, id: NodeId) -> Result<&NodeSpec, ModelError> {
        Ok(&self.check_node(id)?.spec)
    }

    /// The number of parameters belonging to the node itself (children are
    /// counted separately).
    pub fn nparam(&self, id: NodeId) -> Result<usize, ModelError> {
        Ok(self.check_node(id)?.params.len())
    }

    /// The total number of parameters in the arena.
    pub fn nparam_total(&self) -> usize {
        self.nodes.iter().map(|n| n.params.len()).sum()
    }

    /// The dense parameter offset of a node: the index of its first
    /// parameter in arena-wide parameter order.
    pub fn param_offset(&self, id: NodeId) -> Result<usize, ModelError> {
        self.check_node(id)?;
        Ok(self.nodes[..id.0].iter().map(|n| n.params.len()).sum())
    }

    /// The (node, local parameter) at a dense arena-wide parameter offset;
    /// the inverse of [ModelArena::param_offset].
    pub(crate) fn locate(&self, offset: usize) -> Result<(NodeId, usize), ModelError> {
        let mut acc = 0;
        for (i, node) in self.nodes.iter().enumerate() {
            if offset < acc + node.params.len() {
                return Ok((NodeId(i), offset - acc));
            }
            acc += node.params.len();
        }
        Err(ModelError::FlatIndexOutOfRange {
            node: 0,
            iparam: offset,
            nparam: acc,
        })
    }

    fn param_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.nodes.len());
        let mut acc = 0;
        for node in &self.nodes {
            offsets.push(acc);
            acc += node.params.len();
        }
        offsets
    }

    fn check_param(&self, id: NodeId, iparam: usize) -> Result<(), ModelError> {
        let node = self.check_node(id)?;
        if iparam >= node.params.len() {
            return Err(ModelError::InvalidParamIndex {
                node: id.0,
                kind: node.spec.kind(),
                iparam,
                nparam: node.params.len(),
            });
        }
        Ok(())
    }

    pub fn get_param(&self, id: NodeId, iparam: usize) -> Result<f64, ModelError> {
        self.check_param(id, iparam)?;
        Ok(self.nodes[id.0].params[iparam].value)
    }

    pub fn set_param(&mut self, id: NodeId, iparam: usize, value: f64) -> Result<(), ModelError> {
        self.check_param(id, iparam)?;
        self.nodes[id.0].params[iparam].value = value;
        Ok(())
    }

    pub fn get_variance(&self, id: NodeId, iparam: usize) -> Result<f64, ModelError> {
        self.check_param(id, iparam)?;
        Ok(self.nodes[id.0].params[iparam].variance)
    }

    pub fn set_variance(
        &mut self,
        id: NodeId,
        iparam: usize,
        variance: f64,
    ) -> Result<(), ModelError> {
        self.check_param(id, iparam)?;
        self.nodes[id.0].params[iparam].variance = variance;
        Ok(())
    }

    pub fn get_infit(&self, id: NodeId, iparam: usize) -> Result<bool, ModelError> {
        self.check_param(id, iparam)?;
        Ok(self.nodes[id.0].params[iparam].free)
    }

    pub fn set_infit(&mut self, id: NodeId, iparam: usize, free: bool) -> Result<(), ModelError> {
        self.check_param(id, iparam)?;
        self.nodes[id.0].params[iparam].free = free;
        Ok(())
    }

    pub fn param_name(&self, id: NodeId, iparam: usize) -> Result<String, ModelError> {
        self.check_param(id, iparam)?;
        let node = &self.nodes[id.0];
        let name = match &node.spec {
            NodeSpec::Gain => "gain".to_string(),
            NodeSpec::DiffGainPhase => ["gain", "diff_gain", "diff_phase"][iparam].to_string(),
            NodeSpec::AxisRotation(axis) => format!("rotation_{axis}"),
            NodeSpec::AxisBoost(axis) => format!("boost_{axis}"),
            // Products and segments carry no parameters of their own, so
            // check_param has already rejected these.
            NodeSpec::Product(_) | NodeSpec::Segmented { .. } => unreachable!(),
            NodeSpec::Bound { bindings, .. } => {
                let mut offset = 0;
                let mut name = None;
                for (flat, binding) in bindings {
                    if iparam < offset + binding.poly.ncoef {
                        name = Some(format!("p{flat}_c{}", iparam - offset));
                        break;
                    }
                    offset += binding.poly.ncoef;
                }
                name.unwrap_or_default()
            }
        };
        Ok(format!("node{}.{name}", id.0))
    }

    /// The parameters reachable from `root`, in pre-order with each node
    /// visited once: the node's own parameters, then its children's. This
    /// is the "flattened" view used to address parameters of a composite
    /// transformation.
    pub fn subtree_params(&self, root: NodeId) -> Result<Vec<(NodeId, usize)>, ModelError> {
        let mut out = vec![];
        let mut visited = HashSet::new();
        self.subtree_params_inner(root, &mut visited, &mut out)?;
        Ok(out)
    }

    fn subtree_params_inner(
        &self,
        id: NodeId,
        visited: &mut HashSet<NodeId>,
        out: &mut Vec<(NodeId, usize)>,
    ) -> Result<(), ModelError> {
        if !visited.insert(id) {
            return Ok(());
        }
        let node = self.check_node(id)?;
        for iparam in 0..node.params.len() {
            out.push((id, iparam));
        }
        match &node.spec {
            NodeSpec::Gain
            | NodeSpec::DiffGainPhase
            | NodeSpec::AxisRotation(_)
            | NodeSpec::AxisBoost(_) => (),
            NodeSpec::Product(members) => {
                for &member in members {
                    self.subtree_params_inner(member, visited, out)?;
                }
            }
            NodeSpec::Segmented { segments, .. } => {
                for &segment in segments.iter() {
                    self.subtree_params_inner(segment, visited, out)?;
                }
            }
            NodeSpec::Bound { inner, .. } => {
                self.subtree_params_inner(*inner, visited, out)?;
            }
        }
        Ok(())
    }

    /// Resolve a flattened parameter index within `root`'s subtree.
    pub fn resolve_flat(&self, root: NodeId, iparam: usize) -> Result<(NodeId, usize), ModelError> {
        let params = self.subtree_params(root)?;
        params
            .get(iparam)
            .copied()
            .ok_or(ModelError::FlatIndexOutOfRange {
                node: root.0,
                iparam,
                nparam: params.len(),
            })
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Time segmentation
    //
    // ///////////////////////////////////////////////////////////////////

    /// Insert a segment boundary at `epoch` into a [Segmented]
    /// (TransformKind::Segmented) node. The parameters of the segment active
    /// before the insertion point seed the new segment, so dependent signal
    /// paths remain numerically continuous until re-fit. Returns false (and
    /// changes nothing) if a boundary already exists at `epoch`.
    pub fn add_step(&mut self, id: NodeId, epoch: Epoch) -> Result<bool, ModelError> {
        let (pos, src) = match &self.check_node(id)?.spec {
            NodeSpec::Segmented {
                boundaries,
                segments,
            } => {
                if boundaries.contains(&epoch) {
                    return Ok(false);
                }
                let pos = boundaries.partition_point(|b| *b < epoch);
                (pos, segments[pos])
            }
            other => {
                return Err(ModelError::WrongKind {
                    node: id.0,
                    expected: TransformKind::Segmented,
                    found: other.kind(),
                })
            }
        };

        let copy = self.clone_subtree(src)?;

        match &mut self.nodes[id.0].spec {
            NodeSpec::Segmented {
                boundaries,
                segments,
            } => {
                boundaries.insert(pos, epoch);
                segments.insert(pos + 1, copy);
            }
            _ => unreachable!(),
        }
        Ok(true)
    }

    /// The segment of a [Segmented](TransformKind::Segmented) node covering
    /// `epoch`: segments are half-open `[start, end)`, and epochs before the
    /// first boundary or at/after the last clamp to the nearest segment.
    /// Returns the segment index and its node.
    pub fn segment_at(&self, id: NodeId, epoch: Epoch) -> Result<(usize, NodeId), ModelError> {
        match &self.check_node(id)?.spec {
            NodeSpec::Segmented {
                boundaries,
                segments,
            } => {
                let i = boundaries.partition_point(|b| *b <= epoch);
                Ok((i, segments[i]))
            }
            other => Err(ModelError::WrongKind {
                node: id.0,
                expected: TransformKind::Segmented,
                found: other.kind(),
            }),
        }
    }

    pub fn num_segments(&self, id: NodeId) -> Result<usize, ModelError> {
        match &self.check_node(id)?.spec {
            NodeSpec::Segmented { segments, .. } => Ok(segments.len()),
            other => Err(ModelError::WrongKind {
                node: id.0,
                expected: TransformKind::Segmented,
                found: other.kind(),
            }),
        }
    }

    /// The node holding segment `i`'s parameters.
    pub fn segment_node(&self, id: NodeId, i: usize) -> Result<NodeId, ModelError> {
        match &self.check_node(id)?.spec {
            NodeSpec::Segmented { segments, .. } => {
                segments
                    .get(i)
                    .copied()
                    .ok_or(ModelError::FlatIndexOutOfRange {
                        node: id.0,
                        iparam: i,
                        nparam: segments.len(),
                    })
            }
            other => Err(ModelError::WrongKind {
                node: id.0,
                expected: TransformKind::Segmented,
                found: other.kind(),
            }),
        }
    }

    /// The time span of segment `i`: `None` bounds are open.
    pub fn segment_span(
        &self,
        id: NodeId,
        i: usize,
    ) -> Result<(Option<Epoch>, Option<Epoch>), ModelError> {
        match &self.check_node(id)?.spec {
            NodeSpec::Segmented {
                boundaries,
                segments,
            } => {
                if i >= segments.len() {
                    return Err(ModelError::UnknownNode {
                        node: i,
                        num_nodes: segments.len(),
                    });
                }
                let start = i.checked_sub(1).map(|j| boundaries[j]);
                let end = boundaries.get(i).copied();
                Ok((start, end))
            }
            other => Err(ModelError::WrongKind {
                node: id.0,
                expected: TransformKind::Segmented,
                found: other.kind(),
            }),
        }
    }

    /// Deep-copy a subtree, preserving sharing within it. Used to seed new
    /// time segments.
    fn clone_subtree(&mut self, root: NodeId) -> Result<NodeId, ModelError> {
        let mut memo = HashMap::new();
        self.clone_subtree_inner(root, &mut memo)
    }

    fn clone_subtree_inner(
        &mut self,
        id: NodeId,
        memo: &mut HashMap<NodeId, NodeId>,
    ) -> Result<NodeId, ModelError> {
        if let Some(&copy) = memo.get(&id) {
            return Ok(copy);
        }
        let Node { spec, params } = self.check_node(id)?.clone();
        let new_spec = match spec {
            NodeSpec::Gain
            | NodeSpec::DiffGainPhase
            | NodeSpec::AxisRotation(_)
            | NodeSpec::AxisBoost(_) => spec,
            NodeSpec::Product(members) => {
                let mut new_members = Vec::with_capacity(members.len());
                for member in members {
                    new_members.push(self.clone_subtree_inner(member, memo)?);
                }
                NodeSpec::Product(new_members)
            }
            NodeSpec::Segmented {
                boundaries,
                segments,
            } => {
                let mut new_segments = Vec::with_capacity(segments.len());
                for &segment in segments.iter() {
                    new_segments.push(self.clone_subtree_inner(segment, memo)?);
                }
                NodeSpec::Segmented {
                    boundaries,
                    segments: Vec1::try_from_vec(new_segments).unwrap(),
                }
            }
            NodeSpec::Bound { inner, bindings } => {
                let new_inner = self.clone_subtree_inner(inner, memo)?;
                let mut new_bindings = IndexMap::with_capacity(bindings.len());
                for (flat, mut binding) in bindings {
                    binding.target = (memo[&binding.target.0], binding.target.1);
                    new_bindings.insert(flat, binding);
                }
                NodeSpec::Bound {
                    inner: new_inner,
                    bindings: new_bindings,
                }
            }
        };
        let copy = self.push(new_spec, params);
        memo.insert(id, copy);
        Ok(copy)
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Bound parameters
    //
    // ///////////////////////////////////////////////////////////////////

    /// Bind a parameter of a [Bound](TransformKind::Bound) node's inner
    /// subtree (addressed by its flattened index) to a polynomial of time.
    ///
    /// The target parameter leaves the fit; the polynomial's coefficients
    /// join it as parameters of the Bound node, with the constant term
    /// seeded from the target's current value. The free-parameter count
    /// therefore never double-counts a bound parameter.
    pub fn bind(
        &mut self,
        id: NodeId,
        flat_iparam: usize,
        poly: TimePolynomial,
    ) -> Result<(), ModelError> {
        if poly.ncoef == 0 {
            return Err(ModelError::EmptyPolynomial);
        }
        let inner = match &self.check_node(id)?.spec {
            NodeSpec::Bound { inner, bindings } => {
                if bindings.contains_key(&flat_iparam) {
                    return Err(ModelError::AlreadyBound {
                        node: id.0,
                        iparam: flat_iparam,
                    });
                }
                *inner
            }
            other => {
                return Err(ModelError::WrongKind {
                    node: id.0,
                    expected: TransformKind::Bound,
                    found: other.kind(),
                })
            }
        };

        let target = self.resolve_flat(inner, flat_iparam)?;
        let restore_free = self.get_infit(target.0, target.1)?;
        let seed = self.get_param(target.0, target.1)?;
        self.set_infit(target.0, target.1, false)?;

        let ncoef = poly.ncoef;
        match &mut self.nodes[id.0].spec {
            NodeSpec::Bound { bindings, .. } => {
                bindings.insert(
                    flat_iparam,
                    Binding {
                        target,
                        poly,
                        restore_free,
                    },
                );
            }
            _ => unreachable!(),
        }
        let node = &mut self.nodes[id.0];
        node.params.push(Parameter::new(seed));
        for _ in 1..ncoef {
            node.params.push(Parameter::new(0.0));
        }
        Ok(())
    }

    /// Remove a binding, restoring the target parameter's free flag and
    /// setting its value to the polynomial's constant term.
    pub fn unbind(&mut self, id: NodeId, flat_iparam: usize) -> Result<(), ModelError> {
        let (offset, binding) = match &self.check_node(id)?.spec {
            NodeSpec::Bound { bindings, .. } => {
                let mut offset = 0;
                let mut found = None;
                for (flat, binding) in bindings {
                    if *flat == flat_iparam {
                        found = Some(binding.clone());
                        break;
                    }
                    offset += binding.poly.ncoef;
                }
                match found {
                    Some(binding) => (offset, binding),
                    None => {
                        return Err(ModelError::NotBound {
                            node: id.0,
                            iparam: flat_iparam,
                        })
                    }
                }
            }
            other => {
                return Err(ModelError::WrongKind {
                    node: id.0,
                    expected: TransformKind::Bound,
                    found: other.kind(),
                })
            }
        };

        let constant = self.nodes[id.0].params[offset].value;
        self.nodes[id.0]
            .params
            .drain(offset..offset + binding.poly.ncoef);
        match &mut self.nodes[id.0].spec {
            NodeSpec::Bound { bindings, .. } => {
                bindings.shift_remove(&flat_iparam);
            }
            _ => unreachable!(),
        }
        self.set_param(binding.target.0, binding.target.1, constant)?;
        self.set_infit(binding.target.0, binding.target.1, binding.restore_free)?;
        Ok(())
    }

    // ///////////////////////////////////////////////////////////////////
    //
    // Evaluation
    //
    // ///////////////////////////////////////////////////////////////////

    /// Evaluate the transformation rooted at `root` at `epoch`, optionally
    /// with the gradient with respect to every parameter in the arena.
    pub fn evaluate(
        &self,
        root: NodeId,
        epoch: Epoch,
        want_gradient: bool,
    ) -> Result<Evaluation, ModelError> {
        let offsets = self.param_offsets();
        let mut gradient = want_gradient.then(|| vec![Jones::default(); self.nparam_total()]);
        let mut overrides = vec![];
        let jones = self.eval_rec(
            root,
            epoch,
            Jones::identity(),
            Jones::identity(),
            &offsets,
            &mut overrides,
            &mut gradient,
        )?;
        Ok(Evaluation { jones, gradient })
    }

    /// Recursive evaluation. `left` and `right` are the products of the
    /// enclosing transformations on either side; they scale gradient
    /// contributions but not the returned Jones matrix.
    #[allow(clippy::too_many_arguments)]
    fn eval_rec(
        &self,
        id: NodeId,
        epoch: Epoch,
        left: Jones<f64>,
        right: Jones<f64>,
        offsets: &[usize],
        overrides: &mut Vec<Override>,
        gradient: &mut Option<Vec<Jones<f64>>>,
    ) -> Result<Jones<f64>, ModelError> {
        let node = self.check_node(id)?;
        match &node.spec {
            NodeSpec::Gain
            | NodeSpec::DiffGainPhase
            | NodeSpec::AxisRotation(_)
            | NodeSpec::AxisBoost(_) => {
                let mut values: Vec<f64> = node.params.iter().map(|p| p.value).collect();
                for o in overrides.iter() {
                    if o.node == id {
                        values[o.iparam] = o.value;
                    }
                }
                let (jones, partials) = leaf_jones(&node.spec, &values);
                if let Some(gradient) = gradient {
                    for (iparam, partial) in partials.into_iter().enumerate() {
                        let scaled = left * partial * right;
                        // A bound parameter's gradient belongs to the
                        // polynomial coefficients that drive it.
                        let redirected = overrides
                            .iter()
                            .rev()
                            .find(|o| o.node == id && o.iparam == iparam);
                        match redirected {
                            Some(o) => {
                                for &(offset, factor) in &o.coeffs {
                                    gradient[offset] += scaled * factor;
                                }
                            }
                            None => gradient[offsets[id.0] + iparam] += scaled,
                        }
                    }
                }
                Ok(jones)
            }

            NodeSpec::Product(members) => {
                if members.is_empty() {
                    return Ok(Jones::identity());
                }
                // First pass: member matrices without gradients, to build
                // the prefix and suffix products.
                let mut matrices = Vec::with_capacity(members.len());
                for &member in members {
                    let jones = self.eval_rec(
                        member,
                        epoch,
                        Jones::identity(),
                        Jones::identity(),
                        offsets,
                        overrides,
                        &mut None,
                    )?;
                    matrices.push(jones);
                }
                let mut total = Jones::identity();
                for m in &matrices {
                    total = total * *m;
                }
                if gradient.is_some() {
                    let n = members.len();
                    let mut suffixes = vec![Jones::identity(); n];
                    for i in (0..n - 1).rev() {
                        suffixes[i] = matrices[i + 1] * suffixes[i + 1];
                    }
                    let mut prefix = Jones::identity();
                    for (i, &member) in members.iter().enumerate() {
                        self.eval_rec(
                            member,
                            epoch,
                            left * prefix,
                            suffixes[i] * right,
                            offsets,
                            overrides,
                            gradient,
                        )?;
                        prefix = prefix * matrices[i];
                    }
                }
                Ok(total)
            }

            NodeSpec::Segmented { .. } => {
                let (_, active) = self.segment_at(id, epoch)?;
                self.eval_rec(active, epoch, left, right, offsets, overrides, gradient)
            }

            NodeSpec::Bound { inner, bindings } => {
                let inner = *inner;
                let pushed = bindings.len();
                let mut offset = offsets[id.0];
                for binding in bindings.values() {
                    let factors = binding.poly.factors(epoch);
                    let value: f64 = factors
                        .iter()
                        .enumerate()
                        .map(|(j, factor)| node.params[offset - offsets[id.0] + j].value * factor)
                        .sum();
                    overrides.push(Override {
                        node: binding.target.0,
                        iparam: binding.target.1,
                        value,
                        coeffs: factors
                            .iter()
                            .enumerate()
                            .map(|(j, &factor)| (offset + j, factor))
                            .collect(),
                    });
                    offset += binding.poly.ncoef;
                }
                let jones =
                    self.eval_rec(inner, epoch, left, right, offsets, overrides, gradient)?;
                overrides.truncate(overrides.len() - pushed);
                Ok(jones)
            }
        }
    }

    /// Copy every parameter value from a structurally identical arena. Used
    /// to seed a channel's model from a well-converged neighbor.
    pub fn copy_params_from(&mut self, other: &ModelArena) -> Result<(), ModelError> {
        if self.nparam_total() != other.nparam_total() || self.nodes.len() != other.nodes.len() {
            return Err(ModelError::StructureMismatch {
                dest: self.nparam_total(),
                src: other.nparam_total(),
            });
        }
        for (node, src) in self.nodes.iter_mut().zip(&other.nodes) {
            if node.params.len() != src.params.len() {
                return Err(ModelError::StructureMismatch {
                    dest: node.params.len(),
                    src: src.params.len(),
                });
            }
            for (param, src) in node.params.iter_mut().zip(&src.params) {
                param.value = src.value;
            }
        }
        Ok(())
    }
}

/// The Jones matrix of a leaf transformation and its partial derivative
/// with respect to each parameter.
fn leaf_jones(spec: &NodeSpec, values: &[f64]) -> (Jones<f64>, Vec<Jones<f64>>) {
    let zero = c64::new(0.0, 0.0);
    let diag = |a: c64, d: c64| Jones::from([a, zero, zero, d]);

    match spec {
        NodeSpec::Gain => {
            let g = values[0];
            (Jones::identity() * g, vec![Jones::identity()])
        }

        NodeSpec::DiffGainPhase => {
            let (g, gamma, phi) = (values[0], values[1], values[2]);
            // J = G diag(a, 1/a), a = exp((γ + iφ)/2).
            let a = Complex::from_polar((0.5 * gamma).exp(), 0.5 * phi);
            let b = Complex::from_polar((-0.5 * gamma).exp(), -0.5 * phi);
            let i = c64::new(0.0, 1.0);
            let jones = diag(a, b) * g;
            let d_gain = diag(a, b);
            let d_gamma = diag(a, -b) * (0.5 * g);
            let d_phi = diag(i * a, -i * b) * (0.5 * g);
            (jones, vec![d_gain, d_gamma, d_phi])
        }

        NodeSpec::AxisRotation(axis) => {
            let theta = values[0];
            let sigma = axis.sigma();
            let jones = lincomb(
                c64::new(theta.cos(), 0.0),
                Jones::identity(),
                c64::new(0.0, theta.sin()),
                sigma,
            );
            let d_theta = lincomb(
                c64::new(-theta.sin(), 0.0),
                Jones::identity(),
                c64::new(0.0, theta.cos()),
                sigma,
            );
            (jones, vec![d_theta])
        }

        NodeSpec::AxisBoost(axis) => {
            let beta = values[0];
            let sigma = axis.sigma();
            let jones = lincomb(
                c64::new(beta.cosh(), 0.0),
                Jones::identity(),
                c64::new(beta.sinh(), 0.0),
                sigma,
            );
            let d_beta = lincomb(
                c64::new(beta.sinh(), 0.0),
                Jones::identity(),
                c64::new(beta.cosh(), 0.0),
                sigma,
            );
            (jones, vec![d_beta])
        }

        NodeSpec::Product(_) | NodeSpec::Segmented { .. } | NodeSpec::Bound { .. } => {
            unreachable!("leaf_jones called on a composite node")
        }
    }
}

/// a·X + b·Y over Jones matrices with complex scalars.
fn lincomb(a: c64, x: Jones<f64>, b: c64, y: Jones<f64>) -> Jones<f64> {
    Jones::from([
        a * x[0] + b * y[0],
        a * x[1] + b * y[1],
        a * x[2] + b * y[2],
        a * x[3] + b * y[3],
    ])
}
