// Copyright 2024 Ulvetanna Inc.

//! Deterministic plan for deriving all required ciphertext powers from the
//! subset the receiver actually sends.
//!
//! The receiver encrypts `x^s` only for the configured source powers `s`;
//! every other power up to the bin capacity is obtained homomorphically as
//! the product of two lower powers. Both parties derive the same plan from
//! the parameters alone, so the plan itself never goes over the wire.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerNode {
	pub power: u32,
	pub depth: u32,
	/// `None` for source powers; otherwise two powers summing to this one.
	pub parents: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
pub struct PowersDag {
	nodes: BTreeMap<u32, PowerNode>,
	bound: u32,
}

impl PowersDag {
	/// Builds the power-derivation DAG over `[1, bound]`.
	///
	/// Construction walks targets in increasing order and picks, for every
	/// non-source power `v`, the parent pair `(a, v - a)` minimizing the
	/// resulting depth, breaking ties towards the smallest `a`. This makes
	/// the DAG a pure function of `(sources, bound)`.
	pub fn new(sources: &BTreeSet<u32>, bound: u32) -> Result<Self, Error> {
		if bound == 0 {
			return Err(Error::Config("powers bound must be positive".to_string()));
		}
		if !sources.contains(&1) {
			return Err(Error::Config("query powers must contain 1".to_string()));
		}
		if let Some(&out) = sources.iter().find(|&&s| s == 0 || s > bound) {
			return Err(Error::Config(format!(
				"query power {out} is outside [1, {bound}]"
			)));
		}

		let mut nodes = BTreeMap::new();
		for target in 1..=bound {
			if sources.contains(&target) {
				nodes.insert(
					target,
					PowerNode {
						power: target,
						depth: 0,
						parents: None,
					},
				);
				continue;
			}

			let mut best: Option<(u32, u32, u32)> = None;
			for a in 1..=target / 2 {
				let b = target - a;
				let depth_a = nodes[&a].depth;
				let depth_b = nodes[&b].depth;
				let depth = depth_a.max(depth_b) + 1;
				if best.map_or(true, |(d, _, _)| depth < d) {
					best = Some((depth, a, b));
				}
			}
			let (depth, a, b) = best.ok_or_else(|| {
				Error::Config(format!("query powers cannot derive power {target}"))
			})?;
			nodes.insert(
				target,
				PowerNode {
					power: target,
					depth,
					parents: Some((a, b)),
				},
			);
		}

		Ok(Self { nodes, bound })
	}

	pub fn bound(&self) -> u32 {
		self.bound
	}

	pub fn depth(&self) -> u32 {
		self.nodes.values().map(|n| n.depth).max().unwrap_or(0)
	}

	pub fn node(&self, power: u32) -> Option<&PowerNode> {
		self.nodes.get(&power)
	}

	pub fn is_source(&self, power: u32) -> bool {
		matches!(self.nodes.get(&power), Some(node) if node.parents.is_none())
	}

	pub fn source_powers(&self) -> BTreeSet<u32> {
		self.nodes
			.values()
			.filter(|n| n.parents.is_none())
			.map(|n| n.power)
			.collect()
	}

	/// Non-source nodes needed to realize `targets`, including transitive
	/// parents, grouped by depth in ascending order. Nodes within one group
	/// have no dependencies on each other, so a group can be computed in
	/// parallel.
	pub fn closure_levels(&self, targets: &BTreeSet<u32>) -> Vec<Vec<PowerNode>> {
		let mut needed = BTreeSet::new();
		let mut stack: Vec<u32> = targets.iter().copied().collect();
		while let Some(power) = stack.pop() {
			let node = &self.nodes[&power];
			if let Some((a, b)) = node.parents {
				if needed.insert(power) {
					stack.push(a);
					stack.push(b);
				}
			}
		}

		let mut levels: Vec<Vec<PowerNode>> = Vec::new();
		for power in needed {
			let node = self.nodes[&power];
			let depth = node.depth as usize;
			if levels.len() < depth {
				levels.resize(depth, Vec::new());
			}
			levels[depth - 1].push(node);
		}
		levels
	}
}
