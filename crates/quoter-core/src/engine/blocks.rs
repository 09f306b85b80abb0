//! Block formation, categorization, and prioritization.
//!
//! A block is a contiguous run of price-sorted candidates whose max/min
//! ratio stays within the variation tolerance. Blocks hold candidate
//! positions, never candidates themselves; the canonical list is owned by
//! the request. Everything in this module is a pure function of the
//! candidate list, the failure set, and the validated set, which is what
//! makes block selection replayable on resume.

use quoter_types::Candidate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};

/// A contiguous subsequence of the price-sorted candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceBlock {
	/// Candidate positions, in ascending listing-price order.
	pub positions: Vec<usize>,
}

impl PriceBlock {
	/// Number of members.
	pub fn len(&self) -> usize {
		self.positions.len()
	}

	/// Whether the block has no members.
	pub fn is_empty(&self) -> bool {
		self.positions.is_empty()
	}

	/// Members not yet validated.
	pub fn untried_count<V>(&self, validated: &BTreeMap<usize, V>) -> usize {
		self.positions
			.iter()
			.filter(|p| !validated.contains_key(p))
			.count()
	}

	/// Whether every validated member is inside this block.
	pub fn contains_all<V>(&self, validated: &BTreeMap<usize, V>) -> bool {
		validated.keys().all(|p| self.positions.contains(p))
	}
}

/// Priority class of a block relative to the accumulated successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCategory {
	/// Contains every validated member and enough untried ones to reach
	/// the target.
	C1,
	/// Contains every validated member but cannot reach the target alone.
	C2,
	/// An alternative neighborhood: misses validated members but is big
	/// enough to reach the target by itself.
	C3,
}

/// Forms every maximal price-consistent window over the non-failed
/// candidates.
///
/// For each start index the window extends while the price stays within
/// `start_price * (1 + variation_max_pct/100)`. The candidate list must
/// already be sorted ascending by listing price with `position` equal to
/// its index.
pub fn form_blocks(
	candidates: &[Candidate],
	failed: &HashSet<usize>,
	variation_max_pct: Decimal,
) -> Vec<PriceBlock> {
	let active: Vec<&Candidate> = candidates
		.iter()
		.filter(|c| !failed.contains(&c.position))
		.collect();

	let factor = (Decimal::from(100) + variation_max_pct) / Decimal::from(100);

	let mut blocks = Vec::new();
	for i in 0..active.len() {
		let limit = active[i].listing_price * factor;
		let mut positions = Vec::new();
		for candidate in &active[i..] {
			if candidate.listing_price > limit {
				break;
			}
			positions.push(candidate.position);
		}
		blocks.push(PriceBlock { positions });
	}
	blocks
}

/// Categorizes a block against the validated set.
///
/// Returns `None` for blocks that are neither anchored to the validated
/// set nor large enough to reach the target on their own.
pub fn categorize<V>(
	block: &PriceBlock,
	validated: &BTreeMap<usize, V>,
	target: usize,
) -> Option<BlockCategory> {
	if block.contains_all(validated) {
		let needed = target.saturating_sub(validated.len());
		if block.untried_count(validated) >= needed {
			Some(BlockCategory::C1)
		} else {
			Some(BlockCategory::C2)
		}
	} else if block.len() >= target {
		Some(BlockCategory::C3)
	} else {
		None
	}
}

/// Sorts blocks by `(-len, first price, first position)`: largest first
/// (most tries available), ties broken by the lowest starting price. The
/// position tie-break keeps the ordering a pure function of the inputs.
pub fn prioritize(blocks: &mut [PriceBlock], candidates: &[Candidate]) {
	blocks.sort_by(|a, b| {
		b.len()
			.cmp(&a.len())
			.then_with(|| {
				let pa = first_price(a, candidates);
				let pb = first_price(b, candidates);
				pa.cmp(&pb)
			})
			.then_with(|| a.positions.first().cmp(&b.positions.first()))
	});
}

fn first_price(block: &PriceBlock, candidates: &[Candidate]) -> Decimal {
	block
		.positions
		.first()
		.map(|p| candidates[*p].listing_price)
		.unwrap_or(Decimal::MAX)
}

/// Spread of a price set, `(max/min - 1) * 100`.
pub fn spread_pct(prices: &[Decimal]) -> Option<Decimal> {
	let min = prices.iter().min()?;
	let max = prices.iter().max()?;
	if *min <= Decimal::ZERO {
		return None;
	}
	Some((max / min - Decimal::ONE) * Decimal::from(100))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn candidates(prices: &[i64]) -> Vec<Candidate> {
		prices
			.iter()
			.enumerate()
			.map(|(position, price)| Candidate {
				position,
				title: format!("item {}", position),
				listing_price: Decimal::from(*price),
				source_name: format!("loja {}", position),
				deep_lookup_url: None,
				product_link: Some(format!("https://loja{}.com.br/p/1", position)),
			})
			.collect()
	}

	#[test]
	fn scenario_a_first_block() {
		let list = candidates(&[100, 102, 104, 110, 125, 130, 140]);
		let blocks = form_blocks(&list, &HashSet::new(), Decimal::from(25));
		// Window from 100 extends through 125 (limit 125), not 130
		assert_eq!(blocks[0].positions, vec![0, 1, 2, 3, 4]);
	}

	#[test]
	fn window_invariant_holds_for_every_block() {
		let list = candidates(&[100, 102, 104, 110, 125, 130, 140, 300]);
		let blocks = form_blocks(&list, &HashSet::new(), Decimal::from(25));
		for block in &blocks {
			let prices: Vec<Decimal> = block
				.positions
				.iter()
				.map(|p| list[*p].listing_price)
				.collect();
			let spread = spread_pct(&prices).unwrap();
			assert!(spread <= Decimal::from(25), "block {:?} spread {}", block, spread);
		}
	}

	#[test]
	fn failed_candidates_never_reappear() {
		let list = candidates(&[100, 102, 104, 110]);
		let failed: HashSet<usize> = [1].into_iter().collect();
		let blocks = form_blocks(&list, &failed, Decimal::from(25));
		for block in &blocks {
			assert!(!block.positions.contains(&1));
		}
		// The window from 100 now skips straight to 104
		assert_eq!(blocks[0].positions, vec![0, 2, 3]);
	}

	#[test]
	fn prioritize_largest_then_cheapest() {
		let list = candidates(&[100, 105, 108, 200, 210, 220, 400, 410]);
		let mut blocks = form_blocks(&list, &HashSet::new(), Decimal::from(25));
		prioritize(&mut blocks, &list);
		// Two length-3 windows ([100..108], [200..220]); cheaper first
		assert_eq!(blocks[0].positions, vec![0, 1, 2]);
		assert_eq!(blocks[1].positions, vec![3, 4, 5]);
	}

	#[test]
	fn prioritization_is_deterministic() {
		let list = candidates(&[100, 105, 108, 200, 210, 220]);
		let failed: HashSet<usize> = [2].into_iter().collect();
		let run = || {
			let mut blocks = form_blocks(&list, &failed, Decimal::from(25));
			prioritize(&mut blocks, &list);
			blocks
		};
		assert_eq!(run(), run());
	}

	#[test]
	fn categorization_tracks_validated() {
		let list = candidates(&[100, 105, 108, 200, 210, 220]);
		let blocks = form_blocks(&list, &HashSet::new(), Decimal::from(25));
		let empty: BTreeMap<usize, ()> = BTreeMap::new();
		assert_eq!(categorize(&blocks[0], &empty, 3), Some(BlockCategory::C1));

		let mut validated = BTreeMap::new();
		validated.insert(0usize, ());
		validated.insert(1usize, ());
		// [100, 105, 108] holds both plus one untried: still C1 for N=3
		assert_eq!(
			categorize(&blocks[0], &validated, 3),
			Some(BlockCategory::C1)
		);
		// [200, 210, 220] misses the validated members: alternative
		assert_eq!(
			categorize(&blocks[3], &validated, 3),
			Some(BlockCategory::C3)
		);

		// After 108 fails, [100, 105] lacks untried members: C2
		let failed: HashSet<usize> = [2].into_iter().collect();
		let reblocks = form_blocks(&list, &failed, Decimal::from(25));
		assert_eq!(reblocks[0].positions, vec![0, 1]);
		assert_eq!(
			categorize(&reblocks[0], &validated, 3),
			Some(BlockCategory::C2)
		);
	}

	#[test]
	fn spread_of_scenario_a_result() {
		let prices = vec![
			Decimal::from(100),
			Decimal::from(102),
			Decimal::from(104),
		];
		assert_eq!(spread_pct(&prices), Some(Decimal::from(4)));
	}
}
