//! The variation-block engine.
//!
//! Given the price-sorted candidate list, the engine spends acquisition
//! budget block by block until it accumulates the target number of
//! accepted observations or declares exhaustion. Budget goes first to
//! blocks that contain every success so far (monotone progress), then to
//! the largest alternatives, and finally to an entirely different price
//! neighborhood when the current one dead-ends.

pub mod acquisition;
pub mod blocks;

use acquisition::{Acquirer, CandidateFailure};
use async_trait::async_trait;
use blocks::{categorize, form_blocks, prioritize, BlockCategory, PriceBlock};
use quoter_types::{Candidate, QuoteSource};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};

/// Engine knobs, frozen per request.
#[derive(Debug, Clone)]
pub struct EngineParams {
	/// Target number of accepted observations.
	pub target: usize,
	/// Maximum accepted spread in percent.
	pub variation_max_pct: Decimal,
	/// Iteration ceiling before a best-effort exit.
	pub max_iterations: u32,
}

/// Pre-seeded engine state, used when resuming mid-extraction.
///
/// A resumed run replays the persisted successes and failures instead of
/// re-dispatching them, so the continuation matches what the original run
/// would have done.
#[derive(Debug, Default)]
pub struct EngineSeed {
	/// Previously accepted observations, by candidate position.
	pub validated: BTreeMap<usize, QuoteSource>,
	/// Previously failed candidate positions.
	pub failed: HashSet<usize>,
}

/// How the engine run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
	/// Reached the target within tolerance.
	Success,
	/// At least one observation at exhaustion or the iteration cap.
	BestEffort,
	/// Zero observations.
	Empty,
	/// Cancellation observed mid-run.
	Cancelled,
}

/// Result of an engine run.
#[derive(Debug)]
pub struct EngineOutcome {
	/// Accepted observations, ascending candidate position.
	pub validated: Vec<QuoteSource>,
	/// Observations acquired in an alternative neighborhood and dropped
	/// when the reserve was restored; retained for diagnostics.
	pub abandoned: Vec<QuoteSource>,
	/// Every rejected attempt.
	pub failures: Vec<CandidateFailure>,
	/// Iterations consumed.
	pub iterations: u32,
	/// Exit condition.
	pub exit: EngineExit,
}

/// One dispatch outcome, handed to the observer before the engine moves
/// on.
#[derive(Debug)]
pub enum DispatchEvent<'a> {
	/// A candidate produced an accepted observation.
	Accepted {
		position: usize,
		source: &'a QuoteSource,
		validated_count: usize,
	},
	/// A candidate was rejected.
	Rejected {
		position: usize,
		failure: &'a CandidateFailure,
		validated_count: usize,
	},
}

/// Observer called after every dispatch.
///
/// The orchestrator uses this to persist incremental state, heartbeat,
/// update progress, and check for cancellation; returning `false` stops
/// the run.
#[async_trait]
pub trait EngineObserver: Send + Sync {
	async fn after_dispatch(&self, event: DispatchEvent<'_>) -> bool;
}

/// Observer that never interferes; used by tests and the FIPE path.
pub struct NoopObserver;

#[async_trait]
impl EngineObserver for NoopObserver {
	async fn after_dispatch(&self, _event: DispatchEvent<'_>) -> bool {
		true
	}
}

/// Runs the block iteration loop over a candidate list.
///
/// `candidates` must be sorted ascending by listing price with positions
/// equal to indices, exactly as the search layer produces them.
pub async fn run_block_engine(
	candidates: &[Candidate],
	params: &EngineParams,
	seed: EngineSeed,
	acquirer: &dyn Acquirer,
	observer: &dyn EngineObserver,
) -> EngineOutcome {
	let mut validated = seed.validated;
	let mut failed = seed.failed;
	let mut failures: Vec<CandidateFailure> = Vec::new();
	let mut reserve: Option<BTreeMap<usize, QuoteSource>> = None;
	let mut abandoned: Vec<QuoteSource> = Vec::new();
	let mut iterations = 0u32;
	let mut exit = if validated.len() >= params.target {
		EngineExit::Success
	} else {
		EngineExit::BestEffort
	};

	'iteration: while exit != EngineExit::Success && iterations < params.max_iterations {
		// Failed candidates change block membership, so blocks are
		// recomputed from scratch every iteration
		let mut all_blocks = form_blocks(candidates, &failed, params.variation_max_pct);
		prioritize(&mut all_blocks, candidates);

		let mut c1: Vec<PriceBlock> = Vec::new();
		let mut c2: Vec<PriceBlock> = Vec::new();
		let mut c3: Vec<PriceBlock> = Vec::new();
		for block in all_blocks {
			match categorize(&block, &validated, params.target) {
				Some(BlockCategory::C1) => c1.push(block),
				Some(BlockCategory::C2) => c2.push(block),
				Some(BlockCategory::C3) => c3.push(block),
				None => {},
			}
		}

		let chosen = if let Some(block) = c1.into_iter().next() {
			block
		} else if let Some(block) = c2.into_iter().next() {
			if block.untried_count(&validated) == 0 {
				// Dead end in this neighborhood. Try one entirely
				// different neighborhood before settling, keeping the
				// current successes in reserve.
				if reserve.is_none() && !c3.is_empty() {
					tracing::debug!(
						kept = validated.len(),
						"Neighborhood exhausted, trying alternative block"
					);
					reserve = Some(std::mem::take(&mut validated));
					c3.remove(0)
				} else {
					break 'iteration;
				}
			} else {
				block
			}
		} else if let Some(block) = c3.into_iter().next() {
			block
		} else {
			break 'iteration;
		};

		// Walk the chosen block in ascending price
		for position in &chosen.positions {
			if validated.contains_key(position) || failed.contains(position) {
				continue;
			}
			let candidate = &candidates[*position];
			let accepted_domains: HashSet<String> =
				validated.values().map(|s| s.domain.clone()).collect();

			match acquirer.acquire(candidate, &accepted_domains).await {
				Ok(source) => {
					let keep_going = observer
						.after_dispatch(DispatchEvent::Accepted {
							position: *position,
							source: &source,
							validated_count: validated.len() + 1,
						})
						.await;
					validated.insert(*position, source);
					if !keep_going {
						exit = EngineExit::Cancelled;
						break 'iteration;
					}
					if validated.len() >= params.target {
						exit = EngineExit::Success;
						break 'iteration;
					}
				},
				Err(failure) => {
					tracing::debug!(
						position = *position,
						reason = %failure.reason,
						"Candidate rejected"
					);
					let keep_going = observer
						.after_dispatch(DispatchEvent::Rejected {
							position: *position,
							failure: &failure,
							validated_count: validated.len(),
						})
						.await;
					failed.insert(*position);
					failures.push(failure);
					if !keep_going {
						exit = EngineExit::Cancelled;
						break 'iteration;
					}
					// Block membership just changed: recompute before
					// spending more budget here
					break;
				},
			}
		}

		iterations += 1;
	}

	// An alternative neighborhood that did not reach the target yields
	// back to the reserved successes
	if exit != EngineExit::Success && exit != EngineExit::Cancelled {
		if let Some(kept) = reserve.take() {
			if validated.len() < params.target {
				abandoned.extend(validated.into_values());
				validated = kept;
			}
		}
		exit = if validated.is_empty() {
			EngineExit::Empty
		} else {
			EngineExit::BestEffort
		};
	}

	EngineOutcome {
		validated: validated.into_values().collect(),
		abandoned,
		failures,
		iterations,
		exit,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use quoter_types::{ExtractionMethod, FailureReason};
	use std::sync::Mutex;

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

	fn params(target: usize) -> EngineParams {
		EngineParams {
			target,
			variation_max_pct: Decimal::from(25),
			max_iterations: 15,
		}
	}

	fn source_for(candidate: &Candidate) -> QuoteSource {
		QuoteSource {
			request_id: "req".into(),
			url: candidate.product_link.clone().unwrap_or_default(),
			domain: format!("loja{}.com.br", candidate.position),
			page_title: Some(candidate.title.clone()),
			price_value: candidate.listing_price,
			currency: "BRL".into(),
			extraction_method: ExtractionMethod::Jsonld,
			screenshot_file: Some(format!("/tmp/{}.png", candidate.position)),
			captured_at: chrono::Utc::now(),
			is_accepted: true,
			failure_reason: None,
		}
	}

	/// Scripted acquirer: positions listed in `failures` fail with the
	/// given reason (optionally with a diverging extracted price); all
	/// others succeed at their listing price.
	struct ScriptedAcquirer {
		failures: Vec<(usize, FailureReason, Option<Decimal>)>,
		dispatched: Mutex<Vec<usize>>,
	}

	impl ScriptedAcquirer {
		fn new(failures: Vec<(usize, FailureReason, Option<Decimal>)>) -> Self {
			Self {
				failures,
				dispatched: Mutex::new(Vec::new()),
			}
		}

		fn dispatched(&self) -> Vec<usize> {
			self.dispatched.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl Acquirer for ScriptedAcquirer {
		async fn acquire(
			&self,
			candidate: &Candidate,
			_accepted_domains: &HashSet<String>,
		) -> Result<QuoteSource, CandidateFailure> {
			self.dispatched.lock().unwrap().push(candidate.position);
			if let Some((_, reason, extracted)) = self
				.failures
				.iter()
				.find(|(p, _, _)| *p == candidate.position)
			{
				return Err(CandidateFailure {
					url: candidate.product_link.clone().unwrap_or_default(),
					domain: format!("loja{}.com.br", candidate.position),
					reason: *reason,
					google_price: Some(candidate.listing_price),
					extracted_price: *extracted,
					error_message: None,
				});
			}
			Ok(source_for(candidate))
		}
	}

	#[tokio::test]
	async fn scenario_a_clean_happy_path() {
		let list = candidates(&[100, 102, 104, 110, 125, 130, 140]);
		let acquirer = ScriptedAcquirer::new(vec![]);
		let outcome = run_block_engine(
			&list,
			&params(3),
			EngineSeed::default(),
			&acquirer,
			&NoopObserver,
		)
		.await;

		assert_eq!(outcome.exit, EngineExit::Success);
		assert_eq!(outcome.iterations, 0);
		// Three lowest of the first block, in one pass
		assert_eq!(acquirer.dispatched(), vec![0, 1, 2]);
		let prices: Vec<Decimal> = outcome
			.validated
			.iter()
			.map(|s| s.price_value)
			.collect();
		assert_eq!(
			prices,
			vec![Decimal::from(100), Decimal::from(102), Decimal::from(104)]
		);
		assert_eq!(blocks::spread_pct(&prices), Some(Decimal::from(4)));
		assert!(outcome.failures.is_empty());
	}

	#[tokio::test]
	async fn scenario_b_block_recomputation_on_failure() {
		let list = candidates(&[100, 102, 104, 110, 125, 130, 140]);
		// 102 extracts at 150: mismatch beyond 15%
		let acquirer = ScriptedAcquirer::new(vec![(
			1,
			FailureReason::PriceMismatch,
			Some(Decimal::from(150)),
		)]);
		let outcome = run_block_engine(
			&list,
			&params(3),
			EngineSeed::default(),
			&acquirer,
			&NoopObserver,
		)
		.await;

		assert_eq!(outcome.exit, EngineExit::Success);
		let prices: Vec<Decimal> = outcome
			.validated
			.iter()
			.map(|s| s.price_value)
			.collect();
		assert_eq!(
			prices,
			vec![Decimal::from(100), Decimal::from(104), Decimal::from(110)]
		);
		// 102 failed, engine recomputed, then moved on to 104 and 110
		assert_eq!(acquirer.dispatched(), vec![0, 1, 2, 3]);
		assert_eq!(outcome.failures.len(), 1);
		let failure = &outcome.failures[0];
		assert_eq!(failure.reason, FailureReason::PriceMismatch);
		assert_eq!(failure.google_price, Some(Decimal::from(102)));
		assert_eq!(failure.extracted_price, Some(Decimal::from(150)));
	}

	#[tokio::test]
	async fn scenario_c_reserve_policy() {
		let list = candidates(&[100, 105, 108, 200, 210, 220]);
		let acquirer = ScriptedAcquirer::new(vec![
			(2, FailureReason::Timeout, None),
			(5, FailureReason::BlockedBySite, None),
		]);
		let outcome = run_block_engine(
			&list,
			&params(3),
			EngineSeed::default(),
			&acquirer,
			&NoopObserver,
		)
		.await;

		assert_eq!(outcome.exit, EngineExit::BestEffort);
		// Reserve restored: the original neighborhood's successes stand
		let prices: Vec<Decimal> = outcome
			.validated
			.iter()
			.map(|s| s.price_value)
			.collect();
		assert_eq!(prices, vec![Decimal::from(100), Decimal::from(105)]);
		// The alternative neighborhood's two successes are kept as
		// diagnostics, not counted
		assert_eq!(outcome.abandoned.len(), 2);
		let reasons: Vec<FailureReason> =
			outcome.failures.iter().map(|f| f.reason).collect();
		assert_eq!(
			reasons,
			vec![FailureReason::Timeout, FailureReason::BlockedBySite]
		);
	}

	#[tokio::test]
	async fn empty_candidate_list_exits_immediately() {
		let acquirer = ScriptedAcquirer::new(vec![]);
		let outcome = run_block_engine(
			&[],
			&params(3),
			EngineSeed::default(),
			&acquirer,
			&NoopObserver,
		)
		.await;
		assert_eq!(outcome.exit, EngineExit::Empty);
		assert!(acquirer.dispatched().is_empty());
	}

	#[tokio::test]
	async fn exactly_n_within_tolerance_succeeds_in_one_iteration() {
		let list = candidates(&[100, 110, 120]);
		let acquirer = ScriptedAcquirer::new(vec![]);
		let outcome = run_block_engine(
			&list,
			&params(3),
			EngineSeed::default(),
			&acquirer,
			&NoopObserver,
		)
		.await;
		assert_eq!(outcome.exit, EngineExit::Success);
		assert_eq!(outcome.iterations, 0);
		assert_eq!(outcome.validated.len(), 3);
	}

	#[tokio::test]
	async fn spread_just_above_tolerance_is_best_effort() {
		// No window of three exists; the engine still gathers what the
		// cheapest window offers
		let list = candidates(&[100, 110, 130]);
		let acquirer = ScriptedAcquirer::new(vec![]);
		let outcome = run_block_engine(
			&list,
			&params(3),
			EngineSeed::default(),
			&acquirer,
			&NoopObserver,
		)
		.await;
		assert_eq!(outcome.exit, EngineExit::BestEffort);
		assert!(!outcome.validated.is_empty());
		assert!(outcome.validated.len() < 3);
	}

	#[tokio::test]
	async fn all_candidates_rejected_is_empty() {
		let list = candidates(&[100, 102, 104]);
		let acquirer = ScriptedAcquirer::new(vec![
			(0, FailureReason::Timeout, None),
			(1, FailureReason::BlockedDomain, None),
			(2, FailureReason::PageLoadError, None),
		]);
		let outcome = run_block_engine(
			&list,
			&params(3),
			EngineSeed::default(),
			&acquirer,
			&NoopObserver,
		)
		.await;
		assert_eq!(outcome.exit, EngineExit::Empty);
		assert_eq!(outcome.failures.len(), 3);
	}

	#[tokio::test]
	async fn failed_candidates_are_never_redispatched() {
		let list = candidates(&[100, 102, 104, 110, 125]);
		let acquirer = ScriptedAcquirer::new(vec![(1, FailureReason::Timeout, None)]);
		let outcome = run_block_engine(
			&list,
			&params(3),
			EngineSeed::default(),
			&acquirer,
			&NoopObserver,
		)
		.await;
		assert_eq!(outcome.exit, EngineExit::Success);
		let dispatched = acquirer.dispatched();
		let count_of_1 = dispatched.iter().filter(|p| **p == 1).count();
		assert_eq!(count_of_1, 1);
	}

	#[tokio::test]
	async fn seeded_resume_skips_prior_dispatches() {
		let list = candidates(&[100, 102, 104, 110, 125]);
		// Original run accepted 100 and failed 102 before dying
		let mut seed = EngineSeed::default();
		seed.validated.insert(0, source_for(&list[0]));
		seed.failed.insert(1);

		let acquirer = ScriptedAcquirer::new(vec![]);
		let outcome = run_block_engine(
			&list,
			&params(3),
			seed,
			&acquirer,
			&NoopObserver,
		)
		.await;
		assert_eq!(outcome.exit, EngineExit::Success);
		// Neither 100 nor 102 is dispatched again
		assert_eq!(acquirer.dispatched(), vec![2, 3]);
	}

	#[tokio::test]
	async fn iteration_cap_forces_best_effort() {
		let list = candidates(&[100, 102, 104, 106, 108]);
		// Everything but the first two fails; the engine keeps trying
		// until candidates or iterations run out
		let acquirer = ScriptedAcquirer::new(vec![
			(2, FailureReason::Timeout, None),
			(3, FailureReason::Timeout, None),
			(4, FailureReason::Timeout, None),
		]);
		let restricted = EngineParams {
			target: 3,
			variation_max_pct: Decimal::from(25),
			max_iterations: 2,
		};
		let outcome = run_block_engine(
			&list,
			&restricted,
			EngineSeed::default(),
			&acquirer,
			&NoopObserver,
		)
		.await;
		assert_eq!(outcome.exit, EngineExit::BestEffort);
		assert!(outcome.iterations <= 2);
	}

	struct CancellingObserver;

	#[async_trait]
	impl EngineObserver for CancellingObserver {
		async fn after_dispatch(&self, _event: DispatchEvent<'_>) -> bool {
			false
		}
	}

	#[tokio::test]
	async fn cancellation_stops_the_run() {
		let list = candidates(&[100, 102, 104]);
		let acquirer = ScriptedAcquirer::new(vec![]);
		let outcome = run_block_engine(
			&list,
			&params(3),
			EngineSeed::default(),
			&acquirer,
			&CancellingObserver,
		)
		.await;
		assert_eq!(outcome.exit, EngineExit::Cancelled);
		assert_eq!(acquirer.dispatched(), vec![0]);
	}
}
