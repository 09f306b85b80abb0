//! Top-level per-request driver.
//!
//! Walks one request through analysis, search, block-engine extraction,
//! and finalization, saving a checkpoint at every stage boundary so a
//! crashed run resumes from the last completed stage instead of starting
//! over. Cancellation is honored at those same boundaries.

use crate::checkpoint::CheckpointManager;
use crate::engine::acquisition::CandidateAcquirer;
use crate::engine::{
	run_block_engine, DispatchEvent, EngineExit, EngineOutcome, EngineParams, EngineObserver,
	EngineSeed,
};
use crate::event_bus::EventBus;
use crate::seams::{
	AnalyzerInput, ArtifactBundle, ArtifactSink, FipeProvider, QueryAnalyzer, VehiclePriceBank,
};
use crate::PipelineError;
use async_trait::async_trait;
use chrono::Utc;
use quoter_policy::DomainPolicy;
use quoter_render::RenderInterface;
use quoter_search::{SearchRequest, SearchService};
use quoter_storage::{StorageService, StorageIndexes};
use quoter_types::{
	truncate_id, AcquisitionEvent, Candidate, ExtractionMethod, PipelineEvent,
	ProcessingCheckpoint, QueryAnalysis, QuoteAggregates, QuoteRequest, QuoteSource,
	QuoteSourceFailure, QuoteStatus, RequestEvent, StorageNamespace,
};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-request driver over the shared services.
pub struct RequestOrchestrator {
	storage: Arc<StorageService>,
	checkpoints: Arc<CheckpointManager>,
	policy: Arc<DomainPolicy>,
	search: Arc<SearchService>,
	render: Arc<dyn RenderInterface>,
	analyzer: Arc<dyn QueryAnalyzer>,
	fipe: Arc<dyn FipeProvider>,
	sink: Arc<dyn ArtifactSink>,
	vehicle_bank: Arc<VehiclePriceBank>,
	event_bus: EventBus,
	screenshot_dir: PathBuf,
}

impl RequestOrchestrator {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		storage: Arc<StorageService>,
		checkpoints: Arc<CheckpointManager>,
		policy: Arc<DomainPolicy>,
		search: Arc<SearchService>,
		render: Arc<dyn RenderInterface>,
		analyzer: Arc<dyn QueryAnalyzer>,
		fipe: Arc<dyn FipeProvider>,
		sink: Arc<dyn ArtifactSink>,
		vehicle_bank: Arc<VehiclePriceBank>,
		event_bus: EventBus,
		screenshot_dir: PathBuf,
	) -> Self {
		Self {
			storage,
			checkpoints,
			policy,
			search,
			render,
			analyzer,
			fipe,
			sink,
			vehicle_bank,
			event_bus,
			screenshot_dir,
		}
	}

	/// Processes one request to a terminal state.
	///
	/// Safe to call again after a crash: the checkpoint decides where to
	/// pick up.
	#[tracing::instrument(skip_all, fields(request_id = %truncate_id(request_id)))]
	pub async fn process(&self, request_id: &str) -> Result<(), PipelineError> {
		let mut request: QuoteRequest = self
			.storage
			.retrieve(StorageNamespace::Quotes.as_str(), request_id)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;

		if request.is_terminal() {
			tracing::debug!("Request already terminal, nothing to do");
			return Ok(());
		}

		if !self.checkpoints.claim(&mut request).await? {
			return Ok(());
		}

		let resume_from = self.checkpoints.resume_point(&request);
		match resume_from {
			None => {
				self.checkpoints.start(&mut request).await?;
			},
			Some(checkpoint) => {
				tracing::info!(?checkpoint, attempt = request.attempt_number, "Resuming");
			},
		}
		self.event_bus
			.publish(PipelineEvent::Request(RequestEvent::Started {
				request_id: request.id.clone(),
				attempt: request.attempt_number,
			}));

		match self.drive(&mut request, resume_from).await {
			Ok(()) => Ok(()),
			Err(PipelineError::Cancelled) => {
				tracing::info!("Request cancelled");
				Ok(())
			},
			Err(e) => {
				self.checkpoints.fail(&mut request, &e.to_string()).await?;
				self.event_bus
					.publish(PipelineEvent::Request(RequestEvent::Failed {
						request_id: request.id.clone(),
						message: e.to_string(),
					}));
				Ok(())
			},
		}
	}

	/// Runs the stages from the resume point forward.
	async fn drive(
		&self,
		request: &mut QuoteRequest,
		resume_from: Option<ProcessingCheckpoint>,
	) -> Result<(), PipelineError> {
		let analysis = self.stage_analysis(request, resume_from).await?;
		self.ensure_not_cancelled(request).await?;

		if analysis.natureza.is_vehicle() {
			return self.stage_fipe(request, &analysis).await;
		}

		let candidates = self.stage_search(request, &analysis, resume_from).await?;
		self.ensure_not_cancelled(request).await?;

		let outcome = self.stage_extraction(request, &candidates).await?;
		self.stage_finalization(request, &analysis, outcome).await
	}

	/// Reloads the stored status and aborts when an operator cancelled.
	async fn ensure_not_cancelled(&self, request: &mut QuoteRequest) -> Result<(), PipelineError> {
		let stored: QuoteRequest = self
			.storage
			.retrieve(StorageNamespace::Quotes.as_str(), &request.id)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;
		if stored.status == QuoteStatus::Cancelled {
			request.status = QuoteStatus::Cancelled;
			return Err(PipelineError::Cancelled);
		}
		Ok(())
	}

	/// Analysis stage: call the analyzer unless its payload is already
	/// persisted.
	async fn stage_analysis(
		&self,
		request: &mut QuoteRequest,
		resume_from: Option<ProcessingCheckpoint>,
	) -> Result<QueryAnalysis, PipelineError> {
		if let Some(payload) = &request.analysis_json {
			if resume_from.map(|c| c > ProcessingCheckpoint::AiAnalysisDone).unwrap_or(false) {
				return serde_json::from_value(payload.clone())
					.map_err(|e| PipelineError::Analyzer(format!("stored payload invalid: {}", e)));
			}
		}

		self.checkpoints
			.save(request, ProcessingCheckpoint::AiAnalysisStart, None, Some(5))
			.await?;

		let analysis = self
			.analyzer
			.analyze(AnalyzerInput {
				text: request.input_text.clone(),
				image: request.input_image.clone(),
			})
			.await?;

		request.analysis_json = serde_json::to_value(&analysis).ok();
		self.checkpoints
			.save(
				request,
				ProcessingCheckpoint::AiAnalysisDone,
				None,
				Some(10),
			)
			.await?;
		Ok(analysis)
	}

	/// FIPE stage: single direct observation from the official table,
	/// consulting the price bank first.
	async fn stage_fipe(
		&self,
		request: &mut QuoteRequest,
		analysis: &QueryAnalysis,
	) -> Result<(), PipelineError> {
		self.checkpoints
			.save(request, ProcessingCheckpoint::FipeSearch, None, Some(30))
			.await?;

		let vehicle_key = vehicle_key(analysis);
		let (price, reference_month, url) = match self.vehicle_bank.get(&vehicle_key).await {
			Some(cached) => {
				tracing::info!(%vehicle_key, "Vehicle price served from bank");
				(
					cached.price,
					cached.reference_month,
					format!("https://veiculos.fipe.org.br/#{}", vehicle_key),
				)
			},
			None => {
				let quote = self.fipe.lookup(analysis).await?;
				self.vehicle_bank.put(&quote).await?;
				(quote.price, quote.reference_month, quote.url)
			},
		};

		let source = QuoteSource {
			request_id: request.id.clone(),
			url: url.clone(),
			domain: quoter_policy::host_of(&url).unwrap_or_else(|| "fipe.org.br".to_string()),
			page_title: Some(format!("{} ({})", analysis.query_string, reference_month)),
			price_value: price,
			currency: "BRL".to_string(),
			extraction_method: ExtractionMethod::ApiFipe,
			screenshot_file: None,
			captured_at: Utc::now(),
			is_accepted: true,
			failure_reason: None,
		};

		self.checkpoints
			.save(request, ProcessingCheckpoint::FipeDone, None, Some(90))
			.await?;

		let outcome = EngineOutcome {
			validated: vec![source],
			abandoned: Vec::new(),
			failures: Vec::new(),
			iterations: 0,
			exit: EngineExit::Success,
		};
		self.stage_finalization(request, analysis, outcome).await
	}

	/// Search stage: one shopping-search call, raw response persisted.
	async fn stage_search(
		&self,
		request: &mut QuoteRequest,
		analysis: &QueryAnalysis,
		resume_from: Option<ProcessingCheckpoint>,
	) -> Result<Vec<Candidate>, PipelineError> {
		let skip_call = request.search_response_json.is_some()
			&& resume_from
				.map(|c| c >= ProcessingCheckpoint::PriceExtractionStart)
				.unwrap_or(false);

		if skip_call {
			// Replaying the stored response keeps the candidate ordering
			// identical to the original run
			let raw = request
				.search_response_json
				.clone()
				.unwrap_or(serde_json::Value::Null);
			return Ok(self.search.candidates_from_raw(
				&raw,
				&self.policy,
				request.params.max_valid_products,
			));
		}

		self.checkpoints
			.save(
				request,
				ProcessingCheckpoint::ShoppingSearchStart,
				None,
				Some(15),
			)
			.await?;

		let search_request = SearchRequest::from_params(&analysis.query_string, &request.params);
		let (raw, candidates) = self
			.search
			.search(
				&search_request,
				&self.policy,
				request.params.max_valid_products,
			)
			.await
			.map_err(|e| PipelineError::Search(e.to_string()))?;

		request.search_response_json = Some(raw);
		self.checkpoints
			.save(
				request,
				ProcessingCheckpoint::ShoppingSearchDone,
				None,
				Some(20),
			)
			.await?;
		Ok(candidates)
	}

	/// Extraction stage: the block engine over the candidate list.
	async fn stage_extraction(
		&self,
		request: &mut QuoteRequest,
		candidates: &[Candidate],
	) -> Result<EngineOutcome, PipelineError> {
		self.checkpoints
			.save(
				request,
				ProcessingCheckpoint::PriceExtractionStart,
				Some(
					[("candidate_count".to_string(), json!(candidates.len()))]
						.into_iter()
						.collect(),
				),
				Some(20),
			)
			.await?;

		if candidates.is_empty() {
			return Ok(EngineOutcome {
				validated: Vec::new(),
				abandoned: Vec::new(),
				failures: Vec::new(),
				iterations: 0,
				exit: EngineExit::Empty,
			});
		}

		let seed = self.rebuild_seed(request).await;
		let params = EngineParams {
			target: request
				.params
				.target_sources
				.min(request.params.max_stored_per_item),
			variation_max_pct: request.params.variation_max_pct,
			max_iterations: request.params.max_block_iterations,
		};

		let acquirer = CandidateAcquirer::new(
			request.id.clone(),
			request.params.clone(),
			self.policy.clone(),
			self.search.clone(),
			self.render.clone(),
			self.screenshot_dir.clone(),
		);

		let observer = ProgressObserver {
			storage: self.storage.clone(),
			checkpoints: self.checkpoints.clone(),
			event_bus: self.event_bus.clone(),
			target: params.target,
			state: Mutex::new(ObserverState {
				request: request.clone(),
				partial_sources: seed.validated.values().cloned().collect(),
				tested: seed
					.failed
					.iter()
					.copied()
					.chain(seed.validated.keys().copied())
					.collect(),
				validated_entries: seed
					.validated
					.iter()
					.map(|(p, s)| json!({ "position": p, "url": s.url }))
					.collect(),
			}),
		};

		let outcome =
			run_block_engine(candidates, &params, seed, &acquirer, &observer).await;

		// Fold the observer's request copy (heartbeats, resume data) back
		let observed = observer.state.into_inner().request;
		*request = observed;

		if outcome.exit == EngineExit::Cancelled {
			return Err(PipelineError::Cancelled);
		}

		self.checkpoints
			.save(
				request,
				ProcessingCheckpoint::PriceExtractionDone,
				None,
				Some(95),
			)
			.await?;
		Ok(outcome)
	}

	/// Rebuilds engine state from a previous attempt's persisted data.
	async fn rebuild_seed(&self, request: &QuoteRequest) -> EngineSeed {
		let mut seed = EngineSeed::default();

		let tested: Vec<usize> = request
			.resume_data
			.get("tested_products")
			.and_then(|v| serde_json::from_value(v.clone()).ok())
			.unwrap_or_default();
		if tested.is_empty() {
			return seed;
		}

		let validated_entries: Vec<serde_json::Value> = request
			.resume_data
			.get("validated_products")
			.and_then(|v| v.as_array().cloned())
			.unwrap_or_default();
		let sources: Vec<QuoteSource> = self
			.storage
			.retrieve(StorageNamespace::Sources.as_str(), &request.id)
			.await
			.unwrap_or_default();

		let mut validated: BTreeMap<usize, QuoteSource> = BTreeMap::new();
		for entry in validated_entries {
			let position = entry.get("position").and_then(|p| p.as_u64());
			let url = entry.get("url").and_then(|u| u.as_str());
			if let (Some(position), Some(url)) = (position, url) {
				if let Some(source) = sources.iter().find(|s| s.url == url) {
					validated.insert(position as usize, source.clone());
				}
			}
		}

		let validated_positions: HashSet<usize> = validated.keys().copied().collect();
		seed.failed = tested
			.into_iter()
			.filter(|p| !validated_positions.contains(p))
			.collect();
		seed.validated = validated;
		tracing::info!(
			validated = seed.validated.len(),
			failed = seed.failed.len(),
			"Resuming extraction mid-flight"
		);
		seed
	}

	/// Finalization: aggregates, terminal status, persistence, artifact.
	async fn stage_finalization(
		&self,
		request: &mut QuoteRequest,
		analysis: &QueryAnalysis,
		outcome: EngineOutcome,
	) -> Result<(), PipelineError> {
		self.checkpoints
			.save(request, ProcessingCheckpoint::Finalization, None, Some(95))
			.await?;

		let mut accepted = outcome.validated;
		accepted.truncate(request.params.max_stored_per_item);

		let failure_records: Vec<QuoteSourceFailure> = outcome
			.failures
			.into_iter()
			.map(|f| f.into_record(&request.id))
			.collect();
		self.storage
			.store(
				StorageNamespace::Failures.as_str(),
				&request.id,
				&failure_records,
				None,
			)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;

		let mut all_sources = accepted.clone();
		all_sources.extend(outcome.abandoned.into_iter().map(|mut s| {
			s.is_accepted = false;
			s
		}));
		self.storage
			.store(
				StorageNamespace::Sources.as_str(),
				&request.id,
				&all_sources,
				Some(StorageIndexes::new().with_field("request_id", request.id.clone())),
			)
			.await
			.map_err(|e| PipelineError::Storage(e.to_string()))?;

		let prices: Vec<_> = accepted.iter().map(|s| s.price_value).collect();
		request.aggregates = QuoteAggregates::compute(&prices);

		let status = match outcome.exit {
			EngineExit::Success => {
				// The engine reached its target; the spread check decides
				// between DONE and review
				let within = request
					.aggregates
					.as_ref()
					.map(|a| a.variation_pct <= request.params.variation_max_pct)
					.unwrap_or(false);
				if within {
					QuoteStatus::Done
				} else {
					QuoteStatus::AwaitingReview
				}
			},
			EngineExit::BestEffort => QuoteStatus::AwaitingReview,
			EngineExit::Empty | EngineExit::Cancelled => {
				self.checkpoints.fail(request, "no acceptable offers").await?;
				self.event_bus
					.publish(PipelineEvent::Request(RequestEvent::Failed {
						request_id: request.id.clone(),
						message: "no acceptable offers".to_string(),
					}));
				return Ok(());
			},
		};

		if matches!(status, QuoteStatus::Done | QuoteStatus::AwaitingReview) {
			let bundle = ArtifactBundle {
				request_id: request.id.clone(),
				item_name: analysis.query_string.clone(),
				item_code: request.item_code.clone(),
				sources: accepted.clone(),
				aggregates: request.aggregates.clone(),
				location: request.params.location.clone(),
			};
			match self.sink.emit(bundle).await {
				Ok(artifact) => request.report_file = Some(artifact),
				Err(e) => {
					// The quotation stands even when the report does not
					tracing::error!(error = %e, "Artifact emission failed");
				},
			}
		}

		request.progress_pct = 100;
		self.checkpoints.complete(request, status).await?;
		self.event_bus
			.publish(PipelineEvent::Request(RequestEvent::Completed {
				request_id: request.id.clone(),
				status,
			}));
		Ok(())
	}
}

/// Normalized cache key for a vehicle analysis.
fn vehicle_key(analysis: &QueryAnalysis) -> String {
	analysis
		.bem_patrimonial
		.as_deref()
		.unwrap_or(&analysis.query_string)
		.to_lowercase()
		.split_whitespace()
		.collect::<Vec<_>>()
		.join("-")
}

struct ObserverState {
	request: QuoteRequest,
	partial_sources: Vec<QuoteSource>,
	tested: Vec<usize>,
	validated_entries: Vec<serde_json::Value>,
}

/// Engine observer that persists incremental progress.
///
/// After every dispatch it heartbeats, stores the partial observation
/// list, records tested/validated positions in resume data, updates the
/// progress percentage, and checks for operator cancellation.
struct ProgressObserver {
	storage: Arc<StorageService>,
	checkpoints: Arc<CheckpointManager>,
	event_bus: EventBus,
	target: usize,
	state: Mutex<ObserverState>,
}

impl ProgressObserver {
	fn progress_pct(&self, validated: usize) -> u8 {
		let pct = 20 + (75 * validated) / self.target.max(1);
		pct.min(95) as u8
	}
}

#[async_trait]
impl EngineObserver for ProgressObserver {
	async fn after_dispatch(&self, event: DispatchEvent<'_>) -> bool {
		let mut state = self.state.lock().await;

		let validated_count = match &event {
			DispatchEvent::Accepted {
				position,
				source,
				validated_count,
			} => {
				state.partial_sources.push((*source).clone());
				state.tested.push(*position);
				state
					.validated_entries
					.push(json!({ "position": position, "url": source.url }));
				self.event_bus
					.publish(PipelineEvent::Acquisition(AcquisitionEvent::Accepted {
						request_id: state.request.id.clone(),
						url: source.url.clone(),
						price: source.price_value,
					}));
				*validated_count
			},
			DispatchEvent::Rejected {
				position,
				failure,
				validated_count,
			} => {
				state.tested.push(*position);
				self.event_bus
					.publish(PipelineEvent::Acquisition(AcquisitionEvent::Rejected {
						request_id: state.request.id.clone(),
						url: failure.url.clone(),
						reason: failure.reason,
					}));
				*validated_count
			},
		};

		// Persist the partial observation list for mid-flight resume
		let request_id = state.request.id.clone();
		let partial = state.partial_sources.clone();
		if let Err(e) = self
			.storage
			.store(StorageNamespace::Sources.as_str(), &request_id, &partial, None)
			.await
		{
			tracing::warn!(error = %e, "Failed to persist partial sources");
		}

		let resume_data = [
			("tested_products".to_string(), json!(state.tested)),
			(
				"validated_products".to_string(),
				json!(state.validated_entries),
			),
		]
		.into_iter()
		.collect();
		let progress = self.progress_pct(validated_count);
		let ObserverState { request, .. } = &mut *state;
		if let Err(e) = self
			.checkpoints
			.save(
				request,
				ProcessingCheckpoint::PriceExtractionProgress,
				Some(resume_data),
				Some(progress),
			)
			.await
		{
			tracing::warn!(error = %e, "Failed to save extraction progress");
		}

		// Persisting adopts an operator-written CANCELLED status, so the
		// in-memory copy now tells us whether to keep going
		state.request.status != QuoteStatus::Cancelled
	}
}
