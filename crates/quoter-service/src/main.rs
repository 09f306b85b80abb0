//! Main entry point for the quotation pipeline service.
//!
//! This binary assembles the full pipeline: storage, search, rendering,
//! the external seams, the worker loop, and the HTTP control surface. It
//! uses a modular architecture with pluggable implementations chosen by
//! name from the TOML configuration.

use clap::Parser;
use quoter_config::Config;
use quoter_core::seams::{ArtifactSink, FipeProvider, QueryAnalyzer};
use quoter_core::{PipelineBuilder, PipelineFactories, QuotePipeline};
use std::path::PathBuf;
use std::sync::Arc;

mod seams;
mod server;

use quoter_render::implementations::chromium::create_render;
use quoter_search::implementations::serpapi::create_search;
use quoter_storage::implementations::file::create_storage as create_file_storage;
use quoter_storage::implementations::memory::create_storage as create_memory_storage;
use seams::{
	HttpAnalyzer, HttpFipeProvider, JsonArtifactSink, PassthroughAnalyzer,
	UnconfiguredFipeProvider,
};

/// Command-line arguments for the quotation service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	// Initialize tracing with env filter
	use tracing_subscriber::{fmt, EnvFilter};

	let default_directive = args.log_level.to_string();
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	fmt()
		.with_env_filter(env_filter)
		.with_target(true)
		.init();

	tracing::info!("Started quotation service");

	let config = Config::from_file(args.config.to_str().unwrap_or("config.toml"))?;

	let pipeline = Arc::new(build_pipeline(config.clone())?);
	tracing::info!("Loaded pipeline");

	let api_config = config.api.clone().filter(|api| api.enabled);

	if let Some(api_config) = api_config {
		let api_pipeline = Arc::clone(&pipeline);

		tracing::info!("Starting workers and API server");
		tokio::select! {
			result = pipeline.run() => {
				tracing::info!("Worker loop finished");
				result?;
			}
			result = server::start_server(api_config, api_pipeline) => {
				tracing::info!("API server finished");
				result?;
			}
		}
	} else {
		tracing::info!("Starting workers only");
		pipeline.run().await?;
	}

	tracing::info!("Stopped quotation service");
	Ok(())
}

/// Macro to create a factory HashMap for one implementation family.
macro_rules! create_factory_map {
	($factory_ty:ty, $( $name:literal => $factory:expr ),* $(,)?) => {{
		let mut factories: std::collections::HashMap<String, $factory_ty> =
			std::collections::HashMap::new();
		$(
			factories.insert($name.to_string(), $factory as $factory_ty);
		)*
		factories
	}};
}

/// Builds the pipeline with all registered implementations.
fn build_pipeline(config: Config) -> anyhow::Result<QuotePipeline> {
	let storage_factories = create_factory_map!(
		quoter_storage::StorageFactory,
		"file" => create_file_storage,
		"memory" => create_memory_storage,
	);
	let search_factories = create_factory_map!(
		quoter_search::SearchFactory,
		"serpapi" => create_search,
	);
	let render_factories = create_factory_map!(
		quoter_render::RenderFactory,
		"chromium" => create_render,
	);

	let analyzer: Arc<dyn QueryAnalyzer> = match &config.analyzer {
		Some(analyzer_config) => Arc::new(HttpAnalyzer::new(analyzer_config)?),
		None => {
			tracing::warn!("No analyzer service configured, using text passthrough");
			Arc::new(PassthroughAnalyzer)
		},
	};
	let fipe: Arc<dyn FipeProvider> = match &config.fipe {
		Some(fipe_config) => Arc::new(HttpFipeProvider::new(fipe_config)?),
		None => Arc::new(UnconfiguredFipeProvider),
	};
	let sink: Arc<dyn ArtifactSink> =
		Arc::new(JsonArtifactSink::new(config.artifacts.output_dir.clone()));

	let pipeline = PipelineBuilder::new(config)
		.with_analyzer(analyzer)
		.with_fipe(fipe)
		.with_artifact_sink(sink)
		.build(PipelineFactories {
			storage_factories,
			search_factories,
			render_factories,
		})?;

	Ok(pipeline)
}
