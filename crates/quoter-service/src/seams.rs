//! Concrete implementations of the external-collaborator seams.
//!
//! The analyzer and the vehicle-price table are separate services; here
//! they are reached over HTTP. The artifact sink writes the completed
//! bundle as JSON for the report builder to pick up. When no analyzer
//! endpoint is configured, a passthrough stand-in derives the query
//! straight from the item text.

use async_trait::async_trait;
use quoter_config::{AnalyzerConfig, FipeConfig};
use quoter_core::seams::{
	AnalyzerInput, ArtifactBundle, ArtifactSink, FipeProvider, FipeQuote, QueryAnalyzer,
};
use quoter_core::PipelineError;
use quoter_types::{ItemNature, QueryAnalysis};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Analyzer reached over HTTP.
///
/// Posts `{ input_text, input_image }` and expects the analysis payload
/// back: `{ query_string, natureza, bem_patrimonial? }`.
pub struct HttpAnalyzer {
	client: reqwest::Client,
	url: String,
}

impl HttpAnalyzer {
	pub fn new(config: &AnalyzerConfig) -> Result<Self, PipelineError> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(config.timeout_seconds))
			.build()
			.map_err(|e| PipelineError::Config(e.to_string()))?;
		Ok(Self {
			client,
			url: config.url.clone(),
		})
	}
}

#[async_trait]
impl QueryAnalyzer for HttpAnalyzer {
	async fn analyze(&self, input: AnalyzerInput) -> Result<QueryAnalysis, PipelineError> {
		let body = serde_json::json!({
			"input_text": input.text,
			"input_image": input.image,
		});
		let response = self
			.client
			.post(&self.url)
			.json(&body)
			.send()
			.await
			.map_err(|e| PipelineError::Analyzer(e.to_string()))?;
		if !response.status().is_success() {
			return Err(PipelineError::Analyzer(format!(
				"analyzer returned HTTP {}",
				response.status()
			)));
		}
		response
			.json::<QueryAnalysis>()
			.await
			.map_err(|e| PipelineError::Analyzer(e.to_string()))
	}
}

/// Stand-in analyzer used when no endpoint is configured.
///
/// Takes the item text as the search query verbatim and classifies by a
/// small keyword heuristic. Image inputs require the real analyzer.
pub struct PassthroughAnalyzer;

#[async_trait]
impl QueryAnalyzer for PassthroughAnalyzer {
	async fn analyze(&self, input: AnalyzerInput) -> Result<QueryAnalysis, PipelineError> {
		let text = input
			.text
			.filter(|t| !t.trim().is_empty())
			.ok_or_else(|| {
				PipelineError::Analyzer(
					"image analysis requires a configured analyzer service".into(),
				)
			})?;

		let lower = text.to_lowercase();
		let natureza = if lower.contains("caminhão") || lower.contains("caminhao") {
			ItemNature::VeiculoCaminhao
		} else if lower.contains("motocicleta") || lower.contains("moto ") {
			ItemNature::VeiculoMoto
		} else if lower.contains("veículo") || lower.contains("veiculo") || lower.contains("carro")
		{
			ItemNature::VeiculoCarro
		} else {
			ItemNature::Produto
		};

		Ok(QueryAnalysis {
			query_string: text.split_whitespace().collect::<Vec<_>>().join(" "),
			natureza,
			bem_patrimonial: None,
			extra: HashMap::new(),
		})
	}
}

/// Vehicle-price provider reached over HTTP.
///
/// Posts the analysis payload and expects
/// `{ vehicle_key, price, reference_month, url }` back.
pub struct HttpFipeProvider {
	client: reqwest::Client,
	url: String,
}

impl HttpFipeProvider {
	pub fn new(config: &FipeConfig) -> Result<Self, PipelineError> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(config.timeout_seconds))
			.build()
			.map_err(|e| PipelineError::Config(e.to_string()))?;
		Ok(Self {
			client,
			url: config.url.clone(),
		})
	}
}

#[async_trait]
impl FipeProvider for HttpFipeProvider {
	async fn lookup(&self, analysis: &QueryAnalysis) -> Result<FipeQuote, PipelineError> {
		let response = self
			.client
			.post(&self.url)
			.json(analysis)
			.send()
			.await
			.map_err(|e| PipelineError::Service(e.to_string()))?;
		if !response.status().is_success() {
			return Err(PipelineError::Service(format!(
				"FIPE service returned HTTP {}",
				response.status()
			)));
		}
		response
			.json::<FipeQuote>()
			.await
			.map_err(|e| PipelineError::Service(e.to_string()))
	}
}

/// Provider used when no FIPE endpoint is configured.
pub struct UnconfiguredFipeProvider;

#[async_trait]
impl FipeProvider for UnconfiguredFipeProvider {
	async fn lookup(&self, _analysis: &QueryAnalysis) -> Result<FipeQuote, PipelineError> {
		Err(PipelineError::Service(
			"vehicle request but no FIPE service configured".into(),
		))
	}
}

/// Writes completed bundles as JSON files for the report builder.
pub struct JsonArtifactSink {
	output_dir: PathBuf,
}

impl JsonArtifactSink {
	pub fn new(output_dir: impl Into<PathBuf>) -> Self {
		Self {
			output_dir: output_dir.into(),
		}
	}
}

#[async_trait]
impl ArtifactSink for JsonArtifactSink {
	async fn emit(&self, bundle: ArtifactBundle) -> Result<String, PipelineError> {
		tokio::fs::create_dir_all(&self.output_dir)
			.await
			.map_err(|e| PipelineError::Service(e.to_string()))?;
		let path = self.output_dir.join(format!("{}.json", bundle.request_id));
		let payload = serde_json::to_vec_pretty(&bundle)
			.map_err(|e| PipelineError::Service(e.to_string()))?;
		tokio::fs::write(&path, payload)
			.await
			.map_err(|e| PipelineError::Service(e.to_string()))?;
		tracing::info!(path = %path.display(), "Artifact bundle emitted");
		Ok(path.to_string_lossy().into_owned())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn passthrough_classifies_vehicles() {
		let analyzer = PassthroughAnalyzer;
		let analysis = analyzer
			.analyze(AnalyzerInput {
				text: Some("carro fiat strada 2021".into()),
				image: None,
			})
			.await
			.unwrap();
		assert!(analysis.natureza.is_vehicle());

		let analysis = analyzer
			.analyze(AnalyzerInput {
				text: Some("notebook  dell   inspiron".into()),
				image: None,
			})
			.await
			.unwrap();
		assert_eq!(analysis.natureza, ItemNature::Produto);
		assert_eq!(analysis.query_string, "notebook dell inspiron");
	}

	#[tokio::test]
	async fn passthrough_rejects_image_only_input() {
		let analyzer = PassthroughAnalyzer;
		let result = analyzer
			.analyze(AnalyzerInput {
				text: None,
				image: Some("file-123".into()),
			})
			.await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn sink_writes_bundle_json() {
		let dir = tempfile::tempdir().unwrap();
		let sink = JsonArtifactSink::new(dir.path());
		let path = sink
			.emit(ArtifactBundle {
				request_id: "r1".into(),
				item_name: "notebook".into(),
				item_code: Some("PAT-001".into()),
				sources: vec![],
				aggregates: None,
				location: "Brazil".into(),
			})
			.await
			.unwrap();
		let written = std::fs::read_to_string(path).unwrap();
		assert!(written.contains("PAT-001"));
	}
}
