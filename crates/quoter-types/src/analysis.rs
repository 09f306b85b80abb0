//! Query-analysis types describing the item under quotation.
//!
//! The analyzer itself is an external collaborator; the pipeline only
//! consumes its payload and routes vehicles away from the shopping path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Nature of the item, as classified by the query analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemNature {
	Produto,
	VeiculoCarro,
	VeiculoMoto,
	VeiculoCaminhao,
}

impl ItemNature {
	/// Vehicles are priced through the official table, not the shopping path.
	pub fn is_vehicle(&self) -> bool {
		matches!(
			self,
			ItemNature::VeiculoCarro | ItemNature::VeiculoMoto | ItemNature::VeiculoCaminhao
		)
	}
}

/// Payload returned by the query analyzer.
///
/// Vendor fields we do not interpret are preserved in `extra` so the raw
/// payload can be persisted and replayed on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
	/// Search query derived from the item description or photo.
	pub query_string: String,
	/// Classified nature of the item.
	pub natureza: ItemNature,
	/// Canonical asset designation, when the analyzer produced one.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bem_patrimonial: Option<String>,
	/// Unparsed vendor data carried along verbatim.
	#[serde(flatten)]
	pub extra: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn natureza_roundtrip_and_vehicle_routing() {
		let json = r#"{"query_string":"notebook dell inspiron 15","natureza":"produto"}"#;
		let a: QueryAnalysis = serde_json::from_str(json).unwrap();
		assert!(!a.natureza.is_vehicle());

		let json = r#"{"query_string":"fiat strada 2021","natureza":"veiculo_carro","modelo":"strada"}"#;
		let a: QueryAnalysis = serde_json::from_str(json).unwrap();
		assert!(a.natureza.is_vehicle());
		assert!(a.extra.contains_key("modelo"));
	}
}
