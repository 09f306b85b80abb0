//! Page rendering module for the quotation pipeline.
//!
//! This module renders store pages in a headless browser, captures the
//! screenshot evidence the report needs, and hands a DOM snapshot to the
//! layered price extractor. Each render call is independent: pages and
//! their state are never shared across requests.

use async_trait::async_trait;
use quoter_types::{ConfigSchema, ImplementationRegistry};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub mod extractor;

/// Re-export implementations
pub mod implementations {
	pub mod chromium;
}

/// Errors that can occur during rendering.
#[derive(Debug, Error)]
pub enum RenderError {
	/// Page load exceeded both navigation timeouts.
	#[error("Load timeout")]
	LoadTimeout,
	/// Navigation failed outright.
	#[error("Navigation error: {0}")]
	Navigation(String),
	/// The site served a captcha, a 403, or an empty shell.
	#[error("Blocked by site")]
	BlockedBySite,
	/// Screenshot capture failed after a successful load.
	#[error("Screenshot error: {0}")]
	Screenshot(String),
	/// Browser-level failure (launch, crashed tab, lost connection).
	#[error("Browser error: {0}")]
	Browser(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// A snapshot of a rendered page, detached from the browser.
///
/// Everything the extraction layers need is captured eagerly so the
/// browser page can be closed before extraction begins.
#[derive(Debug, Clone)]
pub struct RenderedPage {
	/// Final URL after redirects.
	pub url: String,
	/// Document title, when present.
	pub title: Option<String>,
	/// Serialized document HTML.
	pub html: String,
	/// Visible body text.
	pub body_text: String,
}

/// Trait defining the interface for render engines.
#[async_trait]
pub trait RenderInterface: Send + Sync {
	/// Returns the configuration schema for this engine.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Loads a URL, dismisses overlays, writes a clipped top-of-page
	/// screenshot to `screenshot_path`, and returns the DOM snapshot.
	async fn render(
		&self,
		url: &str,
		screenshot_path: &Path,
	) -> Result<RenderedPage, RenderError>;
}

/// Type alias for render factory functions.
pub type RenderFactory = fn(&toml::Value) -> Result<Box<dyn RenderInterface>, RenderError>;

/// Registry trait for render implementations.
pub trait RenderEngineRegistry: ImplementationRegistry<Factory = RenderFactory> {}

/// Get all registered render implementations.
pub fn get_all_implementations() -> Vec<(&'static str, RenderFactory)> {
	use implementations::chromium;

	vec![(chromium::Registry::NAME, chromium::Registry::factory())]
}

/// Computes the screenshot clip height for a page.
///
/// Captures the top portion of the page (title, image, price area):
/// 45% of the page height, clamped to the 900-1800 px range.
pub fn clip_height(page_height: f64) -> f64 {
	(page_height * 0.45).clamp(900.0, 1800.0)
}

/// Navigation timeouts: first attempt waits for DOM-content-loaded, the
/// retry waits for the full load event.
#[derive(Debug, Clone, Copy)]
pub struct RenderTimeouts {
	pub first_try: Duration,
	pub second_try: Duration,
	pub settle: Duration,
}

impl Default for RenderTimeouts {
	fn default() -> Self {
		Self {
			first_try: Duration::from_secs(30),
			second_try: Duration::from_secs(45),
			settle: Duration::from_secs(3),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clip_height_bounds() {
		assert_eq!(clip_height(1000.0), 900.0);
		assert_eq!(clip_height(2000.0), 900.0);
		assert_eq!(clip_height(3000.0), 1350.0);
		assert_eq!(clip_height(10000.0), 1800.0);
	}
}
