//! Headless-Chromium render engine.
//!
//! Drives a shared browser process over CDP; every render call gets its
//! own fresh page with a desktop profile and Brazilian locale. The page is
//! closed on all exit paths, so no state leaks between requests.

use crate::{clip_height, RenderError, RenderInterface, RenderTimeouts, RenderedPage};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetTimezoneOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use quoter_types::{ConfigSchema, Field, FieldType, Schema, ValidationError};
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
	(KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const VIEWPORT_WIDTH: u32 = 1366;
const VIEWPORT_HEIGHT: u32 = 1229;

/// Body smaller than this after overlay removal reads as a blocked shell.
const MIN_PLAUSIBLE_BODY_BYTES: usize = 512;

/// Markers of anti-bot interstitials.
const BLOCK_MARKERS: &[&str] = &[
	"captcha",
	"access denied",
	"acesso negado",
	"403 forbidden",
	"attention required",
	"verifique que você não é um robô",
];

/// Chromium-backed render engine.
pub struct ChromiumRender {
	executable: Option<String>,
	timeouts: RenderTimeouts,
	browser: OnceCell<Browser>,
}

impl ChromiumRender {
	/// Creates an engine; the browser launches lazily on first render.
	pub fn new(executable: Option<String>, timeouts: RenderTimeouts) -> Self {
		Self {
			executable,
			timeouts,
			browser: OnceCell::new(),
		}
	}

	async fn browser(&self) -> Result<&Browser, RenderError> {
		self.browser
			.get_or_try_init(|| async {
				let mut builder = BrowserConfig::builder()
					.window_size(VIEWPORT_WIDTH, VIEWPORT_HEIGHT)
					.no_sandbox()
					.args(vec![
						"--disable-blink-features=AutomationControlled",
						"--disable-dev-shm-usage",
						"--disable-gpu",
					]);
				if let Some(path) = &self.executable {
					builder = builder.chrome_executable(path);
				}
				let config = builder
					.build()
					.map_err(RenderError::Configuration)?;

				let (browser, mut handler) = Browser::launch(config)
					.await
					.map_err(|e| RenderError::Browser(e.to_string()))?;

				// Drive the CDP connection for the lifetime of the process
				tokio::spawn(async move {
					while let Some(event) = handler.next().await {
						if event.is_err() {
							break;
						}
					}
				});

				tracing::info!("Launched headless browser");
				Ok(browser)
			})
			.await
	}

	/// Navigates with the two-stage timeout policy.
	async fn navigate(&self, page: &Page, url: &str) -> Result<(), RenderError> {
		let first = tokio::time::timeout(self.timeouts.first_try, async {
			page.goto(url).await?;
			page.wait_for_navigation().await?;
			Ok::<_, chromiumoxide::error::CdpError>(())
		})
		.await;

		match first {
			Ok(Ok(())) => return Ok(()),
			Ok(Err(e)) => {
				tracing::warn!(url, error = %e, "First load attempt failed, retrying");
			},
			Err(_) => {
				tracing::warn!(url, "First load attempt timed out, retrying");
			},
		}

		match tokio::time::timeout(self.timeouts.second_try, async {
			page.goto(url).await?;
			page.wait_for_navigation().await?;
			Ok::<_, chromiumoxide::error::CdpError>(())
		})
		.await
		{
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(RenderError::Navigation(e.to_string())),
			Err(_) => Err(RenderError::LoadTimeout),
		}
	}

	/// Multi-pass popup dismissal: accept affordances, close affordances,
	/// then JS-level overlay removal.
	async fn close_popups(&self, page: &Page) -> Result<(), RenderError> {
		for _ in 0..3 {
			let closed_any = self
				.eval_bool(page, JS_ACCEPT_PASS)
				.await?
				| self.eval_bool(page, JS_CLOSE_PASS).await?;
			if !closed_any {
				break;
			}
			tokio::time::sleep(Duration::from_millis(500)).await;
		}

		self.eval_bool(page, JS_REMOVE_OVERLAYS).await?;
		tokio::time::sleep(Duration::from_millis(300)).await;
		Ok(())
	}

	async fn eval_bool(&self, page: &Page, js: &str) -> Result<bool, RenderError> {
		let result = page
			.evaluate(js)
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?;
		Ok(result.into_value::<bool>().unwrap_or(false))
	}

	async fn snapshot(&self, page: &Page, fallback_url: &str) -> Result<RenderedPage, RenderError> {
		let html = page
			.content()
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?;
		let title = page
			.get_title()
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?;
		let body_text = page
			.evaluate("document.body ? document.body.innerText : ''")
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?
			.into_value::<String>()
			.unwrap_or_default();
		let url = page
			.url()
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?
			.unwrap_or_else(|| fallback_url.to_string());

		Ok(RenderedPage {
			url,
			title,
			html,
			body_text,
		})
	}

	async fn render_on_page(
		&self,
		page: &Page,
		url: &str,
		screenshot_path: &Path,
	) -> Result<RenderedPage, RenderError> {
		let ua = SetUserAgentOverrideParams::builder()
			.user_agent(USER_AGENT)
			.accept_language("pt-BR,pt;q=0.9")
			.build()
			.map_err(RenderError::Configuration)?;
		page.execute(ua)
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?;
		page.execute(SetTimezoneOverrideParams::new("America/Sao_Paulo"))
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?;

		self.navigate(page, url).await?;

		// Let lazy resources land before poking at the DOM
		tokio::time::sleep(self.timeouts.settle).await;

		self.close_popups(page).await?;

		// Some storefronts auto-scroll to other sections after load
		page.evaluate("window.scrollTo(0, 0)")
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?;
		tokio::time::sleep(Duration::from_millis(500)).await;

		let snapshot = self.snapshot(page, url).await?;
		if looks_blocked(&snapshot.body_text) {
			return Err(RenderError::BlockedBySite);
		}

		let page_height = page
			.evaluate("document.body.scrollHeight")
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?
			.into_value::<f64>()
			.unwrap_or(0.0);

		let params = ScreenshotParams::builder()
			.format(CaptureScreenshotFormat::Png)
			.clip(Viewport {
				x: 0.0,
				y: 0.0,
				width: VIEWPORT_WIDTH as f64,
				height: clip_height(page_height),
				scale: 1.0,
			})
			.build();
		page.save_screenshot(params, screenshot_path)
			.await
			.map_err(|e| RenderError::Screenshot(e.to_string()))?;

		Ok(snapshot)
	}
}

/// Anti-bot interstitial heuristic over the visible body text.
fn looks_blocked(body_text: &str) -> bool {
	if body_text.trim().len() < MIN_PLAUSIBLE_BODY_BYTES {
		return true;
	}
	let lower = body_text.to_lowercase();
	BLOCK_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[async_trait]
impl RenderInterface for ChromiumRender {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(ChromiumSchema)
	}

	async fn render(
		&self,
		url: &str,
		screenshot_path: &Path,
	) -> Result<RenderedPage, RenderError> {
		let browser = self.browser().await?;
		let page = browser
			.new_page("about:blank")
			.await
			.map_err(|e| RenderError::Browser(e.to_string()))?;

		let result = self.render_on_page(&page, url, screenshot_path).await;

		// Close on every exit path; page state never crosses requests
		if let Err(e) = page.close().await {
			tracing::debug!(error = %e, "Failed to close page");
		}

		result
	}
}

/// Accept-affordance pass: cookie/LGPD consent and similar prompts.
const JS_ACCEPT_PASS: &str = r#"
(() => {
	const texts = [
		'aceitar', 'aceito', 'aceitar todos', 'aceitar tudo', 'concordo',
		'concordar', 'entendi', 'entendido', 'prosseguir', 'continuar', 'ok',
		'accept', 'accept all', 'i agree', 'agree', 'got it', 'allow', 'allow all',
	];
	let clicked = false;
	const visible = (el) => {
		const style = window.getComputedStyle(el);
		return style.display !== 'none' && style.visibility !== 'hidden' && el.offsetParent !== null;
	};
	for (const el of document.querySelectorAll('button, a, [role="button"]')) {
		const label = (el.innerText || '').trim().toLowerCase();
		if (!label || label.length > 40) continue;
		if (texts.includes(label) && visible(el)) {
			try { el.click(); clicked = true; } catch (e) {}
		}
	}
	const selectors = [
		'[id*="onetrust"] button', '[id*="cookie"] button',
		'[class*="cookie"] button', '[class*="consent"] button',
		'[class*="lgpd"] button', '[class*="LGPD"] button',
		'#accept-cookie', '.accept-cookie', '.cookie-accept',
		'#lgpd-accept', '.lgpd-accept', '[data-testid*="accept"]',
	];
	for (const selector of selectors) {
		for (const el of document.querySelectorAll(selector)) {
			if (visible(el)) {
				try { el.click(); clicked = true; } catch (e) {}
			}
		}
	}
	return clicked;
})()
"#;

/// Close-affordance pass: dismiss buttons, x icons, "not now" links.
const JS_CLOSE_PASS: &str = r#"
(() => {
	let clicked = false;
	const visible = (el) => {
		const style = window.getComputedStyle(el);
		return style.display !== 'none' && style.visibility !== 'hidden' && el.offsetParent !== null;
	};
	const selectors = [
		'.modal-close', '.btn-close', '.close-button', '.close-btn',
		'.popup-close', '.overlay-close', '.close-modal', '.fechar',
		'[class*="close-icon"]', '[class*="closeIcon"]', '[class*="icon-close"]',
		'[aria-label="close"]', '[aria-label="Close"]',
		'[aria-label="fechar"]', '[aria-label="Fechar"]', '[aria-label="Dismiss"]',
		'[title="Fechar"]', '[title="Close"]',
		'[data-dismiss="modal"]', '[data-close]', '[data-action="close"]',
		'button[class*="close"]', 'a[class*="close"]',
		'[class*="newsletter"] [class*="close"]',
		'[class*="popup"] [class*="close"]', '[class*="modal"] [class*="close"]',
		'.vtex-modal__close', '[class*="vtex"] [class*="close"]',
	];
	for (const selector of selectors) {
		const matches = document.querySelectorAll(selector);
		for (const el of Array.from(matches).slice(0, 5)) {
			if (visible(el)) {
				try { el.click(); clicked = true; } catch (e) {}
			}
		}
	}
	const closeTexts = ['×', '✕', 'x', 'fechar', 'não, obrigado', 'agora não', 'não quero'];
	for (const el of document.querySelectorAll('button, a')) {
		const label = (el.innerText || '').trim().toLowerCase();
		if (closeTexts.includes(label) && visible(el)) {
			try { el.click(); clicked = true; } catch (e) {}
		}
	}
	return clicked;
})()
"#;

/// Last resort: hide fixed/absolute overlays covering the viewport and
/// restore body scroll.
const JS_REMOVE_OVERLAYS: &str = r#"
(() => {
	const hideSelectors = [
		'.modal-backdrop', '.overlay', '.modal-overlay', '.popup-overlay',
		'[class*="backdrop"]', '[class*="cookie-banner"]', '[class*="cookie-notice"]',
		'[class*="cookie-consent"]', '[class*="lgpd"]', '[id*="cookie"]',
		'[id*="onetrust"]', '[class*="newsletter-popup"]', '[class*="promo-popup"]',
		'[class*="exit-intent"]', '[class*="lightbox"]',
	];
	for (const selector of hideSelectors) {
		try {
			document.querySelectorAll(selector).forEach((el) => {
				el.style.display = 'none';
			});
		} catch (e) {}
	}
	const mountIds = ['root', 'app', '__next'];
	document.querySelectorAll('*').forEach((el) => {
		try {
			const style = window.getComputedStyle(el);
			const zIndex = parseInt(style.zIndex) || 0;
			const fixedOrAbs = style.position === 'fixed' || style.position === 'absolute';
			const coversScreen = el.offsetWidth > window.innerWidth * 0.5 &&
				el.offsetHeight > window.innerHeight * 0.3;
			if (fixedOrAbs && zIndex > 100 && coversScreen) {
				const isMain = ['MAIN', 'HEADER', 'NAV'].includes(el.tagName) ||
					mountIds.includes(el.id);
				if (!isMain) {
					el.style.display = 'none';
				}
			}
		} catch (e) {}
	});
	document.body.style.overflow = 'auto';
	document.documentElement.style.overflow = 'auto';
	document.body.classList.remove('modal-open', 'no-scroll', 'overflow-hidden');
	document.body.style.paddingRight = '0';
	return true;
})()
"#;

/// Configuration schema for the Chromium engine.
pub struct ChromiumSchema;

impl ChromiumSchema {
	/// Static validation method for use before instance creation
	pub fn validate_config(config: &toml::Value) -> Result<(), ValidationError> {
		let instance = Self;
		instance.validate(config)
	}
}

impl ConfigSchema for ChromiumSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![
				Field::new("executable", FieldType::String),
				Field::new(
					"first_try_timeout_secs",
					FieldType::Integer {
						min: Some(1),
						max: Some(300),
					},
				),
				Field::new(
					"second_try_timeout_secs",
					FieldType::Integer {
						min: Some(1),
						max: Some(300),
					},
				),
				Field::new(
					"settle_delay_ms",
					FieldType::Integer {
						min: Some(0),
						max: Some(60_000),
					},
				),
			],
		);
		schema.validate(config)
	}
}

/// Factory function to create a Chromium engine from configuration.
///
/// Configuration parameters:
/// - `executable`: Chrome/Chromium binary path (default: auto-detect)
/// - `first_try_timeout_secs`: First navigation timeout (default: 30)
/// - `second_try_timeout_secs`: Retry navigation timeout (default: 45)
/// - `settle_delay_ms`: Post-load settle delay (default: 3000)
pub fn create_render(config: &toml::Value) -> Result<Box<dyn RenderInterface>, RenderError> {
	ChromiumSchema::validate_config(config)
		.map_err(|e| RenderError::Configuration(format!("Invalid configuration: {}", e)))?;

	let executable = config
		.get("executable")
		.and_then(|v| v.as_str())
		.map(|s| s.to_string());
	let defaults = RenderTimeouts::default();
	let timeouts = RenderTimeouts {
		first_try: config
			.get("first_try_timeout_secs")
			.and_then(|v| v.as_integer())
			.map(|v| Duration::from_secs(v as u64))
			.unwrap_or(defaults.first_try),
		second_try: config
			.get("second_try_timeout_secs")
			.and_then(|v| v.as_integer())
			.map(|v| Duration::from_secs(v as u64))
			.unwrap_or(defaults.second_try),
		settle: config
			.get("settle_delay_ms")
			.and_then(|v| v.as_integer())
			.map(|v| Duration::from_millis(v as u64))
			.unwrap_or(defaults.settle),
	};

	Ok(Box::new(ChromiumRender::new(executable, timeouts)))
}

/// Registry for the Chromium render implementation.
pub struct Registry;

impl quoter_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "chromium";
	type Factory = crate::RenderFactory;

	fn factory() -> Self::Factory {
		create_render
	}
}

impl crate::RenderEngineRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn blocked_heuristic() {
		assert!(looks_blocked("short page"));
		let captcha = format!("{} please solve this CAPTCHA to continue", "x".repeat(600));
		assert!(looks_blocked(&captcha));
		let normal = "produto em oferta ".repeat(100);
		assert!(!looks_blocked(&normal));
	}
}
