//! Headless browser session + rendered-page snapshot storage for SHELF.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use chromiumoxide::browser::{Browser, BrowserConfig as CdpBrowserConfig};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-browser";

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub window_size: (u32, u32),
    /// Upper bound for the grid-visibility wait on each page.
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    /// Per-command DevTools timeout (navigation, script evaluation, content).
    pub request_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            window_size: (1366, 900),
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl BrowserConfig {
    fn to_cdp(&self) -> Result<CdpBrowserConfig, BrowserError> {
        let mut builder = CdpBrowserConfig::builder()
            .window_size(self.window_size.0, self.window_size.1)
            .request_timeout(self.request_timeout);
        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }
        builder.build().map_err(BrowserError::Config)
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("invalid browser config: {0}")]
    Config(String),
    #[error("launching browser: {0}")]
    Launch(#[source] CdpError),
    #[error("navigating to {url}: {source}")]
    Navigation {
        url: String,
        #[source]
        source: CdpError,
    },
    #[error("`{selector}` never became present: {source}")]
    NotReady {
        selector: String,
        #[source]
        source: CdpError,
    },
    #[error("`{selector}` not visible after {waited:?}")]
    NotVisible { selector: String, waited: Duration },
    #[error("evaluating page script: {0}")]
    Script(#[source] CdpError),
    #[error("decoding page script result: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("closing browser: {0}")]
    Close(#[source] CdpError),
}

/// DOM state captured once a listing page has rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub requested_url: String,
    pub final_url: String,
    pub html: String,
    pub rendered_at: DateTime<Utc>,
}

/// One browser process plus the single tab every page navigation reuses.
///
/// Owned by the caller for the whole run. `close` shuts the process down
/// cleanly; dropping the session without closing still stops the event
/// handler and lets chromiumoxide kill the child process.
#[derive(Debug)]
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    config: BrowserConfig,
}

impl BrowserSession {
    pub async fn launch(config: BrowserConfig) -> Result<Self, BrowserError> {
        let cdp_config = config.to_cdp()?;
        let (browser, mut handler) = Browser::launch(cdp_config)
            .await
            .map_err(BrowserError::Launch)?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!("browser handler event error: {err}");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                handler_task.abort();
                return Err(BrowserError::Launch(err));
            }
        };

        info!(headless = config.headless, "browser session opened");
        Ok(Self {
            browser,
            page,
            handler_task,
            config,
        })
    }

    /// Navigate, wait for `ready_selector` to exist and `visible_selector` to
    /// become visible, then capture the rendered document.
    pub async fn render_listing(
        &self,
        url: &str,
        ready_selector: &str,
        visible_selector: &str,
    ) -> Result<RenderedPage, BrowserError> {
        let span = info_span!("render_listing", url);
        async {
            self.page
                .goto(url)
                .await
                .map_err(|source| BrowserError::Navigation {
                    url: url.to_string(),
                    source,
                })?;

            self.page
                .find_element(ready_selector)
                .await
                .map_err(|source| BrowserError::NotReady {
                    selector: ready_selector.to_string(),
                    source,
                })?;

            self.wait_visible(visible_selector).await?;

            let html = self.page.content().await.map_err(BrowserError::Script)?;
            let final_url = self
                .page
                .url()
                .await
                .map_err(BrowserError::Script)?
                .unwrap_or_else(|| url.to_string());

            debug!(bytes = html.len(), %final_url, "listing rendered");
            Ok(RenderedPage {
                requested_url: url.to_string(),
                final_url,
                html,
                rendered_at: Utc::now(),
            })
        }
        .instrument(span)
        .await
    }

    async fn wait_visible(&self, selector: &str) -> Result<(), BrowserError> {
        let script = visibility_probe_script(selector)?;
        let started = Instant::now();
        let deadline = started + self.config.wait_timeout;

        loop {
            let visible = self
                .page
                .evaluate(script.as_str())
                .await
                .map_err(BrowserError::Script)?
                .into_value::<bool>()?;
            if visible {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::NotVisible {
                    selector: selector.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    pub async fn close(mut self) -> Result<(), BrowserError> {
        self.browser.close().await.map_err(BrowserError::Close)?;
        if let Err(err) = self.browser.wait().await {
            warn!("waiting for browser process to exit: {err}");
        }
        self.handler_task.abort();
        info!("browser session closed");
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

/// JS expression that is `true` once the first match of `selector` is laid
/// out and not hidden.
pub fn visibility_probe_script(selector: &str) -> Result<String, serde_json::Error> {
    let selector_js = serde_json::to_string(selector)?;
    Ok(format!(
        r#"(() => {{
    const el = document.querySelector({selector_js});
    if (!el) return false;
    const style = window.getComputedStyle(el);
    if (style.display === 'none' || style.visibility === 'hidden') return false;
    const rect = el.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
}})()"#
    ))
}

/// Manifest file written next to a run's page snapshots, one JSON object per line.
pub const MANIFEST_FILE: &str = "pages.jsonl";

/// One manifest line: what a page rendered to and how many records it gave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub page: u32,
    pub requested_url: String,
    pub final_url: String,
    pub rendered_at: DateTime<Utc>,
    pub html_file: String,
    pub sha256: String,
    pub bytes: usize,
    pub records: usize,
}

/// Rendered listings of a single run, kept for inspecting why it stopped.
///
/// Every page of the run lands in `<root>/<start stamp>-<run id>/` as
/// `page-NNNN.html`, with one `pages.jsonl` line per page. Two pages whose
/// HTML hashes alike rendered the same listing.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    run_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::for_run(root, Uuid::new_v4(), Utc::now())
    }

    pub fn for_run(root: impl Into<PathBuf>, run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        let dir = format!("{}-{}", started_at.format("%Y%m%d_%H%M%S"), run_id.simple());
        Self {
            run_dir: root.into().join(dir),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub async fn record_page(
        &self,
        page: u32,
        rendered: &RenderedPage,
        records: usize,
    ) -> anyhow::Result<PageSnapshot> {
        fs::create_dir_all(&self.run_dir)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.run_dir.display()))?;

        let html_file = format!("page-{page:04}.html");
        let html_path = self.run_dir.join(&html_file);
        fs::write(&html_path, rendered.html.as_bytes())
            .await
            .with_context(|| format!("writing {}", html_path.display()))?;

        let snapshot = PageSnapshot {
            page,
            requested_url: rendered.requested_url.clone(),
            final_url: rendered.final_url.clone(),
            rendered_at: rendered.rendered_at,
            html_file,
            sha256: sha256_hex(rendered.html.as_bytes()),
            bytes: rendered.html.len(),
            records,
        };

        let mut line = serde_json::to_string(&snapshot).context("encoding manifest entry")?;
        line.push('\n');
        let manifest = self.run_dir.join(MANIFEST_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&manifest)
            .await
            .with_context(|| format!("opening {}", manifest.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", manifest.display()))?;
        file.flush().await?;

        Ok(snapshot)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
