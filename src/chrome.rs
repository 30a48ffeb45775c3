//! Chrome-backed [`BrowserSession`] implementation.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, Element, LaunchOptions, Tab};
use tracing::{debug, warn};

use crate::session::{BrowserSession, ClickOptions, SessionError, SessionResult};

const FIND_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const NAVIGATION_SETTLE_MS: u64 = 1_500;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Persistent Chrome session. Owned by one run; dropping it closes the
/// browser.
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
    download_dir: tempfile::TempDir,
}

impl ChromeSession {
    pub fn launch(headless: bool) -> SessionResult<Self> {
        let options = LaunchOptions {
            headless,
            sandbox: false,
            window_size: Some((1280, 720)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        let browser = Browser::new(options)
            .map_err(|e| SessionError::other(format!("browser launch failed: {e}")))?;
        let tab = browser
            .new_tab()
            .map_err(|e| SessionError::other(format!("tab open failed: {e}")))?;

        if let Err(e) = tab.set_user_agent(USER_AGENT, Some("ja-JP"), None) {
            warn!("could not set user agent: {e}");
        }

        let download_dir = tempfile::tempdir()
            .map_err(|e| SessionError::other(format!("download dir: {e}")))?;
        if let Err(e) = tab.call_method(Page::SetDownloadBehavior {
            behavior: Page::SetDownloadBehaviorBehaviorOption::Allow,
            download_path: Some(download_dir.path().to_string_lossy().into_owned()),
        }) {
            warn!("could not set download behavior: {e}");
        }

        Ok(Self {
            _browser: browser,
            tab,
            download_dir,
        })
    }

    /// All elements matching `selector`, polling until the deadline. CSS
    /// selectors go through the query engine; `text=` selectors become an
    /// XPath text match.
    fn locate_all(&self, selector: &str, timeout_ms: u64) -> SessionResult<Vec<Element<'_>>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let found = match selector.strip_prefix("text=") {
                Some(text) => self.tab.find_elements_by_xpath(&text_xpath(text)),
                None => self.tab.find_elements(selector),
            };
            if let Ok(elements) = found {
                if !elements.is_empty() {
                    return Ok(elements);
                }
            }
            if Instant::now() >= deadline {
                return Err(SessionError::timeout(format!(
                    "timed out waiting for selector {selector}"
                )));
            }
            std::thread::sleep(FIND_POLL_INTERVAL);
        }
    }

    fn locate_one(&self, selector: &str, timeout_ms: u64) -> SessionResult<Element<'_>> {
        let mut elements = self.locate_all(selector, timeout_ms)?;
        Ok(elements.remove(0))
    }

    fn human_delay(&self) {
        std::thread::sleep(Duration::from_millis(rand::random_range(500..1500)));
    }
}

impl BrowserSession for ChromeSession {
    fn navigate(&mut self, url: &str) -> SessionResult<()> {
        debug!(url, "navigating");
        self.tab
            .navigate_to(url)
            .and_then(|t| t.wait_until_navigated())
            .map_err(|e| SessionError::other(format!("navigation failed: {e}")))?;
        self.tab
            .wait_for_element("body")
            .map_err(|e| SessionError::classify(e.to_string()))?;
        std::thread::sleep(Duration::from_millis(NAVIGATION_SETTLE_MS));
        Ok(())
    }

    fn current_content(&mut self) -> SessionResult<String> {
        self.tab
            .get_content()
            .map_err(|e| SessionError::other(e.to_string()))
    }

    fn screenshot(&mut self, path: &Path) -> SessionResult<()> {
        let bytes = self
            .tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(|e| SessionError::other(e.to_string()))?;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, bytes).map_err(|e| SessionError::other(e.to_string()))
    }

    fn screenshot_base64(&mut self) -> Option<String> {
        let bytes = self
            .tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Jpeg, Some(70), None, true)
            .ok()?;
        Some(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    fn click(&mut self, selector: &str, opts: ClickOptions) -> SessionResult<()> {
        let elements = self.locate_all(selector, opts.timeout_ms)?;
        let element = if opts.last {
            elements.last()
        } else {
            elements.first()
        };
        // locate_all never returns an empty list.
        let element = element.ok_or_else(|| SessionError::other("no element located"))?;

        if opts.force {
            element
                .call_js_fn("function() { this.click(); }", vec![], false)
                .map(|_| ())
                .map_err(|e| SessionError::classify(e.to_string()))?;
        } else {
            element
                .click()
                .map(|_| ())
                .map_err(|e| SessionError::classify(e.to_string()))?;
        }
        if !opts.no_wait_after {
            self.human_delay();
        }
        Ok(())
    }

    fn fill(&mut self, selector: &str, value: &str) -> SessionResult<()> {
        let element = self.locate_one(selector, ClickOptions::default().timeout_ms)?;
        element
            .click()
            .map_err(|e| SessionError::classify(e.to_string()))?;
        element
            .call_js_fn("function() { this.value = ''; }", vec![], false)
            .map_err(|e| SessionError::other(e.to_string()))?;
        self.tab
            .type_str(value)
            .map(|_| ())
            .map_err(|e| SessionError::other(e.to_string()))
    }

    fn hover(&mut self, selector: &str) -> SessionResult<()> {
        let element = self.locate_one(selector, ClickOptions::default().timeout_ms)?;
        element
            .move_mouse_over()
            .map(|_| ())
            .map_err(|e| SessionError::classify(e.to_string()))
    }

    fn press_key(&mut self, key: &str) -> SessionResult<()> {
        self.tab
            .press_key(key)
            .map(|_| ())
            .map_err(|e| SessionError::other(e.to_string()))?;
        self.human_delay();
        Ok(())
    }

    fn scroll_by(&mut self, pixels: i64) -> SessionResult<()> {
        self.tab
            .evaluate(&format!("window.scrollBy(0, {pixels})"), false)
            .map(|_| ())
            .map_err(|e| SessionError::other(e.to_string()))
    }

    fn wait(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn select_option(&mut self, selector: &str, value: &str) -> SessionResult<()> {
        let element = self.locate_one(selector, ClickOptions::default().timeout_ms)?;
        element
            .call_js_fn(
                "function(value) {\
                     this.value = value;\
                     this.dispatchEvent(new Event('input', { bubbles: true }));\
                     this.dispatchEvent(new Event('change', { bubbles: true }));\
                 }",
                vec![serde_json::json!(value)],
                false,
            )
            .map(|_| ())
            .map_err(|e| SessionError::other(e.to_string()))
    }

    fn outer_html_all(&mut self, selector: &str) -> SessionResult<Vec<String>> {
        let elements = self.locate_all(selector, ClickOptions::default().timeout_ms)?;
        elements
            .iter()
            .map(|e| e.get_content().map_err(|e| SessionError::other(e.to_string())))
            .collect()
    }

    fn download(&mut self, selector: &str, dest: &Path) -> SessionResult<PathBuf> {
        let before: Vec<PathBuf> = list_files(self.download_dir.path());
        self.click(selector, ClickOptions::default())?;

        let deadline = Instant::now() + DOWNLOAD_TIMEOUT;
        let downloaded = loop {
            let new_file = list_files(self.download_dir.path())
                .into_iter()
                .find(|p| !before.contains(p) && !is_partial_download(p));
            if let Some(path) = new_file {
                if stable_size(&path) {
                    break path;
                }
            }
            if Instant::now() >= deadline {
                return Err(SessionError::timeout("timed out waiting for download"));
            }
            std::thread::sleep(FIND_POLL_INTERVAL);
        };

        if let Some(parent) = dest.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if std::fs::rename(&downloaded, dest).is_err() {
            std::fs::copy(&downloaded, dest)
                .map_err(|e| SessionError::other(format!("store download: {e}")))?;
            let _ = std::fs::remove_file(&downloaded);
        }
        debug!(path = %dest.display(), "download complete");
        Ok(dest.to_path_buf())
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect()
        })
        .unwrap_or_default()
}

fn is_partial_download(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("crdownload") | Some("tmp")
    )
}

fn stable_size(path: &Path) -> bool {
    let size = |p: &Path| std::fs::metadata(p).map(|m| m.len()).ok();
    let first = size(path);
    std::thread::sleep(Duration::from_millis(500));
    first.is_some() && first == size(path)
}

/// XPath for a visible-text match, with XPath string-literal escaping.
fn text_xpath(text: &str) -> String {
    format!(
        "//*[text()[contains(normalize-space(.), {})]]",
        xpath_literal(text)
    )
}

fn xpath_literal(s: &str) -> String {
    if !s.contains('\'') {
        format!("'{s}'")
    } else if !s.contains('"') {
        format!("\"{s}\"")
    } else {
        let parts: Vec<String> = s.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}
