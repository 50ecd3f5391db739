use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chromiumoxide::element::Element;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rendered::{DriverLauncher, Locator, PageDriver};
use crate::LookupError;

/// Browser binary baked into the container image.
pub const CONTAINER_CHROME: &str = "/usr/bin/google-chrome";

const CONTAINER_ARGS: [&str; 3] = ["--no-sandbox", "--disable-dev-shm-usage", "--disable-gpu"];

const CHROME_CANDIDATES: [&str; 6] = [
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/snap/chromium/current/usr/lib/chromium-browser/chrome",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchProfile {
    /// Headless, sandbox-less launch of [`CONTAINER_CHROME`].
    pub container: bool,
    pub headless: bool,
    pub chrome_bin: Option<PathBuf>,
    pub window: (u32, u32),
}

impl Default for LaunchProfile {
    fn default() -> Self {
        Self {
            container: false,
            headless: false,
            chrome_bin: None,
            window: (1920, 1080),
        }
    }
}

impl LaunchProfile {
    pub fn container() -> Self {
        Self {
            container: true,
            headless: true,
            ..Self::default()
        }
    }

    pub fn launch_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if self.container {
            args.extend(CONTAINER_ARGS.iter().map(|a| a.to_string()));
        } else if running_as_root() {
            args.push("--no-sandbox".to_string());
        }
        args
    }

    pub fn executable(&self) -> Option<PathBuf> {
        if let Some(bin) = &self.chrome_bin {
            return Some(bin.clone());
        }
        if self.container {
            return Some(PathBuf::from(CONTAINER_CHROME));
        }
        CHROME_CANDIDATES
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
            .map(Path::to_path_buf)
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    profile: LaunchProfile,
}

impl ChromiumLauncher {
    pub fn new(profile: LaunchProfile) -> Self {
        Self { profile }
    }

    fn browser_config(&self) -> Result<BrowserConfig, LookupError> {
        let (width, height) = self.profile.window;
        let mut builder = BrowserConfig::builder().window_size(width, height);
        if let Some(bin) = self.profile.executable() {
            builder = builder.chrome_executable(bin);
        }
        if !self.profile.headless {
            builder = builder.with_head();
        }
        builder
            .args(self.profile.launch_args())
            .build()
            .map_err(|e| LookupError::session(format!("browser config: {e}")))
    }
}

#[async_trait]
impl DriverLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn PageDriver>, LookupError> {
        let config = self.browser_config()?;
        info!(
            container = self.profile.container,
            headless = self.profile.headless,
            "launching chromium"
        );
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| LookupError::session(format!("launching chromium: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler event error");
                }
            }
            debug!("chromium event loop exited");
        });

        match browser.new_page("about:blank").await {
            Ok(page) => Ok(Box::new(ChromiumDriver {
                browser,
                page,
                handler_task,
                closed: false,
            })),
            Err(err) => {
                if let Err(close_err) = browser.close().await {
                    warn!(error = %close_err, "closing chromium after failed page open");
                }
                handler_task.abort();
                Err(LookupError::session(format!("opening page: {err}")))
            }
        }
    }
}

/// In-page expression that is `true` when `locator` matches at least one node.
fn presence_script(locator: &Locator) -> String {
    match locator {
        Locator::Css(selector) => format!(
            "document.querySelector({}) !== null",
            serde_json::Value::from(selector.as_str())
        ),
        Locator::XPath(expression) => format!(
            "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue !== null",
            serde_json::Value::from(expression.as_str())
        ),
    }
}

struct ChromiumDriver {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    closed: bool,
}

impl ChromiumDriver {
    async fn find(&self, locator: &Locator) -> Result<Element, LookupError> {
        let found = match locator {
            Locator::Css(selector) => self.page.find_element(selector.as_str()).await,
            Locator::XPath(expression) => self.page.find_xpath(expression.as_str()).await,
        };
        found.map_err(|e| LookupError::automation(format!("{locator}: {e}")))
    }
}

#[async_trait]
impl PageDriver for ChromiumDriver {
    async fn goto(&mut self, url: &str) -> Result<(), LookupError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| LookupError::automation(format!("navigating to {url}: {e}")))?
            .wait_for_navigation()
            .await
            .map_err(|e| LookupError::automation(format!("waiting for {url}: {e}")))?;
        Ok(())
    }

    async fn exists(&mut self, locator: &Locator) -> Result<bool, LookupError> {
        self.page
            .evaluate(presence_script(locator))
            .await
            .map_err(|e| LookupError::automation(format!("probing {locator}: {e}")))?
            .into_value::<bool>()
            .map_err(|e| LookupError::automation(format!("probing {locator}: {e}")))
    }

    async fn type_and_submit(&mut self, locator: &Locator, text: &str) -> Result<(), LookupError> {
        let element = self.find(locator).await?;
        element
            .click()
            .await
            .map_err(|e| LookupError::automation(format!("focusing {locator}: {e}")))?;
        element
            .type_str(text)
            .await
            .map_err(|e| LookupError::automation(format!("typing into {locator}: {e}")))?;
        element
            .press_key("Enter")
            .await
            .map_err(|e| LookupError::automation(format!("submitting {locator}: {e}")))?;
        Ok(())
    }

    async fn click(&mut self, locator: &Locator) -> Result<(), LookupError> {
        let element = self.find(locator).await?;
        element
            .scroll_into_view()
            .await
            .map_err(|e| LookupError::automation(format!("scrolling to {locator}: {e}")))?;
        element
            .click()
            .await
            .map_err(|e| LookupError::automation(format!("clicking {locator}: {e}")))?;
        Ok(())
    }

    async fn html(&mut self) -> Result<String, LookupError> {
        self.page
            .content()
            .await
            .map_err(|e| LookupError::automation(format!("reading page content: {e}")))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "closing chromium");
        }
        if let Err(err) = self.browser.wait().await {
            debug!(error = %err, "waiting for chromium to exit");
        }
        self.handler_task.abort();
    }
}

impl Drop for ChromiumDriver {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_script_quotes_the_locator() {
        assert_eq!(
            presence_script(&Locator::css("input[placeholder='Filtrar por nome']")),
            r#"document.querySelector("input[placeholder='Filtrar por nome']") !== null"#
        );
        let xpath = presence_script(&Locator::xpath(r#"//button[contains(., "lojas")]"#));
        assert!(
            xpath.starts_with(r#"document.evaluate("//button[contains(., \"lojas\")]", document"#),
            "{xpath}"
        );
        assert!(xpath.ends_with(".singleNodeValue !== null"));
    }

    #[test]
    fn container_profile_runs_headless_without_sandbox() {
        let profile = LaunchProfile::container();
        assert!(profile.headless);
        assert_eq!(
            profile.launch_args(),
            vec!["--no-sandbox", "--disable-dev-shm-usage", "--disable-gpu"]
        );
        assert_eq!(profile.executable(), Some(PathBuf::from(CONTAINER_CHROME)));
        assert_eq!(profile.window, (1920, 1080));
    }

    #[test]
    fn explicit_binary_wins_over_discovery() {
        let profile = LaunchProfile {
            chrome_bin: Some(PathBuf::from("/opt/chrome/chrome")),
            ..LaunchProfile::container()
        };
        assert_eq!(profile.executable(), Some(PathBuf::from("/opt/chrome/chrome")));
    }

    #[test]
    fn desktop_profile_is_headed() {
        let profile = LaunchProfile::default();
        assert!(!profile.container);
        assert!(!profile.headless);
        assert!(!profile.launch_args().contains(&"--disable-gpu".to_string()));
    }
}
