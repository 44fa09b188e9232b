//! Browser Port (Driven Port)
//!
//! Opens the OAuth authorization URL for the user. The interactive flow
//! falls back to logging the URL when no browser can be launched.

/// Browser launch error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to open browser: {message}")]
pub struct BrowserError {
    /// Underlying failure.
    pub message: String,
}

/// Port for handing a URL to the user.
pub trait BrowserPort: Send + Sync {
    /// Open `url`.
    fn open(&self, url: &str) -> Result<(), BrowserError>;
}

/// Launches the platform's default browser.
#[derive(Debug, Clone, Default)]
pub struct SystemBrowser;

impl BrowserPort for SystemBrowser {
    fn open(&self, url: &str) -> Result<(), BrowserError> {
        webbrowser::open(url).map_err(|e| BrowserError {
            message: e.to_string(),
        })
    }
}

/// Does not open anything; the authenticator logs the URL instead.
#[derive(Debug, Clone, Default)]
pub struct HeadlessBrowser;

impl BrowserPort for HeadlessBrowser {
    fn open(&self, _url: &str) -> Result<(), BrowserError> {
        Err(BrowserError {
            message: "headless mode".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_browser_always_declines() {
        let err = HeadlessBrowser.open("https://example.com").unwrap_err();
        assert!(err.to_string().contains("headless"));
    }
}
