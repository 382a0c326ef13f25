//! Engine configuration and host-application callbacks.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use vigil_core::CategoryId;

use crate::ca::CaIdentity;

/// Decides whether traffic between a local port and a remote host may be
/// intercepted at all. Returning `false` makes the engine tunnel the
/// connection untouched.
pub type FirewallCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Classifies a response payload into a category id, `0` meaning
/// unclassified. Lets the host plug in content inspection beyond the rule
/// lists.
pub type ContentClassifier = Arc<dyn Fn(&[u8], &str) -> CategoryId + Send + Sync>;

/// Receives informational and warning messages for display to the user.
pub type MessageSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked for every blocked request with the category that blocked it and
/// the full request URL.
pub type BlockedRequestReporter = Arc<dyn Fn(CategoryId, &str) + Send + Sync>;

/// Invoked after element hiding with the number of elements removed from
/// the page at the given URL.
pub type BlockedElementsReporter = Arc<dyn Fn(u32, &str) + Send + Sync>;

/// Host-application callbacks. Every callback has a no-op default, so the
/// host wires up only the ones it cares about.
#[derive(Clone)]
pub struct EngineCallbacks {
    pub firewall_check: FirewallCheck,
    pub content_classifier: ContentClassifier,
    pub on_info: MessageSink,
    pub on_warning: MessageSink,
    pub on_error: MessageSink,
    pub on_request_blocked: BlockedRequestReporter,
    pub on_elements_blocked: BlockedElementsReporter,
}

impl Default for EngineCallbacks {
    fn default() -> Self {
        Self {
            firewall_check: Arc::new(|_| true),
            content_classifier: Arc::new(|_, _| 0),
            on_info: Arc::new(|_| {}),
            on_warning: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
            on_request_blocked: Arc::new(|_, _| {}),
            on_elements_blocked: Arc::new(|_, _| {}),
        }
    }
}

impl EngineCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the firewall check deciding which programs' traffic to
    /// intercept.
    pub fn with_firewall_check(
        mut self,
        check: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.firewall_check = Arc::new(check);
        self
    }

    /// Sets the response-content classifier.
    pub fn with_content_classifier(
        mut self,
        classify: impl Fn(&[u8], &str) -> CategoryId + Send + Sync + 'static,
    ) -> Self {
        self.content_classifier = Arc::new(classify);
        self
    }

    /// Sets the informational message sink.
    pub fn with_info_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_info = Arc::new(sink);
        self
    }

    /// Sets the warning message sink.
    pub fn with_warning_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_warning = Arc::new(sink);
        self
    }

    /// Sets the error message sink.
    pub fn with_error_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(sink);
        self
    }

    /// Sets the blocked-request reporter.
    pub fn with_request_blocked(
        mut self,
        report: impl Fn(CategoryId, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_request_blocked = Arc::new(report);
        self
    }

    /// Sets the blocked-elements reporter.
    pub fn with_elements_blocked(
        mut self,
        report: impl Fn(u32, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_elements_blocked = Arc::new(report);
        self
    }
}

impl fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCallbacks").finish_non_exhaustive()
    }
}

/// HTML served in place of a blocked page response.
pub const DEFAULT_BLOCKED_PAGE: &str = "<!DOCTYPE html>\n\
<html>\n\
<head><title>Blocked</title></head>\n\
<body>\n\
<h1>This page has been blocked.</h1>\n\
<p>The requested content matched an active filtering rule.</p>\n\
</body>\n\
</html>\n";

/// Engine configuration, built with chained `with_*` setters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Distinguished-name fields for the generated root CA.
    pub ca_identity: CaIdentity,
    /// Directory where the root CA certificate PEM is written.
    pub ca_dir: PathBuf,
    /// Optional CA bundle to verify upstream servers against instead of
    /// the platform roots.
    pub ca_bundle_path: Option<PathBuf>,
    /// HTML served for blocked pages.
    pub blocked_html_page: String,
    /// Requested HTTP listener port; `0` asks the OS to pick.
    pub http_port: u16,
    /// Requested HTTPS listener port; `0` asks the OS to pick.
    pub https_port: u16,
    /// Worker threads for the traffic pipeline; `0` means one per CPU.
    pub worker_threads: usize,
    /// Host-application callbacks.
    pub callbacks: EngineCallbacks,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ca_identity: CaIdentity::default(),
            ca_dir: std::env::temp_dir().join("vigil-ca"),
            ca_bundle_path: None,
            blocked_html_page: DEFAULT_BLOCKED_PAGE.to_string(),
            http_port: 0,
            https_port: 0,
            worker_threads: 0,
            callbacks: EngineCallbacks::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_identity(mut self, identity: CaIdentity) -> Self {
        self.ca_identity = identity;
        self
    }

    pub fn with_ca_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ca_dir = dir.into();
        self
    }

    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_bundle_path = Some(path.into());
        self
    }

    pub fn with_blocked_html_page(mut self, html: impl Into<String>) -> Self {
        self.blocked_html_page = html.into();
        self
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn with_https_port(mut self, port: u16) -> Self {
        self.https_port = port;
        self
    }

    pub fn with_worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    pub fn with_callbacks(mut self, callbacks: EngineCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable() {
        let config = EngineConfig::default();
        assert_eq!(config.http_port, 0);
        assert_eq!(config.https_port, 0);
        assert_eq!(config.worker_threads, 0);
        assert!(config.ca_bundle_path.is_none());
        assert!(config.blocked_html_page.contains("blocked"));
    }

    #[test]
    fn builder_setters_chain() {
        let config = EngineConfig::new()
            .with_http_port(8080)
            .with_https_port(8443)
            .with_worker_threads(4)
            .with_ca_dir("/tmp/ca")
            .with_blocked_html_page("<h1>no</h1>");
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.https_port, 8443);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.ca_dir, PathBuf::from("/tmp/ca"));
        assert_eq!(config.blocked_html_page, "<h1>no</h1>");
    }

    #[test]
    fn default_callbacks_are_permissive() {
        let callbacks = EngineCallbacks::default();
        assert!((callbacks.firewall_check)("browser.exe"));
        assert_eq!((callbacks.content_classifier)(b"payload", "text/html"), 0);
    }

    #[test]
    fn callback_setters_replace_defaults() {
        let callbacks = EngineCallbacks::new()
            .with_firewall_check(|name| name != "blocked.exe")
            .with_content_classifier(|_, _| 3);
        assert!(!(callbacks.firewall_check)("blocked.exe"));
        assert!((callbacks.firewall_check)("other.exe"));
        assert_eq!((callbacks.content_classifier)(b"", ""), 3);
    }
}
