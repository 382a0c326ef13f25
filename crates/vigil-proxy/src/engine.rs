//! The engine controller: lifecycle, options, list loading, and the
//! filtering query surface the traffic pipeline calls into.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use vigil_core::{
    Category, CategoryId, DecisionEngine, ElementReport, EngineOption, LoadOutcome, RequestVerdict,
    ResourceKind, RuleIndex, TriggerMatch, UNFILTERED_CATEGORY,
};

use crate::ca::CertificateStore;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::trust::TrustStore;

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Constructed, not yet started.
    Created = 0,
    /// Started and accepting filtering queries.
    Running = 1,
    /// Stopped; a stopped engine can be started again.
    Stopped = 2,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Created,
        }
    }
}

/// The filtering engine controller.
///
/// Owns the certificate store, the rule index, and the runtime options,
/// and exposes everything the embedding application and the traffic
/// pipeline need: lifecycle control, rule and trigger loading, option and
/// category toggles, and block/hide/trigger queries.
///
/// All methods take `&self`; the engine is designed to sit behind an
/// `Arc` shared between the control thread and pipeline workers.
pub struct Engine {
    config: EngineConfig,
    certs: CertificateStore,
    index: Arc<RuleIndex>,
    decisions: DecisionEngine,
    state: AtomicU8,
    options: [AtomicBool; 3],
    http_port: AtomicU16,
    https_port: AtomicU16,
}

impl Engine {
    /// Builds an engine from `config`, generating the root CA immediately
    /// so [`Engine::root_ca_pem`] works before [`Engine::start`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        let certs = CertificateStore::new(config.ca_identity.clone(), &config.ca_dir)?;
        Ok(Self::assemble(config, certs))
    }

    /// Like [`Engine::new`] with a caller-supplied trust capability.
    pub fn with_trust_store(config: EngineConfig, trust: Box<dyn TrustStore>) -> Result<Self> {
        let certs =
            CertificateStore::with_trust_store(config.ca_identity.clone(), &config.ca_dir, trust)?;
        Ok(Self::assemble(config, certs))
    }

    fn assemble(config: EngineConfig, certs: CertificateStore) -> Self {
        let index = Arc::new(RuleIndex::new());
        let decisions = DecisionEngine::new(Arc::clone(&index));
        Self {
            config,
            certs,
            index,
            decisions,
            state: AtomicU8::new(EngineState::Created as u8),
            // TLS interception, element hiding, text triggers all on.
            options: [
                AtomicBool::new(true),
                AtomicBool::new(true),
                AtomicBool::new(true),
            ],
            http_port: AtomicU16::new(0),
            https_port: AtomicU16::new(0),
        }
    }

    // ==================== Lifecycle ====================

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the engine is running.
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Starts the engine. Idempotent: starting a running engine is a
    /// no-op.
    ///
    /// When TLS interception is enabled this also installs the root CA
    /// into the OS trust store. A trust failure is reported through the
    /// warning sink but does not prevent startup; interception keeps
    /// working for clients that trust the root out of band.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        if let Some(bundle) = &self.config.ca_bundle_path {
            if !bundle.exists() {
                tracing::warn!(path = %bundle.display(), "configured CA bundle does not exist");
                (self.config.callbacks.on_warning)(&format!(
                    "CA bundle not found at {}",
                    bundle.display()
                ));
            }
        }

        if self.option(EngineOption::TlsInterception) {
            if let Err(err) = self.certs.establish_os_trust() {
                tracing::warn!(%err, "OS trust installation failed, continuing without it");
                (self.config.callbacks.on_warning)(&format!(
                    "could not install root CA into the OS trust store: {err}"
                ));
            }
        }

        self.state.store(EngineState::Running as u8, Ordering::Release);
        tracing::info!("engine started");
        (self.config.callbacks.on_info)("filtering engine started");
        Ok(())
    }

    /// Stops the engine. Idempotent. Loaded rules and issued certificates
    /// survive a stop; a subsequent [`Engine::start`] resumes with them.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.state.store(EngineState::Stopped as u8, Ordering::Release);
        self.http_port.store(0, Ordering::Release);
        self.https_port.store(0, Ordering::Release);
        tracing::info!("engine stopped");
        (self.config.callbacks.on_info)("filtering engine stopped");
    }

    // ==================== Options and categories ====================

    /// Reads a runtime option.
    pub fn option(&self, option: EngineOption) -> bool {
        self.options[option as usize].load(Ordering::Acquire)
    }

    /// Sets a runtime option. Takes effect for subsequent queries.
    pub fn set_option(&self, option: EngineOption, enabled: bool) {
        self.options[option as usize].store(enabled, Ordering::Release);
        tracing::debug!(option = option.as_str(), enabled, "option changed");
    }

    /// Reads an option by numeric id; unknown ids read as disabled.
    pub fn option_by_id(&self, id: u32) -> bool {
        EngineOption::from_id(id).map_or(false, |option| self.option(option))
    }

    /// Sets an option by numeric id; unknown ids are ignored.
    pub fn set_option_by_id(&self, id: u32, enabled: bool) {
        if let Some(option) = EngineOption::from_id(id) {
            self.set_option(option, enabled);
        } else {
            tracing::debug!(id, "unknown option id ignored");
        }
    }

    /// Whether a category is enabled. The unfiltered category always
    /// reads as enabled.
    pub fn category(&self, category: CategoryId) -> bool {
        self.index.is_enabled(category)
    }

    /// Enables or disables a category. The unfiltered category cannot be
    /// toggled; such calls are ignored.
    pub fn set_category(&self, category: CategoryId, enabled: bool) {
        match Category::new(category) {
            Some(category) => self.index.set_enabled(category, enabled),
            None => {
                tracing::debug!(
                    category = UNFILTERED_CATEGORY,
                    "attempt to toggle the unfiltered category ignored"
                );
            }
        }
    }

    // ==================== List loading ====================

    /// Loads ad-block rules from `text` into a category. Malformed lines
    /// are counted as failed and the rest load.
    pub fn load_list_from_string(
        &self,
        text: &str,
        category: CategoryId,
        flush_existing: bool,
    ) -> LoadOutcome {
        // The index logs the load itself.
        self.index.load_rules(text, category, flush_existing)
    }

    /// Loads ad-block rules from a file on disk.
    pub fn load_list_from_file(
        &self,
        path: impl AsRef<Path>,
        category: CategoryId,
        flush_existing: bool,
    ) -> Result<LoadOutcome> {
        let text = self.read_list_file(path.as_ref())?;
        Ok(self.load_list_from_string(&text, category, flush_existing))
    }

    /// Loads plain-text triggers from `text`, one per line. Returns the
    /// number loaded.
    pub fn load_text_triggers_from_string(
        &self,
        text: &str,
        category: CategoryId,
        flush_existing: bool,
    ) -> u32 {
        self.index.load_text_triggers(text, category, flush_existing)
    }

    /// Loads plain-text triggers from a file on disk.
    pub fn load_text_triggers_from_file(
        &self,
        path: impl AsRef<Path>,
        category: CategoryId,
        flush_existing: bool,
    ) -> Result<u32> {
        let text = self.read_list_file(path.as_ref())?;
        Ok(self.load_text_triggers_from_string(&text, category, flush_existing))
    }

    fn read_list_file(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|err| {
            (self.config.callbacks.on_error)(&format!(
                "failed to read list file {}: {err}",
                path.display()
            ));
            EngineError::Io(err)
        })
    }

    /// Discards all rules in a category. The category's enabled flag is
    /// untouched.
    pub fn unload_rules(&self, category: CategoryId) {
        self.index.unload_category(category);
    }

    /// Discards all text triggers in a category.
    pub fn unload_text_triggers(&self, category: CategoryId) {
        self.index.unload_text_triggers(category);
    }

    // ==================== Filtering queries ====================

    /// Decides whether a request is blocked and reports a block to the
    /// embedder's callback.
    pub fn evaluate_request(
        &self,
        method: &str,
        url: &str,
        requesting_domain: &str,
        resource: ResourceKind,
    ) -> RequestVerdict {
        let verdict = self
            .decisions
            .evaluate_request(method, url, requesting_domain, resource);
        if let RequestVerdict::Block(report) = &verdict {
            (self.config.callbacks.on_request_blocked)(report.category, url);
        }
        verdict
    }

    /// Collects element-hiding selectors for a document. Returns an empty
    /// report when element hiding is disabled.
    pub fn evaluate_elements(&self, html_document: &str, requesting_domain: &str) -> ElementReport {
        if !self.option(EngineOption::ElementHiding) {
            return ElementReport::default();
        }
        let report = self.decisions.evaluate_elements(html_document, requesting_domain);
        if !report.selectors.is_empty() {
            (self.config.callbacks.on_elements_blocked)(
                report.selectors.len() as u32,
                requesting_domain,
            );
        }
        report
    }

    /// Scans a payload against loaded text triggers. Returns `None` when
    /// trigger scanning is disabled or nothing matches.
    pub fn evaluate_text_triggers(&self, payload: &str) -> Option<TriggerMatch> {
        if !self.option(EngineOption::TextTriggerScanning) {
            return None;
        }
        self.decisions.evaluate_text_triggers(payload)
    }

    /// Asks the embedder's firewall callback whether traffic from this
    /// program may be intercepted.
    pub fn firewall_allows(&self, binary_name: &str) -> bool {
        (self.config.callbacks.firewall_check)(binary_name)
    }

    /// Asks the embedder's classifier to categorize a response payload.
    /// Returns the unfiltered category id when unclassified.
    pub fn classify_content(&self, payload: &[u8], content_type: &str) -> CategoryId {
        (self.config.callbacks.content_classifier)(payload, content_type)
    }

    // ==================== Accessors ====================

    /// The root CA certificate in PEM encoding, for export to clients
    /// that manage trust themselves.
    pub fn root_ca_pem(&self) -> String {
        self.certs.root_ca_pem()
    }

    /// The certificate store, for the TLS side of the traffic pipeline.
    pub fn certificate_store(&self) -> &CertificateStore {
        &self.certs
    }

    /// HTML to serve in place of a blocked page.
    pub fn blocked_html_page(&self) -> &str {
        &self.config.blocked_html_page
    }

    /// CA bundle for upstream verification, when the embedder supplied
    /// one. The external pipeline consumes it; the engine only carries it.
    pub fn ca_bundle_path(&self) -> Option<&Path> {
        self.config.ca_bundle_path.as_deref()
    }

    /// The HTTP listener port, `0` until the pipeline has bound and
    /// reported it.
    pub fn http_listener_port(&self) -> u16 {
        self.http_port.load(Ordering::Acquire)
    }

    /// The HTTPS listener port, `0` until the pipeline has bound and
    /// reported it.
    pub fn https_listener_port(&self) -> u16 {
        self.https_port.load(Ordering::Acquire)
    }

    /// Records the ports the traffic pipeline actually bound. Only a
    /// running engine accepts a report.
    pub fn report_listener_ports(&self, http: u16, https: u16) -> Result<()> {
        let state = self.state();
        if state != EngineState::Running {
            return Err(EngineError::Lifecycle {
                expected: EngineState::Running,
                actual: state,
            });
        }
        self.http_port.store(http, Ordering::Release);
        self.https_port.store(https, Ordering::Release);
        tracing::info!(http, https, "listener ports bound");
        Ok(())
    }

    /// Worker threads the pipeline should spawn. A configured `0` means
    /// one per available CPU.
    pub fn worker_threads(&self) -> usize {
        if self.config.worker_threads > 0 {
            self.config.worker_threads
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("http_port", &self.http_listener_port())
            .field("https_port", &self.https_listener_port())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineCallbacks;
    use crate::trust::NullTrustStore;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    fn test_engine_with(dir: &TempDir, config: EngineConfig) -> Engine {
        let config = config.with_ca_dir(dir.path());
        Engine::with_trust_store(config, Box::new(NullTrustStore)).unwrap()
    }

    fn test_engine(dir: &TempDir) -> Engine {
        test_engine_with(dir, EngineConfig::default())
    }

    // ==================== Lifecycle ====================

    #[test]
    fn start_stop_cycle() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());

        engine.start().unwrap();
        assert!(engine.is_running());

        // Idempotent.
        engine.start().unwrap();
        assert!(engine.is_running());

        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);

        // Restartable.
        engine.start().unwrap();
        assert!(engine.is_running());
    }

    #[test]
    fn rules_survive_stop() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        engine.load_list_from_string("||ads.example.com^", 1, false);
        engine.set_category(1, true);
        engine.start().unwrap();
        engine.stop();
        engine.start().unwrap();

        let verdict = engine.evaluate_request(
            "GET",
            "http://ads.example.com/banner.js",
            "example.com",
            ResourceKind::Script,
        );
        assert!(verdict.is_block());
    }

    #[test]
    fn listener_ports_require_running() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        let err = engine.report_listener_ports(8080, 8443).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Lifecycle {
                expected: EngineState::Running,
                actual: EngineState::Created,
            }
        ));

        engine.start().unwrap();
        engine.report_listener_ports(8080, 8443).unwrap();
        assert_eq!(engine.http_listener_port(), 8080);
        assert_eq!(engine.https_listener_port(), 8443);

        engine.stop();
        assert_eq!(engine.http_listener_port(), 0);
        assert_eq!(engine.https_listener_port(), 0);
    }

    // ==================== Options and categories ====================

    #[test]
    fn options_default_on_and_toggle() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        for option in EngineOption::all() {
            assert!(engine.option(*option));
        }
        engine.set_option(EngineOption::ElementHiding, false);
        assert!(!engine.option(EngineOption::ElementHiding));
        assert!(engine.option(EngineOption::TlsInterception));
    }

    #[test]
    fn option_ids_map_and_unknown_ids_are_inert() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        assert!(engine.option_by_id(1));
        engine.set_option_by_id(1, false);
        assert!(!engine.option(EngineOption::ElementHiding));

        engine.set_option_by_id(99, true);
        assert!(!engine.option_by_id(99));
    }

    #[test]
    fn unfiltered_category_cannot_be_disabled() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        assert!(engine.category(0));
        engine.set_category(0, false);
        assert!(engine.category(0));
    }

    #[test]
    fn categories_default_off_and_toggle() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        assert!(!engine.category(5));
        engine.set_category(5, true);
        assert!(engine.category(5));
        engine.set_category(5, false);
        assert!(!engine.category(5));
    }

    // ==================== Loading and queries ====================

    #[test]
    fn file_loading_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        let list = dir.path().join("list.txt");
        std::fs::write(&list, "||ads.example.com^\nnot a rule but still a pattern\n").unwrap();
        let outcome = engine.load_list_from_file(&list, 1, false).unwrap();
        assert_eq!(outcome.loaded, 2);
        assert_eq!(outcome.failed, 0);

        let missing = engine.load_list_from_file(dir.path().join("absent.txt"), 1, false);
        assert!(matches!(missing, Err(EngineError::Io(_))));
    }

    #[test]
    fn file_read_failure_reaches_error_sink() {
        let dir = TempDir::new().unwrap();
        let errors = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&errors);
        let config = EngineConfig::default().with_callbacks(EngineCallbacks::new().with_error_sink(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));
        let engine = test_engine_with(&dir, config);

        let result = engine.load_list_from_file(dir.path().join("absent.txt"), 1, false);
        assert!(result.is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ca_bundle_path_is_carried_through() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("bundle.pem");
        let config = EngineConfig::default().with_ca_bundle(&bundle);
        let engine = test_engine_with(&dir, config);
        assert_eq!(engine.ca_bundle_path(), Some(bundle.as_path()));
    }

    #[test]
    fn blocked_requests_invoke_callback() {
        let dir = TempDir::new().unwrap();
        let blocked = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&blocked);
        let config = EngineConfig::default().with_callbacks(
            EngineCallbacks::new()
                .with_request_blocked(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );
        let engine = test_engine_with(&dir, config);

        engine.load_list_from_string("||ads.example.com^", 1, false);
        engine.set_category(1, true);

        let verdict = engine.evaluate_request(
            "GET",
            "http://ads.example.com/a.js",
            "example.com",
            ResourceKind::Script,
        );
        assert!(verdict.is_block());
        assert_eq!(blocked.load(Ordering::SeqCst), 1);

        let verdict = engine.evaluate_request(
            "GET",
            "http://safe.example.com/a.js",
            "example.com",
            ResourceKind::Script,
        );
        assert!(!verdict.is_block());
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn element_hiding_honors_option() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        engine.load_list_from_string("##.ad-banner", 1, false);
        engine.set_category(1, true);
        let html = r#"<div class="ad-banner">buy</div>"#;

        let report = engine.evaluate_elements(html, "example.com");
        assert_eq!(report.selectors, vec![".ad-banner".to_string()]);

        engine.set_option(EngineOption::ElementHiding, false);
        let report = engine.evaluate_elements(html, "example.com");
        assert!(report.selectors.is_empty());
    }

    #[test]
    fn text_triggers_honor_option() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        assert_eq!(engine.load_text_triggers_from_string("casino", 1, false), 1);
        engine.set_category(1, true);
        assert!(engine.evaluate_text_triggers("visit our casino now").is_some());

        engine.set_option(EngineOption::TextTriggerScanning, false);
        assert!(engine.evaluate_text_triggers("visit our casino now").is_none());
    }

    #[test]
    fn unload_discards_rules() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        engine.load_list_from_string("||ads.example.com^", 1, false);
        engine.set_category(1, true);
        engine.unload_rules(1);
        let verdict = engine.evaluate_request(
            "GET",
            "http://ads.example.com/a.js",
            "example.com",
            ResourceKind::Script,
        );
        assert!(!verdict.is_block());
    }

    // ==================== Embedder callbacks ====================

    #[test]
    fn firewall_and_classifier_delegate() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::default().with_callbacks(
            EngineCallbacks::new()
                .with_firewall_check(|name| name != "malware.exe")
                .with_content_classifier(|payload, _| if payload.is_empty() { 0 } else { 7 }),
        );
        let engine = test_engine_with(&dir, config);

        assert!(engine.firewall_allows("browser.exe"));
        assert!(!engine.firewall_allows("malware.exe"));
        assert_eq!(engine.classify_content(b"", "text/html"), 0);
        assert_eq!(engine.classify_content(b"payload", "text/html"), 7);
    }

    #[test]
    fn root_ca_pem_available_before_start() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        assert!(engine.root_ca_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn worker_threads_defaults_to_parallelism() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        assert!(engine.worker_threads() >= 1);

        let sized = test_engine_with(&dir, EngineConfig::default().with_worker_threads(3));
        assert_eq!(sized.worker_threads(), 3);
    }
}
