use crate::event::{InteractionEvent, PageViewEvent};
use crate::page::{Anchor, ClickListener, PageEnvironment};
use crate::selector::LinkSelectors;
use crate::sender::BestEffortSender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const PAGE_VIEW_PATH: &str = "/analytics/api/analytics/record-view";
pub const INTERACTION_PATH: &str = "/analytics/api/analytics/record-event";

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker already initialized")]
    AlreadyInitialized,
    #[error("no tokio runtime available for page-view delivery")]
    NoRuntime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub page_view: String,
    pub interaction: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            page_view: PAGE_VIEW_PATH.to_string(),
            interaction: INTERACTION_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingReport {
    pub outbound: usize,
    pub downloads: usize,
}

#[derive(Debug)]
pub struct InitReport {
    pub page: String,
    /// Completes once the page-view request settles; nothing needs to await it.
    pub page_view: JoinHandle<()>,
    pub bindings: BindingReport,
}

pub struct Tracker {
    env: Arc<dyn PageEnvironment>,
    sender: Arc<dyn BestEffortSender>,
    endpoints: Endpoints,
    selectors: LinkSelectors,
    initialized: AtomicBool,
    bound: AtomicBool,
}

impl Tracker {
    pub fn new(env: Arc<dyn PageEnvironment>, sender: Arc<dyn BestEffortSender>) -> Self {
        Self {
            env,
            sender,
            endpoints: Endpoints::default(),
            selectors: LinkSelectors::default(),
            initialized: AtomicBool::new(false),
            bound: AtomicBool::new(false),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_selectors(mut self, selectors: LinkSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    /// One-time setup pass, run when the document is ready: records the
    /// current path, then instruments the anchors present right now.
    pub fn initialize(&self) -> Result<InitReport, TrackerError> {
        let runtime = Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(TrackerError::AlreadyInitialized);
        }

        let page = self.env.current_path();
        let page_view = self.spawn_page_view(&runtime, &page);
        let bindings = self.bind_interaction_tracking();

        info!(
            page = %page,
            outbound = bindings.outbound,
            downloads = bindings.downloads,
            "tracker initialized"
        );

        Ok(InitReport {
            page,
            page_view,
            bindings,
        })
    }

    pub fn record_page_view(&self, page: &str) -> Result<JoinHandle<()>, TrackerError> {
        let runtime = Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;
        Ok(self.spawn_page_view(&runtime, page))
    }

    fn spawn_page_view(&self, runtime: &Handle, page: &str) -> JoinHandle<()> {
        let sender = Arc::clone(&self.sender);
        let path = self.endpoints.page_view.clone();
        let payload = serde_json::json!(PageViewEvent::new(page));

        runtime.spawn(async move {
            if let Err(error) = sender.send_async(&path, &payload).await {
                warn!(error = %error, "analytics tracking error");
            }
        })
    }

    /// Binds click listeners to the anchors currently matching the outbound
    /// and download selectors. Anchors added later are not instrumented.
    /// Only the first call binds; later calls return an empty report.
    pub fn bind_interaction_tracking(&self) -> BindingReport {
        let mut report = BindingReport::default();
        if self.bound.swap(true, Ordering::SeqCst) {
            warn!("interaction tracking already bound; ignoring");
            return report;
        }

        let outbound = self
            .env
            .query_links(&|anchor: &Anchor| self.selectors.outbound.matches(anchor));
        for anchor in &outbound {
            let sender = Arc::clone(&self.sender);
            let path = self.endpoints.interaction.clone();
            let listener: ClickListener = Arc::new(move |link: &Anchor| {
                let event = InteractionEvent::external_link(link.attribute("href"), &link.text);
                send_beacon(sender.as_ref(), &path, &event);
            });
            if self.env.add_click_listener(&anchor.id, listener) {
                report.outbound += 1;
            }
        }

        let downloads = self
            .env
            .query_links(&|anchor: &Anchor| self.selectors.download.matches(anchor));
        for anchor in &downloads {
            let sender = Arc::clone(&self.sender);
            let path = self.endpoints.interaction.clone();
            let listener: ClickListener = Arc::new(move |link: &Anchor| {
                let event = InteractionEvent::file_download(
                    link.attribute("data-file-id"),
                    link.attribute("data-file-name"),
                );
                send_beacon(sender.as_ref(), &path, &event);
            });
            if self.env.add_click_listener(&anchor.id, listener) {
                report.downloads += 1;
            }
        }

        report
    }
}

fn send_beacon(sender: &dyn BestEffortSender, path: &str, event: &InteractionEvent) {
    match event.to_beacon_body() {
        Ok(body) => {
            if !sender.send_durable(path, body) {
                debug!(event_type = event.event_type(), "interaction beacon not queued");
            }
        }
        Err(error) => warn!(
            error = %error,
            event_type = event.event_type(),
            "failed to encode interaction event"
        ),
    }
}
