use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// An anchor element as seen by click listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: String,
    #[serde(default)]
    pub href: Option<String>,
    /// Rendered text of the element.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Anchor {
    pub fn new(id: &str, href: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            href: href.map(str::to_string),
            text: String::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// `href` is an attribute like any other; it is just stored apart.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        if name == "href" {
            return self.href.as_deref();
        }
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        if name == "href" {
            self.href = Some(value.to_string());
        } else {
            self.attributes.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove_attribute(&mut self, name: &str) {
        if name == "href" {
            self.href = None;
        } else {
            self.attributes.remove(name);
        }
    }
}

/// Listeners only ever see a read-only anchor, so they cannot cancel navigation.
pub type ClickListener = Arc<dyn Fn(&Anchor) + Send + Sync>;

pub trait PageEnvironment: Send + Sync {
    fn current_path(&self) -> String;
    /// Snapshot of the anchors matching `predicate`, in document order.
    fn query_links(&self, predicate: &dyn Fn(&Anchor) -> bool) -> Vec<Anchor>;
    /// Returns false when no anchor has that id.
    fn add_click_listener(&self, anchor_id: &str, listener: ClickListener) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickOutcome {
    pub navigate_to: Option<String>,
    pub default_prevented: bool,
    pub listeners_run: usize,
}

/// A page as stored on disk for the replay host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub path: String,
    #[serde(default)]
    pub anchors: Vec<Anchor>,
}

pub fn load_snapshot(path: &Path) -> Result<PageSnapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read page snapshot at {}", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("invalid page snapshot at {}", path.display()))
}

#[derive(Default)]
struct Document {
    anchors: Vec<Anchor>,
    listeners: HashMap<String, Vec<ClickListener>>,
}

/// In-memory document that hosts the tracker outside a browser.
pub struct StaticPage {
    path: String,
    document: Mutex<Document>,
}

impl StaticPage {
    pub fn new(path: &str) -> Self {
        let path = if path.is_empty() { "/" } else { path };
        Self {
            path: path.to_string(),
            document: Mutex::new(Document::default()),
        }
    }

    /// Later anchors with an id already seen are dropped.
    pub fn from_snapshot(snapshot: PageSnapshot) -> Self {
        let page = Self::new(&snapshot.path);
        for anchor in snapshot.anchors {
            let id = anchor.id.clone();
            if !page.insert_anchor(anchor) {
                tracing::warn!(anchor = %id, "duplicate anchor id in page snapshot; ignoring");
            }
        }
        page
    }

    fn document(&self) -> MutexGuard<'_, Document> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_anchor(&self, anchor: Anchor) -> bool {
        let mut document = self.document();
        if document.anchors.iter().any(|existing| existing.id == anchor.id) {
            return false;
        }
        document.anchors.push(anchor);
        true
    }

    pub fn anchor(&self, id: &str) -> Option<Anchor> {
        self.document()
            .anchors
            .iter()
            .find(|anchor| anchor.id == id)
            .cloned()
    }

    pub fn set_attribute(&self, id: &str, name: &str, value: &str) -> bool {
        self.update_anchor(id, |anchor| anchor.set_attribute(name, value))
    }

    pub fn remove_attribute(&self, id: &str, name: &str) -> bool {
        self.update_anchor(id, |anchor| anchor.remove_attribute(name))
    }

    fn update_anchor(&self, id: &str, update: impl FnOnce(&mut Anchor)) -> bool {
        let mut document = self.document();
        match document.anchors.iter_mut().find(|anchor| anchor.id == id) {
            Some(anchor) => {
                update(anchor);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, id: &str) -> usize {
        self.document().listeners.get(id).map_or(0, Vec::len)
    }

    /// Runs every listener bound to the anchor, then reports the navigation
    /// the click would perform. `None` if the anchor does not exist.
    pub fn click(&self, id: &str) -> Option<ClickOutcome> {
        let (anchor, listeners) = {
            let document = self.document();
            let anchor = document.anchors.iter().find(|anchor| anchor.id == id)?.clone();
            let listeners = document.listeners.get(id).cloned().unwrap_or_default();
            (anchor, listeners)
        };

        for listener in &listeners {
            listener(&anchor);
        }

        Some(ClickOutcome {
            navigate_to: anchor.href.clone(),
            default_prevented: false,
            listeners_run: listeners.len(),
        })
    }
}

impl PageEnvironment for StaticPage {
    fn current_path(&self) -> String {
        self.path.clone()
    }

    fn query_links(&self, predicate: &dyn Fn(&Anchor) -> bool) -> Vec<Anchor> {
        self.document()
            .anchors
            .iter()
            .filter(|anchor| predicate(anchor))
            .cloned()
            .collect()
    }

    fn add_click_listener(&self, anchor_id: &str, listener: ClickListener) -> bool {
        let mut document = self.document();
        if !document.anchors.iter().any(|anchor| anchor.id == anchor_id) {
            return false;
        }
        document
            .listeners
            .entry(anchor_id.to_string())
            .or_default()
            .push(listener);
        true
    }
}
