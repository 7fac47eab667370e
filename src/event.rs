use serde::{Deserialize, Serialize};

pub const DEFAULT_LINK_TEXT: &str = "external link";
pub const UNKNOWN_FILE_NAME: &str = "unknown";

/// Body of a page-view record: the path that was loaded.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PageViewEvent {
    pub page: String,
}

impl PageViewEvent {
    pub fn new(page: &str) -> Self {
        Self {
            page: page.to_string(),
        }
    }
}

/// Body of an interaction record.
///
/// Serializes as `{"event_type": "...", "event_data": {...}}`, with the
/// camel-cased data keys the analytics endpoint expects.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event_type", content = "event_data", rename_all = "snake_case")]
pub enum InteractionEvent {
    ExternalLink {
        /// `None` when the anchor lost its `href` after binding.
        url: Option<String>,
        #[serde(rename = "linkText")]
        link_text: String,
    },
    FileDownload {
        #[serde(rename = "fileId")]
        file_id: Option<String>,
        #[serde(rename = "fileName")]
        file_name: String,
    },
}

impl InteractionEvent {
    /// Blank rendered text is reported as [`DEFAULT_LINK_TEXT`].
    pub fn external_link(url: Option<&str>, rendered_text: &str) -> Self {
        let link_text = if rendered_text.trim().is_empty() {
            DEFAULT_LINK_TEXT.to_string()
        } else {
            rendered_text.to_string()
        };

        Self::ExternalLink {
            url: url.map(str::to_string),
            link_text,
        }
    }

    /// A missing or empty file name is reported as [`UNKNOWN_FILE_NAME`].
    pub fn file_download(file_id: Option<&str>, file_name: Option<&str>) -> Self {
        Self::FileDownload {
            file_id: file_id.map(str::to_string),
            file_name: file_name
                .filter(|name| !name.is_empty())
                .unwrap_or(UNKNOWN_FILE_NAME)
                .to_string(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExternalLink { .. } => "external_link",
            Self::FileDownload { .. } => "file_download",
        }
    }

    pub fn to_beacon_body(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
