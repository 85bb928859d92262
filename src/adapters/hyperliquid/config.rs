//! Venue endpoint configuration
//!
//! Resolved from the application `Settings` for the configured network.

use crate::config::Settings;

/// Endpoints for one venue connection set
#[derive(Debug, Clone)]
pub struct VenueEndpoints {
    pub websocket_url: String,
    pub rest_base: String,
    pub info_path: String,
}

impl VenueEndpoints {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            websocket_url: settings.websocket_url().to_string(),
            rest_base: settings.rest_base().to_string(),
            info_path: settings.api.info_path.clone(),
        }
    }

    /// Full info endpoint URL
    pub fn info_url(&self) -> String {
        format!("{}{}", self.rest_base, self.info_path)
    }
}
