// src/config.rs
//
// Runtime configuration, read from the environment (and `.env`).

use log::warn;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bridge::registry::DEFAULT_DISCOVERY_TIMEOUT;
use crate::networking::companion::{DEFAULT_PORT, DEFAULT_SEND_TIMEOUT};
use crate::networking::discovery::DEFAULT_BROWSE_WINDOW;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Name advertised to companions
    pub node_name: String,

    /// Companion port; 0 picks a free one
    pub port: u16,

    /// Where received recordings are written
    pub receive_dir: PathBuf,

    /// Upper bound on one discovery call
    pub discovery_timeout: Duration,

    /// How long each discovery call listens for advertisements
    pub browse_window: Duration,

    /// Connect + write bound for one message send
    pub send_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            port: DEFAULT_PORT,
            receive_dir: default_receive_dir(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            browse_window: DEFAULT_BROWSE_WINDOW,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or unparsable values fall
    /// back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            parsed::<u64, _>(&lookup, key)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        let config = Self {
            node_name: lookup("BRIDGE_NODE_NAME")
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.node_name),
            port: parsed(&lookup, "BRIDGE_PORT").unwrap_or(defaults.port),
            receive_dir: lookup("BRIDGE_RECEIVE_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.receive_dir),
            discovery_timeout: millis("BRIDGE_DISCOVERY_TIMEOUT_MS", defaults.discovery_timeout),
            browse_window: millis("BRIDGE_BROWSE_WINDOW_MS", defaults.browse_window),
            send_timeout: millis("BRIDGE_SEND_TIMEOUT_MS", defaults.send_timeout),
        };
        config.with_browse_window_within_timeout()
    }

    /// A browse window at or past the discovery timeout would time out every
    /// discovery call, so it is cut to half the timeout.
    fn with_browse_window_within_timeout(mut self) -> Self {
        if self.browse_window >= self.discovery_timeout {
            let clamped = self.discovery_timeout / 2;
            warn!(
                "Browse window {:?} does not fit the discovery timeout {:?}, using {:?}",
                self.browse_window, self.discovery_timeout, clamped
            );
            self.browse_window = clamped;
        }
        self
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "companion-bridge".to_string())
}

/// The user's downloads directory, or the temp dir where there is none.
fn default_receive_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(std::env::temp_dir)
}
