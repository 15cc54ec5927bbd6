//! config — startup configuration
//!
//! A TOML file describing flows to establish at boot.  Applying it goes
//! through the same handlers a remote client would hit, so configured and
//! remotely created flows are indistinguishable to the runtime.
//!
//! ```toml
//! [[flow]]
//! detector = "LightSpots"
//! client = "127.0.0.1"
//! port = 9000
//! autostart = true
//!
//! [[flow.source]]
//! type = "Pattern"
//! index = 0
//!
//! [[flow.parameter]]
//! name = "detectionLevel"
//! values = [180]
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::message::{Message, Value};
use crate::runtime::App;
use crate::server::handlers;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default, rename = "flow")]
    pub flows: Vec<FlowConfig>,
}

#[derive(Debug, Deserialize)]
pub struct FlowConfig {
    pub detector: String,
    #[serde(default = "default_client")]
    pub client: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,
    #[serde(default, rename = "parameter")]
    pub parameters: Vec<ParameterConfig>,
    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub class: String,
    #[serde(default)]
    pub index: i32,
}

#[derive(Debug, Deserialize)]
pub struct ParameterConfig {
    pub name: String,
    #[serde(default)]
    pub values: Vec<toml::Value>,
    /// When set, the parameter targets this source index instead of the
    /// detector.
    #[serde(default)]
    pub source: Option<i32>,
}

fn default_client() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    crate::server::CLIENT_PORT
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
}

fn push_toml_value(message: &mut Message, value: &toml::Value) {
    match value {
        toml::Value::Integer(v) => message.push(*v as i32),
        toml::Value::Float(v) => message.push(*v as f32),
        toml::Value::Boolean(v) => message.push(*v as i32),
        toml::Value::String(v) => message.push(v.as_str()),
        other => tracing::warn!(value = %other, "unsupported config value type, skipped"),
    }
}

/// Establish every configured flow, logging failures without aborting the
/// rest — a bad entry must not take the configured neighbours down with it.
pub fn apply(app: &Arc<App>, config: &Config) {
    for flow in &config.flows {
        let mut connect = Message::new();
        connect.push(flow.client.as_str());
        connect.push(flow.port as i32);
        connect.push(flow.detector.as_str());
        for source in &flow.sources {
            connect.push(source.class.as_str());
            connect.push(source.index);
        }

        let reply = handlers::connect(app, &connect).map(|(_, reply)| reply);
        let flow_id = match reply.as_ref().map(|r| (r.str_at(0), r.int_at(1))) {
            Some((Ok("Connected"), Ok(id))) => id,
            Some((Ok(error), _)) => {
                tracing::warn!(detector = %flow.detector, error, "configured flow rejected");
                continue;
            }
            _ => {
                tracing::warn!(detector = %flow.detector, "configured flow got no reply");
                continue;
            }
        };

        for parameter in &flow.parameters {
            let mut set = Message::new();
            set.push(flow.client.as_str());
            set.push(flow_id);
            match parameter.source {
                Some(index) => {
                    set.push("Source");
                    set.push(index);
                }
                None => set.push("Detector"),
            }
            set.push(parameter.name.as_str());
            for value in &parameter.values {
                push_toml_value(&mut set, value);
            }
            if let Some((_, reply)) = handlers::set_parameter(app, &set) {
                if let Some(Value::Str(error)) = reply.get(0) {
                    tracing::warn!(parameter = %parameter.name, error = %error, "parameter rejected");
                }
            }
        }

        if flow.autostart {
            let start = crate::message![flow.client.as_str(), flow_id, "Start"];
            handlers::set_parameter(app, &start);
        }

        tracing::info!(flow = flow_id, detector = %flow.detector, "configured flow ready");
    }
}
