//! Headless reference host: a window-like state model with no pixels.
//!
//! Every method runs on the GUI thread through [`ApiRegistry`]; only
//! `compute_checksum` does its hashing on the worker pool.

use serde::Deserialize;
use serde_json::{Value, json};

use loopctl_core::bridge::ApiRegistry;
use loopctl_core::dispatch::Job;
use loopctl_core::error::HostError;

/// Events kept in the log before the oldest are dropped.
const EVENT_LOG_MAX: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub events: Vec<String>,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            title: "loopctl".into(),
            width: 800,
            height: 600,
            events: Vec::new(),
        }
    }
}

impl Window {
    fn record(&mut self, event: String) {
        if self.events.len() >= EVENT_LOG_MAX {
            self.events.remove(0);
        }
        self.events.push(event);
    }
}

#[derive(Deserialize)]
struct Size {
    width: u32,
    height: u32,
}

fn args<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, HostError> {
    serde_json::from_value(value).map_err(HostError::from)
}

/// Build the registry with every method the headless host serves.
pub fn headless_api() -> ApiRegistry<Window> {
    let mut api = ApiRegistry::new(Window::default());
    api.register("set_title", |w, v| {
        let title: String = args(v)?;
        w.record(format!("title {title:?}"));
        w.title = title;
        Ok(Value::Null)
    })
    .register("get_title", |w, _| Ok(json!(w.title)))
    .register("resize", |w, v| {
        let Size { width, height } = args(v)?;
        if width == 0 || height == 0 {
            return Err(HostError::Rejected(format!(
                "cannot resize to {width}x{height}"
            )));
        }
        w.width = width;
        w.height = height;
        w.record(format!("resize {width}x{height}"));
        Ok(Value::Null)
    })
    .register("get_size", |w, _| {
        Ok(json!({ "width": w.width, "height": w.height }))
    })
    .register("emit", |w, v| {
        let name: String = args(v)?;
        w.record(name);
        Ok(json!(w.events.len()))
    })
    .register("events", |w, _| Ok(json!(w.events)))
    .register_offload("compute_checksum", |_, v| {
        let data: String = args(v)?;
        let job: Job = Box::new(move || {
            let hash = blake3::hash(data.as_bytes()).to_hex().to_string();
            serde_json::to_vec(&json!(hash)).map_err(|e| e.to_string())
        });
        Ok(job)
    })
    .on_worker_result(|w, key, _| w.record(format!("checksum done {key}")));
    api
}
