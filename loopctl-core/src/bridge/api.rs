//! Named host API.
//!
//! An [`ApiCall`] is a JSON object `{"method": "...", "args": ...}`
//! carried in the payload of an Inject-Event or Query-State command.
//! [`ApiRegistry`] maps method names to functions over a user state and
//! implements [`HostGui`] for it.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{HostGui, Reply};
use crate::dispatch::{Job, TaskKey};
use crate::error::{HostError, LoopError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl ApiCall {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LoopError> {
        serde_json::to_vec(self).map_err(|e| LoopError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HostError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

type Immediate<S> = Box<dyn Fn(&mut S, Value) -> Result<Value, HostError>>;
type Deferred<S> = Box<dyn Fn(&mut S, Value) -> Result<Job, HostError>>;
type ResultHook<S> = Box<dyn FnMut(&mut S, TaskKey, &[u8])>;

enum Handler<S> {
    Immediate(Immediate<S>),
    Deferred(Deferred<S>),
}

/// Method table over GUI state `S`. Lives on the GUI thread.
pub struct ApiRegistry<S> {
    state: S,
    methods: HashMap<String, Handler<S>>,
    on_result: Option<ResultHook<S>>,
}

impl<S> ApiRegistry<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            methods: HashMap::new(),
            on_result: None,
        }
    }

    /// Register a method answered on the GUI thread.
    pub fn register<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&mut S, Value) -> Result<Value, HostError> + 'static,
    {
        self.methods
            .insert(name.to_string(), Handler::Immediate(Box::new(f)));
        self
    }

    /// Register a method whose work runs on the worker pool. `f` runs on
    /// the GUI thread and only builds the job.
    pub fn register_offload<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&mut S, Value) -> Result<Job, HostError> + 'static,
    {
        self.methods
            .insert(name.to_string(), Handler::Deferred(Box::new(f)));
        self
    }

    /// Called on the GUI thread with each successful worker result.
    pub fn on_worker_result<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut(&mut S, TaskKey, &[u8]) + 'static,
    {
        self.on_result = Some(Box::new(f));
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn call(&mut self, call: ApiCall) -> Result<Reply, HostError> {
        let handler = self
            .methods
            .get(&call.method)
            .ok_or_else(|| HostError::UnknownMethod(call.method.clone()))?;
        match handler {
            Handler::Immediate(f) => {
                let value = f(&mut self.state, call.args)?;
                Ok(Reply::Ready(serde_json::to_vec(&value)?))
            }
            Handler::Deferred(f) => Ok(Reply::Offload(f(&mut self.state, call.args)?)),
        }
    }
}

impl<S> HostGui for ApiRegistry<S> {
    fn inject_event(&mut self, payload: &[u8]) -> Result<Reply, HostError> {
        self.call(ApiCall::from_bytes(payload)?)
    }

    fn query_state(&mut self, selector: &[u8]) -> Result<Reply, HostError> {
        self.call(ApiCall::from_bytes(selector)?)
    }

    fn worker_result(&mut self, key: TaskKey, result: &[u8]) {
        if let Some(hook) = self.on_result.as_mut() {
            hook(&mut self.state, key, result);
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for ApiRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRegistry")
            .field("state", &self.state)
            .field("methods", &self.methods())
            .finish()
    }
}
