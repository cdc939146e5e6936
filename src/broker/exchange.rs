//! Exchanges and bindings
//!
//! An `Exchange` is stateless apart from its bindings. `matching` evaluates
//! the exchange's own routing algorithm against those bindings; following
//! alternate exchanges and the default exchange is the router's job.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::broker::message::{HeaderValue, Headers, Message};
use crate::broker::topic::TopicPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(format!("unknown exchange type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExchangeOptions {
    #[serde(default)]
    pub durable: bool,
    /// Removed once its last binding goes away.
    #[serde(default)]
    pub auto_delete: bool,
    /// Receives messages this exchange cannot route.
    #[serde(default)]
    pub alternate_exchange: Option<String>,
}

impl ExchangeOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn with_alternate_exchange(mut self, name: impl Into<String>) -> Self {
        self.alternate_exchange = Some(name.into());
        self
    }
}

/// `x-match` mode of a headers binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BindingArguments {
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub headers: Headers,
}

impl BindingArguments {
    pub fn headers(match_mode: MatchMode, headers: Headers) -> Self {
        Self {
            match_mode,
            headers,
        }
    }

    fn matches(&self, message: &Message) -> bool {
        let mut required = self
            .headers
            .iter()
            .filter(|(key, _)| !key.starts_with("x-"));
        let present =
            |(key, value): (&String, &HeaderValue)| message.headers.get(key) == Some(value);

        match self.match_mode {
            MatchMode::All => required.all(present),
            MatchMode::Any => required.any(present),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
    pub arguments: BindingArguments,
    pattern: TopicPattern,
}

impl Binding {
    pub fn new(queue: impl Into<String>, routing_key: impl Into<String>) -> Self {
        let routing_key = routing_key.into();
        Self {
            queue: queue.into(),
            pattern: TopicPattern::new(&routing_key),
            routing_key,
            arguments: BindingArguments::default(),
        }
    }

    pub fn with_arguments(mut self, arguments: BindingArguments) -> Self {
        self.arguments = arguments;
        self
    }

    fn matches(&self, kind: ExchangeKind, message: &Message, routing_key: &str) -> bool {
        match kind {
            ExchangeKind::Direct => self.routing_key == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => self.pattern.matches(routing_key),
            ExchangeKind::Headers => self.arguments.matches(message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub options: ExchangeOptions,
    pub bindings: Vec<Binding>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeKind, options: ExchangeOptions) -> Self {
        Self {
            name: name.to_string(),
            kind,
            options,
            bindings: Vec::new(),
        }
    }

    /// Same type and options: a redeclaration is a no-op.
    pub fn is_equivalent(&self, kind: ExchangeKind, options: &ExchangeOptions) -> bool {
        self.kind == kind && &self.options == options
    }

    /// Returns `false` when an identical binding already exists.
    pub fn bind(&mut self, binding: Binding) -> bool {
        if self.bindings.contains(&binding) {
            return false;
        }
        self.bindings.push(binding);
        true
    }

    pub fn unbind(&mut self, queue: &str, routing_key: &str, arguments: &BindingArguments) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|b| {
            !(b.queue == queue && b.routing_key == routing_key && &b.arguments == arguments)
        });
        self.bindings.len() != before
    }

    pub fn unbind_queue(&mut self, queue: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.queue != queue);
        before - self.bindings.len()
    }

    /// Bindings of this exchange that accept the message.
    pub fn matching<'a>(
        &'a self,
        message: &'a Message,
        routing_key: &'a str,
    ) -> impl Iterator<Item = &'a Binding> + 'a {
        self.bindings
            .iter()
            .filter(move |b| b.matches(self.kind, message, routing_key))
    }
}
