//! Exchange router
//!
//! Holds every exchange and its bindings. The broker keeps it behind an
//! `RwLock`: publishers route under a read guard, declarations and bindings
//! take the write guard.
//!
//! The default exchange `""` is implicit. Every declared queue is reachable
//! through it with the queue name as routing key, and it can be neither
//! declared, deleted nor bound explicitly.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::broker::exchange::{
    Binding, BindingArguments, Exchange, ExchangeKind, ExchangeOptions,
};
use crate::broker::message::Message;
use crate::utils::{BrokerError, BrokerResult};

pub const DEFAULT_EXCHANGE: &str = "";

/// One queue selected by routing, with the binding key that selected it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub queue: String,
    pub binding_key: String,
}

#[derive(Debug, Default)]
pub struct ExchangeRouter {
    exchanges: HashMap<String, Exchange>,
    queues: HashSet<String>,
    /// Auto-delete exchanges removed since the last `take_auto_deleted`.
    auto_deleted: Vec<Exchange>,
}

impl ExchangeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the exchange was created, `false` if an identical one
    /// already existed.
    pub fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> BrokerResult<bool> {
        if name == DEFAULT_EXCHANGE || name.starts_with("amq.") {
            return Err(BrokerError::AccessRefused(format!(
                "exchange name '{name}' is reserved"
            )));
        }

        if let Some(existing) = self.exchanges.get(name) {
            if existing.is_equivalent(kind, &options) {
                return Ok(false);
            }
            return Err(BrokerError::PreconditionFailed(format!(
                "exchange '{name}' already declared as {} with different options",
                existing.kind
            )));
        }

        debug!(exchange = name, kind = %kind, "exchange declared");
        self.exchanges
            .insert(name.to_string(), Exchange::new(name, kind, options));
        Ok(true)
    }

    pub fn delete_exchange(&mut self, name: &str, if_unused: bool) -> BrokerResult<Exchange> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "the default exchange cannot be deleted".into(),
            ));
        }
        let exchange = self
            .exchanges
            .get(name)
            .ok_or_else(|| BrokerError::not_found("exchange", name))?;
        if if_unused && !exchange.bindings.is_empty() {
            return Err(BrokerError::PreconditionFailed(format!(
                "exchange '{name}' is in use"
            )));
        }
        self.exchanges
            .remove(name)
            .ok_or_else(|| BrokerError::not_found("exchange", name))
    }

    pub fn exchange(&self, name: &str) -> Option<&Exchange> {
        self.exchanges.get(name)
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.values()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        name == DEFAULT_EXCHANGE || self.exchanges.contains_key(name)
    }

    pub fn register_queue(&mut self, queue: &str) {
        self.queues.insert(queue.to_string());
    }

    /// Forget a deleted queue and drop every binding that points at it.
    pub fn unregister_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
        let mut emptied = Vec::new();
        for exchange in self.exchanges.values_mut() {
            if exchange.unbind_queue(queue) > 0 {
                emptied.push(exchange.name.clone());
            }
        }
        for name in emptied {
            self.remove_if_unused_auto_delete(&name);
        }
    }

    pub fn bind(&mut self, exchange: &str, binding: Binding) -> BrokerResult<bool> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "queues cannot be bound to the default exchange".into(),
            ));
        }
        if !self.queues.contains(&binding.queue) {
            return Err(BrokerError::not_found("queue", &binding.queue));
        }
        let target = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::not_found("exchange", exchange))?;
        Ok(target.bind(binding))
    }

    pub fn unbind(
        &mut self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        arguments: &BindingArguments,
    ) -> BrokerResult<bool> {
        let target = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::not_found("exchange", exchange))?;
        let removed = target.unbind(queue, routing_key, arguments);
        if removed {
            self.remove_if_unused_auto_delete(exchange);
        }
        Ok(removed)
    }

    /// Queues that receive `message` when published to `exchange`.
    ///
    /// Falls through alternate exchanges while nothing matches. An unknown
    /// alternate exchange ends the chain with no match.
    pub fn route(
        &self,
        exchange: &str,
        message: &Message,
        routing_key: &str,
    ) -> BrokerResult<Vec<RouteMatch>> {
        if !self.has_exchange(exchange) {
            return Err(BrokerError::not_found("exchange", exchange));
        }

        let mut visited = HashSet::new();
        let mut current = exchange;
        loop {
            visited.insert(current);

            if current == DEFAULT_EXCHANGE {
                return Ok(self.route_default(routing_key));
            }

            let Some(ex) = self.exchanges.get(current) else {
                return Ok(Vec::new());
            };

            let mut seen = HashSet::new();
            let matches: Vec<RouteMatch> = ex
                .matching(message, routing_key)
                .filter(|b| seen.insert(b.queue.as_str()))
                .map(|b| RouteMatch {
                    queue: b.queue.clone(),
                    binding_key: b.routing_key.clone(),
                })
                .collect();

            if !matches.is_empty() {
                return Ok(matches);
            }

            match ex.options.alternate_exchange.as_deref() {
                Some(alt) if !visited.contains(alt) => {
                    debug!(
                        exchange = current,
                        alternate = alt,
                        "routing via alternate exchange"
                    );
                    current = alt;
                }
                _ => return Ok(Vec::new()),
            }
        }
    }

    fn route_default(&self, routing_key: &str) -> Vec<RouteMatch> {
        if self.queues.contains(routing_key) {
            vec![RouteMatch {
                queue: routing_key.to_string(),
                binding_key: routing_key.to_string(),
            }]
        } else {
            Vec::new()
        }
    }

    /// Exchanges dropped because their last binding went away.
    pub fn take_auto_deleted(&mut self) -> Vec<Exchange> {
        std::mem::take(&mut self.auto_deleted)
    }

    fn remove_if_unused_auto_delete(&mut self, name: &str) {
        let unused = self
            .exchanges
            .get(name)
            .is_some_and(|ex| ex.options.auto_delete && ex.bindings.is_empty());
        if unused {
            if let Some(exchange) = self.exchanges.remove(name) {
                debug!(exchange = name, "auto-delete exchange removed");
                self.auto_deleted.push(exchange);
            }
        }
    }
}
