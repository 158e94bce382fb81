//! Handler registry: maps `(platform, command, service type)` to the handler
//! that implements it.
//!
//! Built once at startup by [`crate::platforms::Platforms`] and then shared
//! read-only with every strategy. A lookup miss is never an error here;
//! strategies turn it into a failed result for that one service.

use crate::error::{Result, SemiontError};
use crate::handler::{Handler, HandlerDescriptor, HandlerKey};
use crate::types::{Command, Platform, ServiceType};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Platform, BTreeMap<HandlerKey, HandlerDescriptor>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a descriptor. Registering the same triple twice is rejected;
    /// use [`HandlerRegistry::replace_handler`] to override on purpose.
    pub fn register_handler(&mut self, descriptor: HandlerDescriptor) -> Result<()> {
        let key = descriptor.key();
        let entries = self.handlers.entry(descriptor.platform).or_default();
        if entries.contains_key(&key) {
            return Err(SemiontError::DuplicateHandler {
                platform: descriptor.platform.to_string(),
                key: key.to_string(),
            });
        }
        tracing::trace!(platform = %descriptor.platform, %key, "registered handler");
        entries.insert(key, descriptor);
        Ok(())
    }

    /// Register a platform's handler set. Every descriptor must declare the
    /// same platform it is registered under.
    ///
    /// Unlike a silent overwrite where the descriptor's own platform wins,
    /// duplicates and platform mismatches are errors here.
    pub fn register_handlers(
        &mut self,
        platform: Platform,
        descriptors: impl IntoIterator<Item = HandlerDescriptor>,
    ) -> Result<()> {
        for descriptor in descriptors {
            if descriptor.platform != platform {
                return Err(SemiontError::PlatformMismatch {
                    key: descriptor.key().to_string(),
                    declared: descriptor.platform.to_string(),
                    expected: platform.to_string(),
                });
            }
            self.register_handler(descriptor)?;
        }
        Ok(())
    }

    /// Overwrite whatever is registered for the descriptor's triple and
    /// return the previous descriptor.
    pub fn replace_handler(&mut self, descriptor: HandlerDescriptor) -> Option<HandlerDescriptor> {
        self.handlers
            .entry(descriptor.platform)
            .or_default()
            .insert(descriptor.key(), descriptor)
    }

    pub fn get_handler_for_command(
        &self,
        command: Command,
        platform: Platform,
        service_type: ServiceType,
    ) -> Option<&HandlerDescriptor> {
        self.handlers
            .get(&platform)?
            .get(&HandlerKey::new(command, service_type))
    }

    /// Look up by operation string: `"check:ecs-fargate"`, or the legacy
    /// `"check-ecs-fargate"`, which is only tried when the colon form misses.
    pub fn get_descriptor(&self, platform: Platform, operation: &str) -> Option<&HandlerDescriptor> {
        let entries = self.handlers.get(&platform)?;
        if let Some(found) = HandlerKey::parse(operation).and_then(|k| entries.get(&k)) {
            return Some(found);
        }
        if operation.contains('-') {
            let legacy = HandlerKey::parse_legacy(operation)?;
            return entries.get(&legacy);
        }
        None
    }

    pub fn get(&self, platform: Platform, operation: &str) -> Option<&Handler> {
        self.get_descriptor(platform, operation).map(|d| &d.handler)
    }

    pub fn has(&self, platform: Platform, operation: &str) -> bool {
        self.get_descriptor(platform, operation).is_some()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self
            .handlers
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(p, _)| *p)
            .collect();
        platforms.sort();
        platforms
    }

    /// `"command:serviceType"` keys registered for a platform, sorted.
    pub fn operations(&self, platform: Platform) -> Vec<String> {
        self.handlers
            .get(&platform)
            .map(|entries| entries.keys().map(HandlerKey::to_string).collect())
            .unwrap_or_default()
    }

    pub fn descriptors(&self, platform: Platform) -> impl Iterator<Item = &HandlerDescriptor> {
        self.handlers
            .get(&platform)
            .into_iter()
            .flat_map(|entries| entries.values())
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
