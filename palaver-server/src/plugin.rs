//! Plugin hook: trusted interceptors over a fixed capability API.
//!
//! Plugins are registered as factories and instantiated by the
//! [`PluginManager`]. On every chat message the loaded plugins are
//! offered the raw submission in registration order; the first one
//! that returns `true` claims it, and the pipeline neither persists
//! nor broadcasts (the plugin owns any side effects).
//!
//! Toggling a plugin's enabled state unloads and reloads the whole
//! set. Plugin-local state is lost on toggle — an accepted limitation,
//! not an oversight.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::proto::QuotedMessage;

/// The raw, validated chat submission offered to interceptors.
#[derive(Debug, Clone)]
pub struct ChatSubmission {
    /// Verified author (from the credential, not client-claimed).
    pub username: String,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub quoted_message: Option<QuotedMessage>,
    pub mentions: Vec<String>,
}

/// Capabilities the server exposes to plugins.
pub trait PluginHost: Send + Sync {
    /// Broadcast a chat message to everyone (bypassing the pipeline).
    fn send_message(
        &self,
        username: &str,
        text: Option<&str>,
        image_url: Option<&str>,
        quoted_message: Option<&QuotedMessage>,
        mentions: &[String],
    );
    /// Snapshot of online usernames.
    fn online_users(&self) -> Vec<String>;
    /// Usernames with the admin flag set, from the store.
    fn admin_users(&self) -> Vec<String>;
    /// Mute or unmute a user, broadcasting the status change.
    /// Returns false if the user does not exist.
    fn set_muted(&self, username: &str, muted: bool) -> bool;
    fn is_muted(&self, username: &str) -> bool;
    /// The pub/sub bus shared by the plugin set.
    fn bus(&self) -> &Bus;
}

/// A loadable plugin. Implementations must be stateless across
/// reloads or tolerate losing state on toggle.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    fn version(&self) -> &str {
        "0.1.0"
    }
    /// A plugin may declare itself disabled; it is then skipped at
    /// load time entirely.
    fn enabled(&self) -> bool {
        true
    }
    fn on_load(&self, _host: &dyn PluginHost) {}
    /// Return true to claim the message and stop the pipeline.
    fn on_chat_message(&self, _msg: &ChatSubmission, _host: &dyn PluginHost) -> bool {
        false
    }
}

/// Admin-facing plugin metadata.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub version: String,
    pub enabled: bool,
}

pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Handle returned by [`Bus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionId {
    topic: String,
    id: u64,
}

type Handler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Small pub/sub registry scoped to the plugin set.
#[derive(Default)]
pub struct Bus {
    topics: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(&serde_json::Value) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionId {
            topic: topic.to_string(),
            id,
        }
    }

    pub fn unsubscribe(&self, sub: &SubscriptionId) {
        if let Some(handlers) = self.topics.lock().get_mut(&sub.topic) {
            handlers.retain(|(id, _)| *id != sub.id);
        }
    }

    /// Deliver to all subscribers of the topic. Handlers run outside
    /// the lock so they may publish or subscribe re-entrantly.
    pub fn publish(&self, topic: &str, payload: &serde_json::Value) {
        let handlers: Vec<Handler> = self
            .topics
            .lock()
            .get(topic)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(payload);
        }
    }

    /// Drop all subscriptions (called when the plugin set reloads).
    fn clear(&self) {
        self.topics.lock().clear();
    }
}

/// Owns the plugin registry and the loaded interceptor chain.
pub struct PluginManager {
    factories: Vec<(String, PluginFactory)>,
    disabled: Mutex<HashSet<String>>,
    loaded: Mutex<Vec<Box<dyn Plugin>>>,
    bus: Bus,
}

impl PluginManager {
    pub fn new(factories: Vec<(String, PluginFactory)>) -> Self {
        Self {
            factories,
            disabled: Mutex::new(HashSet::new()),
            loaded: Mutex::new(Vec::new()),
            bus: Bus::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// (Re)instantiate the plugin set, dropping every previously
    /// loaded instance and all bus subscriptions.
    pub fn load(&self, host: &dyn PluginHost) {
        self.bus.clear();
        let disabled = self.disabled.lock().clone();
        let mut loaded = Vec::new();
        for (name, factory) in &self.factories {
            if disabled.contains(name) {
                tracing::info!("Plugin {name} is disabled, not loading");
                continue;
            }
            let plugin = factory();
            if !plugin.enabled() {
                tracing::info!("Plugin {name} declares itself disabled, not loading");
                continue;
            }
            plugin.on_load(host);
            tracing::info!("Loaded plugin {} v{}", plugin.name(), plugin.version());
            loaded.push(plugin);
        }
        *self.loaded.lock() = loaded;
    }

    /// Offer a submission to the chain in registration order. A
    /// panicking plugin is logged and treated as declining.
    pub fn dispatch(&self, msg: &ChatSubmission, host: &dyn PluginHost) -> bool {
        let loaded = self.loaded.lock();
        for plugin in loaded.iter() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                plugin.on_chat_message(msg, host)
            }));
            match outcome {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => {
                    tracing::error!("Plugin {} panicked handling a message", plugin.name());
                }
            }
        }
        false
    }

    /// Loaded (enabled) plugins only; disabled ones are not listed.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.loaded
            .lock()
            .iter()
            .map(|p| PluginInfo {
                name: p.name().to_string(),
                description: p.description().to_string(),
                version: p.version().to_string(),
                enabled: true,
            })
            .collect()
    }

    /// Enable or disable a registered plugin, then reload the whole
    /// set. Returns false if no plugin with that name is registered.
    pub fn toggle(&self, name: &str, enabled: bool, host: &dyn PluginHost) -> bool {
        if !self.factories.iter().any(|(n, _)| n == name) {
            return false;
        }
        {
            let mut disabled = self.disabled.lock();
            if enabled {
                disabled.remove(name);
            } else {
                disabled.insert(name.to_string());
            }
        }
        self.load(host);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Host stub: records sent messages, everything else is inert.
    #[derive(Default)]
    struct StubHost {
        sent: Mutex<Vec<String>>,
        bus: Bus,
    }

    impl PluginHost for StubHost {
        fn send_message(
            &self,
            username: &str,
            text: Option<&str>,
            _image_url: Option<&str>,
            _quoted_message: Option<&QuotedMessage>,
            _mentions: &[String],
        ) {
            self.sent
                .lock()
                .push(format!("{username}: {}", text.unwrap_or("")));
        }
        fn online_users(&self) -> Vec<String> {
            vec!["alice".into()]
        }
        fn admin_users(&self) -> Vec<String> {
            vec!["admin".into()]
        }
        fn set_muted(&self, _username: &str, _muted: bool) -> bool {
            true
        }
        fn is_muted(&self, _username: &str) -> bool {
            false
        }
        fn bus(&self) -> &Bus {
            &self.bus
        }
    }

    struct EchoPlugin {
        claims: bool,
        calls: Arc<AtomicUsize>,
    }

    impl Plugin for EchoPlugin {
        fn name(&self) -> &str {
            "echo"
        }
        fn on_chat_message(&self, msg: &ChatSubmission, host: &dyn PluginHost) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.claims {
                host.send_message("System", msg.text.as_deref(), None, None, &[]);
            }
            self.claims
        }
    }

    fn submission(text: &str) -> ChatSubmission {
        ChatSubmission {
            username: "alice".into(),
            text: Some(text.into()),
            image_url: None,
            quoted_message: None,
            mentions: Vec::new(),
        }
    }

    fn factory(name: &str, claims: bool, calls: Arc<AtomicUsize>) -> (String, PluginFactory) {
        let f: PluginFactory = Arc::new(move || {
            Box::new(EchoPlugin {
                claims,
                calls: Arc::clone(&calls),
            })
        });
        (name.to_string(), f)
    }

    #[test]
    fn first_claiming_plugin_stops_the_chain() {
        let host = StubHost::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let manager = PluginManager::new(vec![
            factory("claimer", true, Arc::clone(&first)),
            factory("bystander", false, Arc::clone(&second)),
        ]);
        manager.load(&host);

        assert!(manager.dispatch(&submission("hi"), &host));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        // The claimer ran its own side effect; the chain stopped there.
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(host.sent.lock().as_slice(), ["System: hi"]);
    }

    #[test]
    fn declining_chain_falls_through() {
        let host = StubHost::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = PluginManager::new(vec![factory("bystander", false, Arc::clone(&calls))]);
        manager.load(&host);
        assert!(!manager.dispatch(&submission("hi"), &host));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn toggle_reloads_and_drops_plugin_state() {
        let host = StubHost::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = PluginManager::new(vec![factory("echo", false, Arc::clone(&calls))]);
        manager.load(&host);
        manager.dispatch(&submission("one"), &host);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Disable: excluded from chain and from the admin list.
        assert!(manager.toggle("echo", false, &host));
        assert!(manager.list().is_empty());
        manager.dispatch(&submission("two"), &host);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Re-enable: a fresh instance is built by the factory.
        assert!(manager.toggle("echo", true, &host));
        assert_eq!(manager.list().len(), 1);
        assert!(!manager.toggle("unknown", true, &host));
    }

    #[test]
    fn self_disabled_plugin_is_never_loaded() {
        struct Dormant;
        impl Plugin for Dormant {
            fn name(&self) -> &str {
                "dormant"
            }
            fn enabled(&self) -> bool {
                false
            }
            fn on_chat_message(&self, _: &ChatSubmission, _: &dyn PluginHost) -> bool {
                true
            }
        }
        let host = StubHost::default();
        let f: PluginFactory = Arc::new(|| Box::new(Dormant));
        let manager = PluginManager::new(vec![("dormant".to_string(), f)]);
        manager.load(&host);
        assert!(manager.list().is_empty());
        assert!(!manager.dispatch(&submission("hi"), &host));
    }

    #[test]
    fn panicking_plugin_declines_instead_of_aborting() {
        struct Bomb;
        impl Plugin for Bomb {
            fn name(&self) -> &str {
                "bomb"
            }
            fn on_chat_message(&self, _: &ChatSubmission, _: &dyn PluginHost) -> bool {
                panic!("boom");
            }
        }
        let host = StubHost::default();
        let bomb: PluginFactory = Arc::new(|| Box::new(Bomb));
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = PluginManager::new(vec![
            ("bomb".to_string(), bomb),
            factory("after", true, Arc::clone(&calls)),
        ]);
        manager.load(&host);
        // The panic is swallowed; the next plugin still claims.
        assert!(manager.dispatch(&submission("hi"), &host));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bus_delivers_and_unsubscribes() {
        let bus = Bus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let flagged = Arc::new(AtomicBool::new(false));

        let seen2 = Arc::clone(&seen);
        let sub = bus.subscribe("tick", move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        let flagged2 = Arc::clone(&flagged);
        bus.subscribe("tick", move |payload| {
            if payload["n"] == 2 {
                flagged2.store(true, Ordering::SeqCst);
            }
        });

        bus.publish("tick", &serde_json::json!({"n": 1}));
        bus.publish("other", &serde_json::json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        bus.unsubscribe(&sub);
        bus.publish("tick", &serde_json::json!({"n": 2}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(flagged.load(Ordering::SeqCst));
    }

    #[test]
    fn reload_clears_bus_subscriptions() {
        struct Subscriber {
            count: Arc<AtomicUsize>,
        }
        impl Plugin for Subscriber {
            fn name(&self) -> &str {
                "subscriber"
            }
            fn on_load(&self, host: &dyn PluginHost) {
                let count = Arc::clone(&self.count);
                host.bus().subscribe("ping", move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let f: PluginFactory = Arc::new(move || {
            Box::new(Subscriber {
                count: Arc::clone(&count2),
            })
        });
        let manager = PluginManager::new(vec![("subscriber".to_string(), f)]);

        // The manager's own bus is what on_load subscribes against, so
        // drive it through a host whose bus *is* the manager's.
        struct BusHost<'a>(&'a Bus);
        impl PluginHost for BusHost<'_> {
            fn send_message(
                &self,
                _: &str,
                _: Option<&str>,
                _: Option<&str>,
                _: Option<&QuotedMessage>,
                _: &[String],
            ) {
            }
            fn online_users(&self) -> Vec<String> {
                Vec::new()
            }
            fn admin_users(&self) -> Vec<String> {
                Vec::new()
            }
            fn set_muted(&self, _: &str, _: bool) -> bool {
                false
            }
            fn is_muted(&self, _: &str) -> bool {
                false
            }
            fn bus(&self) -> &Bus {
                self.0
            }
        }

        {
            let host = BusHost(manager.bus());
            manager.load(&host);
        }
        manager.bus().publish("ping", &serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        {
            let host = BusHost(manager.bus());
            manager.load(&host);
        }
        // Old subscription was cleared; the fresh instance resubscribed
        // exactly once.
        manager.bus().publish("ping", &serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
