//! Topic discovery and rule subscriptions
//!
//! [`SubscriptionManager`] runs one engine pair per configured rule and uses
//! [`TopicDiscovery`] to rebuild pattern-based rules when new matching
//! topics appear.

pub mod discovery;
pub mod manager;

pub use discovery::{TopicDiscovery, TopicSelector};
pub use manager::{ManagerDependencies, SubscriptionManager};
