//! Built-in fleetsync extensions.
//!
//! | kind | default name | capability |
//! |---|---|---|
//! | `webhook_notifier` | `webhook` | notifier |
//! | `webhook_trigger` | `webhook_trigger` | trigger |
//! | `deploy_tracker` | `deploy_tracker` | monitor |
//!
//! Each is enabled by a manifest in the plugins directory:
//!
//! ```yaml
//! kind: webhook_notifier
//! name: ops-webhook
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod deploy_tracker;
pub mod webhook_notifier;
pub mod webhook_trigger;

use fleetsync_modules::{ExtensionCatalog, Registered};

pub use deploy_tracker::{DeployTracker, DeploymentRecord};
pub use webhook_notifier::{WebhookNotifier, WebhookNotifierConfig};
pub use webhook_trigger::{WebhookTrigger, WebhookTriggerConfig};

/// Constructors for every built-in kind.
pub fn builtin_catalog() -> ExtensionCatalog {
    ExtensionCatalog::new()
        .with(webhook_notifier::KIND, |m| {
            Ok(Registered::plugin(WebhookNotifier::new(
                m.name_or(webhook_notifier::DEFAULT_NAME),
            )))
        })
        .with(webhook_trigger::KIND, |m| {
            Ok(Registered::plugin(WebhookTrigger::new(
                m.name_or(webhook_trigger::DEFAULT_NAME),
            )))
        })
        .with(deploy_tracker::KIND, |m| {
            Ok(Registered::plugin(DeployTracker::new(
                m.name_or(deploy_tracker::DEFAULT_NAME),
            )))
        })
}
