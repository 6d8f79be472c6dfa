//! Event bus connecting the reconciler and extensions.
//!
//! - **Patterns**: exact type names or `prefix*` wildcards
//! - **Dispatch**: one tracked task per matching handler, panics isolated
//! - **Registration**: optional per-type metadata used for introspection and warnings
//!
//! # Example
//!
//! ```ignore
//! use fleetsync_events::{Event, EventBus, listener};
//!
//! let bus = EventBus::new();
//! bus.subscribe("deploy_*", listener(|event| async move {
//!     println!("{} from {}", event.event_type, event.source);
//! })).await;
//! bus.publish(Event::new("deploy_success", "reconciler")).await;
//! bus.drain().await;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod bus;
pub mod error;
pub mod event;

pub use bus::{EventBus, EventPattern, Listener, listener};
pub use error::{Error, Result};
pub use event::{Event, EventTypeDesc, PayloadField};
