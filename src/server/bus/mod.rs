pub mod service;

pub use service::{EventBus, Subscription};
