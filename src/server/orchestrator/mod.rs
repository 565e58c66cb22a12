pub mod service;

pub use service::ScanOrchestrator;
