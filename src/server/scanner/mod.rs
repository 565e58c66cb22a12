pub mod driver;
pub mod events;
pub mod xml;

pub use driver::{DriverEvent, NmapDriver, ScanDriver, ScanError};
pub use events::{
    HostRecord, OsMatchObservation, PortObservation, PortStateKind, ScanEvent, ScanEventKind,
    ScanStage,
};
