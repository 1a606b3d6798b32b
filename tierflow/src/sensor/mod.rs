//! Event sensor: turns file-arrival notifications into dispatch requests.

mod dispatcher;
mod notification;
mod service;

pub use dispatcher::{
    CycleReport, DispatcherConfig, PartialMessagePolicy, PendingAck, QueueDispatcher,
};
pub use notification::{
    FileArrival, InvalidRecord, MalformedMessage, ParsedNotification, decode_key,
    parse_notification,
};
pub use service::{SensorConfig, SensorService};
