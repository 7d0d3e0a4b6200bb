mod cloud_events;
pub use cloud_events::{CloudEventsMessage, JsonCloudEventsLayer, JsonCloudEventsService};
