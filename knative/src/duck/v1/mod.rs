pub mod addressable_type;
pub mod knative_reference;
pub mod sink_uri;
pub mod source_types;
pub mod status_types;

pub use addressable_type::{
    AddressAdapter, Addressable, AddressableErr, AddressableStatus, AddressableType, ServiceAddress,
    StatusAddress,
};
pub use knative_reference::{KReference, Subject};
pub use sink_uri::{SinkUri, SinkUriErr};
pub use source_types::{
    CloudEventAttributes, CloudEventOverrides, Destination, SinkManager, SourceCondition,
    SourceConditionManager, SourceConditionType, SourceSpec, SourceStatus,
};
pub use status_types::Status;
