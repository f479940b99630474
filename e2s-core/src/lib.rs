//! e2s core library: domain types and the pure building blocks of the
//! Encompass → Samsara reconciliation.
//!
//! Public API surface:
//! - [`types`]: newtypes, source/destination records, write payloads
//! - [`driver`]: payroll driver rows and destination drivers
//! - [`normalize`] / [`fingerprint`]: canonical text and content digests
//! - [`external_id`]: external-id sanitization and legacy key aliases
//! - [`tags`]: tag directory and scope/quarantine tag resolution
//! - [`denylist`]: destination records that are never mutated
//! - [`config`]: run configuration loaded from YAML
//! - [`error`]: [`CoreError`] and the record-scoped [`RecordError`]

pub mod config;
pub mod denylist;
pub mod driver;
pub mod error;
pub mod external_id;
pub mod fingerprint;
pub mod geo;
pub mod normalize;
pub mod tags;
pub mod types;

pub use config::{RetryPolicy, SyncConfig};
pub use denylist::Denylist;
pub use driver::{
    ActivationStatus, DestinationDriver, DriverId, DriverPatch, DriverPayload, DriverSource,
    EmploymentStatus,
};
pub use error::{CoreError, RecordError};
pub use fingerprint::{Fingerprint, RecordKind};
pub use normalize::Normalizer;
pub use tags::{TagDirectory, TagResolver};
pub use types::{
    AccountStatus, AddressId, AddressPatch, AddressPayload, CircleGeofence, DestinationRecord,
    Geofence, GeoPoint, PolygonGeofence, RowAction, SourceCoordinates, SourceId, SourceRecord, Tag,
    TagId,
};
