//! Seams between the reconciliation core and the destination APIs.
//!
//! The binary implements [`AddressApi`] and [`DriverApi`] over HTTP; tests
//! use in-memory fakes. Every method is one logical request (list calls handle pagination
//! internally) and reports failures as a typed [`ApiError`].

use e2s_core::{
    AddressId, AddressPatch, AddressPayload, DestinationDriver, DestinationRecord, DriverId,
    DriverPatch, DriverPayload, Tag,
};

use crate::error::ApiError;

pub trait AddressApi {
    /// The full tag directory.
    fn list_tags(&mut self) -> Result<Vec<Tag>, ApiError>;

    /// Every address visible to the token.
    fn list_addresses(&mut self) -> Result<Vec<DestinationRecord>, ApiError>;

    /// Creates an address and returns the destination-assigned id.
    fn create_address(&mut self, payload: &AddressPayload) -> Result<AddressId, ApiError>;

    fn patch_address(&mut self, id: &AddressId, patch: &AddressPatch) -> Result<(), ApiError>;

    fn delete_address(&mut self, id: &AddressId) -> Result<(), ApiError>;
}

pub trait DriverApi {
    /// The full tag directory.
    fn list_tags(&mut self) -> Result<Vec<Tag>, ApiError>;

    /// Every driver, active and deactivated.
    fn list_drivers(&mut self) -> Result<Vec<DestinationDriver>, ApiError>;

    /// Creates a driver and returns the destination-assigned id.
    fn create_driver(&mut self, payload: &DriverPayload) -> Result<DriverId, ApiError>;

    fn patch_driver(&mut self, id: &DriverId, patch: &DriverPatch) -> Result<(), ApiError>;
}
