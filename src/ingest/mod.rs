//! Upstream observation sources.
//!
//! The collector only depends on `ObservationSource`; `bousai` is the HTTP
//! client for the prefecture's telemetry pages. Tests substitute scripted
//! sources.

pub mod bousai;

use crate::model::{FetchError, RawFields, Timestamp};
use crate::stations::Station;

/// Returns the raw field values one station published for bucket `obsdt`.
///
/// Implementations do not retry; a failed fetch fails the cycle and the next
/// scheduled run tries again.
pub trait ObservationSource {
    fn fetch(&self, obsdt: Timestamp, station: &Station) -> Result<RawFields, FetchError>;
}

impl<S: ObservationSource + ?Sized> ObservationSource for Box<S> {
    fn fetch(&self, obsdt: Timestamp, station: &Station) -> Result<RawFields, FetchError> {
        (**self).fetch(obsdt, station)
    }
}
