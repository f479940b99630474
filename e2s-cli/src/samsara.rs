//! Blocking HTTP client for the Samsara address, driver and tag endpoints.
//!
//! Each [`AddressApi`] and [`DriverApi`] call is one logical request; list calls walk every
//! page before returning. Retries are the caller's concern (the retrier
//! wraps whole calls), but an optional minimum spacing between requests is
//! enforced here.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use e2s_core::{
    AddressId, AddressPatch, AddressPayload, DestinationDriver, DestinationRecord, DriverId,
    DriverPatch, DriverPayload, Geofence, Tag, TagId,
};
use e2s_sync::{AddressApi, ApiError, DriverApi};

pub const DEFAULT_BASE_URL: &str = "https://api.samsara.com";
const PAGE_LIMIT: &str = "512";
const TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 400;

pub struct SamsaraClient {
    agent: ureq::Agent,
    base_url: String,
    auth: String,
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl SamsaraClient {
    pub fn new(base_url: &str, token: &str, min_interval: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(TIMEOUT)
            .user_agent(concat!("e2s/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_owned(),
            auth: format!("Bearer {token}"),
            min_interval,
            last_call: None,
        }
    }

    fn throttle(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        self.last_call = Some(Instant::now());
    }

    fn send<B: Serialize>(
        &mut self,
        method: &str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<ureq::Response, ApiError> {
        self.throttle();
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .agent
            .request(method, &url)
            .set("Authorization", &self.auth)
            .set("Accept", "application/json");
        for (key, value) in query {
            request = request.query(key, value);
        }
        tracing::debug!("{method} {path}");
        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        result.map_err(classify)
    }

    fn read_json<T: DeserializeOwned>(response: ureq::Response) -> Result<T, ApiError> {
        response
            .into_json()
            .map_err(|e| ApiError::Transport(format!("invalid response body: {e}")))
    }

    fn list_all<T: DeserializeOwned>(&mut self, path: &str) -> Result<Vec<T>, ApiError> {
        self.list_all_with(path, &[])
    }

    fn list_all_with<T: DeserializeOwned>(
        &mut self,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Result<Vec<T>, ApiError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("limit", PAGE_LIMIT)];
            query.extend_from_slice(extra);
            if let Some(after) = cursor.as_deref() {
                query.push(("after", after));
            }
            let response = self.send::<()>("GET", path, &query, None)?;
            let page: Page<T> = Self::read_json(response)?;
            let next_cursor = page.next_cursor();
            out.extend(page.data);
            match next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }
        tracing::debug!("{path}: {} items", out.len());
        Ok(out)
    }
}

fn classify(err: ureq::Error) -> ApiError {
    match err {
        ureq::Error::Status(status, response) => {
            let retry_after = response.header("Retry-After").map(str::to_owned);
            let mut body = response.into_string().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            ApiError::from_status(status, body, retry_after.as_deref())
        }
        ureq::Error::Transport(transport) => ApiError::Transport(transport.to_string()),
    }
}

impl AddressApi for SamsaraClient {
    fn list_tags(&mut self) -> Result<Vec<Tag>, ApiError> {
        self.list_all("/tags")
    }

    fn list_addresses(&mut self) -> Result<Vec<DestinationRecord>, ApiError> {
        let wire: Vec<WireAddress> = self.list_all("/addresses")?;
        Ok(wire.into_iter().map(DestinationRecord::from).collect())
    }

    fn create_address(&mut self, payload: &AddressPayload) -> Result<AddressId, ApiError> {
        let response = self.send("POST", "/addresses", &[], Some(payload))?;
        let created: Envelope<Created> = Self::read_json(response)?;
        Ok(AddressId::from(created.data.id))
    }

    fn patch_address(&mut self, id: &AddressId, patch: &AddressPatch) -> Result<(), ApiError> {
        self.send("PATCH", &format!("/addresses/{id}"), &[], Some(patch))?;
        Ok(())
    }

    fn delete_address(&mut self, id: &AddressId) -> Result<(), ApiError> {
        self.send::<()>("DELETE", &format!("/addresses/{id}"), &[], None)?;
        Ok(())
    }
}

impl DriverApi for SamsaraClient {
    fn list_tags(&mut self) -> Result<Vec<Tag>, ApiError> {
        self.list_all("/tags")
    }

    /// Active drivers, then deactivated ones; the endpoint lists one status
    /// per query.
    fn list_drivers(&mut self) -> Result<Vec<DestinationDriver>, ApiError> {
        let mut wire: Vec<WireDriver> = self.list_all("/fleet/drivers")?;
        wire.extend(self.list_all_with::<WireDriver>(
            "/fleet/drivers",
            &[("driverActivationStatus", "deactivated")],
        )?);
        Ok(wire.into_iter().map(DestinationDriver::from).collect())
    }

    fn create_driver(&mut self, payload: &DriverPayload) -> Result<DriverId, ApiError> {
        let response = self.send("POST", "/fleet/drivers", &[], Some(payload))?;
        let created: Envelope<Created> = Self::read_json(response)?;
        Ok(DriverId::from(created.data.id))
    }

    fn patch_driver(&mut self, id: &DriverId, patch: &DriverPatch) -> Result<(), ApiError> {
        self.send("PATCH", &format!("/fleet/drivers/{id}"), &[], Some(patch))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    #[serde(default)]
    end_cursor: Option<String>,
    #[serde(default)]
    has_next_page: bool,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    pagination: Option<Pagination>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl<T> Page<T> {
    /// Cursor for the following page, from either pagination style.
    fn next_cursor(&self) -> Option<String> {
        let from_pagination = self.pagination.as_ref().and_then(|p| {
            p.next_page_token
                .clone()
                .or_else(|| p.end_cursor.clone().filter(|_| p.has_next_page))
        });
        self.next_page_token
            .clone()
            .or(from_pagination)
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// `{"data": {"id": ...}}` returned by create calls.
#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireTagRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAddress {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    formatted_address: String,
    #[serde(default)]
    geofence: Option<serde_json::Value>,
    #[serde(default)]
    tags: Vec<WireTagRef>,
    #[serde(default)]
    tag_ids: Vec<String>,
    #[serde(default)]
    external_ids: BTreeMap<String, serde_json::Value>,
}

fn string_ids(raw: BTreeMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    raw.into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            serde_json::Value::Number(n) => Some((k, n.to_string())),
            _ => None,
        })
        .collect()
}

fn merged_tag_ids(tags: Vec<WireTagRef>, tag_ids: Vec<String>) -> BTreeSet<TagId> {
    tags.into_iter()
        .map(|t| t.id)
        .chain(tag_ids)
        .filter(|t| !t.is_empty())
        .map(TagId::from)
        .collect()
}

impl From<WireAddress> for DestinationRecord {
    fn from(wire: WireAddress) -> Self {
        let geofence = wire.geofence.and_then(|value| {
            serde_json::from_value::<Geofence>(value)
                .map_err(|e| tracing::warn!("address {}: unreadable geofence: {e}", wire.id))
                .ok()
        });
        DestinationRecord {
            id: AddressId::from(wire.id),
            name: wire.name,
            formatted_address: wire.formatted_address,
            geofence,
            tag_ids: merged_tag_ids(wire.tags, wire.tag_ids),
            external_ids: string_ids(wire.external_ids),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDriver {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    phone: String,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    driver_activation_status: Option<String>,
    #[serde(default)]
    tags: Vec<WireTagRef>,
    #[serde(default)]
    tag_ids: Vec<String>,
    #[serde(default)]
    external_ids: BTreeMap<String, serde_json::Value>,
}

impl From<WireDriver> for DestinationDriver {
    fn from(wire: WireDriver) -> Self {
        let is_deactivated = wire
            .driver_activation_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("deactivated"));
        DestinationDriver {
            id: DriverId::from(wire.id),
            name: wire.name,
            username: wire.username.filter(|u| !u.trim().is_empty()),
            phone: wire.phone,
            time_zone: wire.timezone.filter(|tz| !tz.trim().is_empty()),
            is_deactivated,
            tag_ids: merged_tag_ids(wire.tags, wire.tag_ids),
            external_ids: string_ids(wire.external_ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_address_maps_tags_ids_and_geofence() {
        let wire: WireAddress = serde_json::from_value(serde_json::json!({
            "id": "281474",
            "name": "Acme Store",
            "formattedAddress": "1 Main St",
            "geofence": {"circle": {"latitude": 30.0, "longitude": -97.0, "radiusMeters": 50}},
            "tags": [{"id": "t1", "name": "ManagedBy:EncompassSync"}],
            "externalIds": {"encompassid": "C100", "legacy": 42, "junk": null}
        }))
        .expect("wire");
        let record = DestinationRecord::from(wire);
        assert_eq!(record.id.0, "281474");
        assert!(record.tag_ids.contains(&TagId::from("t1")));
        assert_eq!(record.external_ids["encompassid"], "C100");
        assert_eq!(record.external_ids["legacy"], "42");
        assert!(!record.external_ids.contains_key("junk"));
        assert!(matches!(record.geofence, Some(Geofence::Circle(_))));
    }

    #[test]
    fn wire_driver_maps_status_tags_and_codes() {
        let wire: WireDriver = serde_json::from_value(serde_json::json!({
            "id": "52",
            "name": "Jo Smith",
            "username": "jsmith",
            "phone": "5125550100",
            "timezone": "America/Chicago",
            "driverActivationStatus": "deactivated",
            "tags": [{"id": "t9", "name": "ManagedBy:PaycomSync"}],
            "externalIds": {"employeeCode": "E1", "badge": 7}
        }))
        .expect("wire");
        let driver = DestinationDriver::from(wire);
        assert_eq!(driver.id, DriverId::from("52"));
        assert!(driver.is_deactivated);
        assert_eq!(driver.employee_code(), Some("E1"));
        assert_eq!(driver.external_ids["badge"], "7");
        assert!(driver.tag_ids.contains(&TagId::from("t9")));
        assert_eq!(driver.time_zone.as_deref(), Some("America/Chicago"));

        let bare: WireDriver =
            serde_json::from_value(serde_json::json!({"id": "53", "username": " "}))
                .expect("wire");
        let bare = DestinationDriver::from(bare);
        assert!(!bare.is_deactivated);
        assert_eq!(bare.username, None);
    }

    #[test]
    fn unreadable_geofence_is_dropped() {
        let wire: WireAddress = serde_json::from_value(serde_json::json!({
            "id": "1",
            "geofence": {"settings": {}}
        }))
        .expect("wire");
        assert_eq!(DestinationRecord::from(wire).geofence, None);
    }

    #[test]
    fn next_cursor_reads_both_pagination_styles() {
        let page: Page<Tag> = serde_json::from_value(serde_json::json!({
            "data": [],
            "pagination": {"endCursor": "abc", "hasNextPage": true}
        }))
        .expect("page");
        assert_eq!(page.next_cursor().as_deref(), Some("abc"));

        let last: Page<Tag> = serde_json::from_value(serde_json::json!({
            "data": [],
            "pagination": {"endCursor": "abc", "hasNextPage": false}
        }))
        .expect("page");
        assert_eq!(last.next_cursor(), None);

        let token: Page<Tag> =
            serde_json::from_value(serde_json::json!({"nextPageToken": "p2"})).expect("page");
        assert_eq!(token.next_cursor().as_deref(), Some("p2"));
    }
}
