//! Data request registry.
//!
//! Holds every subscription the caller has defined, whether or not the
//! server currently knows about it, together with the last value received
//! for it. The registry is the source of truth that is replayed to the
//! server at each session start.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::codec::{DataRequest, DataValue, ValueSize, STRSZ_REQ, STRSZ_UNIT};
use crate::error::{Result, WasimError};
use crate::protocol::RequestType;

/// Where a data request stands with the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// Stored locally, not yet sent in the current session.
    #[default]
    Queued,
    /// Sent, no acknowledgement or value seen yet.
    Pending,
    /// Acknowledged by the server or receiving values.
    Active,
    /// Rejected by the server, with its reason.
    Rejected(String),
}

/// Snapshot of a data request and its most recent value.
///
/// The [`Default`] value is the "not found" record: request id `u32::MAX`,
/// zero size, and [`RequestType::None`].
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequestRecord {
    pub request: DataRequest,
    /// Last value received, `None` before the first update.
    pub value: Option<DataValue>,
    /// Local time of the last update.
    pub last_update: Option<SystemTime>,
    pub status: SyncStatus,
}

impl Default for DataRequestRecord {
    fn default() -> Self {
        Self {
            request: DataRequest {
                request_id: u32::MAX,
                value_size: ValueSize::Bytes(0),
                request_type: RequestType::None,
                ..Default::default()
            },
            value: None,
            last_update: None,
            status: SyncStatus::Queued,
        }
    }
}

impl DataRequestRecord {
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request.request_id
    }

    /// False for the "not found" record.
    pub fn is_valid(&self) -> bool {
        self.request.request_type != RequestType::None
    }

    /// Last value as `f64`, if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_ref().and_then(DataValue::as_f64)
    }
}

/// What an upsert did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upsert {
    /// New id.
    Created,
    /// Value size or epsilon changed; the value channel must be reopened.
    Redefined,
    /// Other fields changed, or nothing changed at all.
    Updated,
}

struct RequestState {
    request: DataRequest,
    /// Byte length the id was first declared with. Never grows.
    capacity: u32,
    raw: Option<Bytes>,
    value: Option<DataValue>,
    last_update: Option<SystemTime>,
    status: SyncStatus,
}

impl RequestState {
    fn record(&self) -> DataRequestRecord {
        DataRequestRecord {
            request: self.request.clone(),
            value: self.value.clone(),
            last_update: self.last_update,
            status: self.status.clone(),
        }
    }
}

struct TrackedRequest {
    state: Mutex<RequestState>,
}

pub(crate) struct RequestRegistry {
    requests: RwLock<BTreeMap<u32, Arc<TrackedRequest>>>,
    max_value_size: u32,
    max_total_data: u64,
}

impl RequestRegistry {
    pub(crate) fn new(max_value_size: u32, max_total_data: u64) -> Self {
        Self {
            requests: RwLock::new(BTreeMap::new()),
            max_value_size,
            max_total_data,
        }
    }

    /// Check a definition without touching the registry.
    pub(crate) fn validate(&self, request: &DataRequest) -> Result<()> {
        if request.name_or_code.is_empty() {
            return Err(WasimError::invalid("data request name or code is empty"));
        }
        if request.name_or_code.len() >= STRSZ_REQ {
            return Err(WasimError::invalid(format!(
                "data request name or code exceeds {} bytes",
                STRSZ_REQ - 1
            )));
        }
        if request.unit_name.len() >= STRSZ_UNIT {
            return Err(WasimError::invalid(format!(
                "unit name exceeds {} bytes",
                STRSZ_UNIT - 1
            )));
        }
        let size = request.value_len();
        if size == 0 || size > self.max_value_size {
            return Err(WasimError::invalid(format!(
                "value size {size} is outside 1..={}",
                self.max_value_size
            )));
        }
        Ok(())
    }

    /// Insert or replace the definition for `request.request_id`.
    ///
    /// A redefinition may shrink the value but never grow it past the size
    /// the id was first declared with; such a call fails and leaves the entry
    /// untouched.
    pub(crate) fn upsert(&self, request: DataRequest) -> Result<Upsert> {
        self.validate(&request)?;
        let id = request.request_id;
        let size = request.value_len();

        let mut requests = self.requests.write();
        if let Some(tracked) = requests.get(&id) {
            let mut state = tracked.state.lock();
            if size > state.capacity {
                return Err(WasimError::invalid(format!(
                    "data request {id} cannot grow from {} to {size} bytes",
                    state.capacity
                )));
            }
            let redefined = size != state.request.value_len()
                || !epsilon_eq(request.delta_epsilon, state.request.delta_epsilon);
            if redefined {
                state.raw = None;
                state.value = None;
            }
            state.request = request;
            state.status = SyncStatus::Queued;
            return Ok(if redefined {
                Upsert::Redefined
            } else {
                Upsert::Updated
            });
        }

        let total: u64 = requests
            .values()
            .map(|tracked| tracked.state.lock().capacity as u64)
            .sum();
        if total + size as u64 > self.max_total_data {
            return Err(WasimError::invalid(format!(
                "data request {id} would exceed the {} byte total",
                self.max_total_data
            )));
        }

        requests.insert(
            id,
            Arc::new(TrackedRequest {
                state: Mutex::new(RequestState {
                    request,
                    capacity: size,
                    raw: None,
                    value: None,
                    last_update: None,
                    status: SyncStatus::Queued,
                }),
            }),
        );
        Ok(Upsert::Created)
    }

    pub(crate) fn remove(&self, id: u32) -> Option<DataRequest> {
        self.requests
            .write()
            .remove(&id)
            .map(|tracked| tracked.state.lock().request.clone())
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.requests.read().contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn definition(&self, id: u32) -> Option<DataRequest> {
        self.get_tracked(id)
            .map(|tracked| tracked.state.lock().request.clone())
    }

    pub(crate) fn record(&self, id: u32) -> Option<DataRequestRecord> {
        self.get_tracked(id).map(|tracked| tracked.state.lock().record())
    }

    pub(crate) fn records(&self) -> Vec<DataRequestRecord> {
        self.requests
            .read()
            .values()
            .map(|tracked| tracked.state.lock().record())
            .collect()
    }

    pub(crate) fn ids(&self) -> Vec<u32> {
        self.requests.read().keys().copied().collect()
    }

    /// All definitions, in id order.
    pub(crate) fn definitions(&self) -> Vec<DataRequest> {
        self.requests
            .read()
            .values()
            .map(|tracked| tracked.state.lock().request.clone())
            .collect()
    }

    pub(crate) fn set_status(&self, id: u32, status: SyncStatus) -> bool {
        match self.get_tracked(id) {
            Some(tracked) => {
                tracked.state.lock().status = status;
                true
            }
            None => false,
        }
    }

    /// Apply the server's answer to a submitted descriptor. Only requests
    /// still waiting for one are affected.
    pub(crate) fn acknowledge(&self, id: u32, result: std::result::Result<(), String>) {
        if let Some(tracked) = self.get_tracked(id) {
            let mut state = tracked.state.lock();
            if state.status == SyncStatus::Pending {
                state.status = match result {
                    Ok(()) => SyncStatus::Active,
                    Err(reason) => SyncStatus::Rejected(reason),
                };
            }
        }
    }

    pub(crate) fn set_all_status(&self, status: SyncStatus) {
        for tracked in self.requests.read().values() {
            tracked.state.lock().status = status.clone();
        }
    }

    /// Store a value update.
    ///
    /// Returns the updated record, or `None` when the change is below the
    /// request's epsilon and the update was discarded.
    pub(crate) fn apply_value(&self, id: u32, raw: &[u8]) -> Result<Option<DataRequestRecord>> {
        let tracked = self
            .get_tracked(id)
            .ok_or_else(|| WasimError::Protocol(format!("value for unknown request {id}")))?;
        let mut state = tracked.state.lock();

        let size = state.request.value_size;
        let len = state.request.value_len() as usize;
        if raw.len() < len {
            return Err(WasimError::Protocol(format!(
                "value for request {id} is {} bytes, expected {len}",
                raw.len()
            )));
        }
        let raw = &raw[..len];

        if !should_apply(
            size,
            state.request.delta_epsilon,
            state.raw.as_deref(),
            raw,
        ) {
            return Ok(None);
        }

        state.value = Some(DataValue::decode(size, raw)?);
        state.raw = Some(Bytes::copy_from_slice(raw));
        state.last_update = Some(SystemTime::now());
        state.status = SyncStatus::Active;
        Ok(Some(state.record()))
    }

    fn get_tracked(&self, id: u32) -> Option<Arc<TrackedRequest>> {
        self.requests.read().get(&id).cloned()
    }
}

fn epsilon_eq(a: f32, b: f32) -> bool {
    (a - b).abs() <= f32::EPSILON * a.abs().max(b.abs()).max(1.0)
}

/// Decide whether `new` replaces `old` under the given epsilon.
fn should_apply(size: ValueSize, epsilon: f32, old: Option<&[u8]>, new: &[u8]) -> bool {
    let Some(old) = old else {
        return true;
    };
    if epsilon < 0.0 {
        return true;
    }
    if epsilon == 0.0 || !size.is_numeric() {
        return old != new;
    }

    let (Ok(previous), Ok(next)) = (DataValue::decode(size, old), DataValue::decode(size, new))
    else {
        return old != new;
    };
    let (Some(previous), Some(next)) = (previous.as_f64(), next.as_f64()) else {
        return old != new;
    };

    let threshold = if size.is_integer() {
        epsilon.trunc() as f64
    } else {
        epsilon as f64
    };
    let delta = (next - previous).abs();
    if delta.is_nan() {
        return old != new;
    }
    delta > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RequestRegistry {
        RequestRegistry::new(8192, 1024 * 1024)
    }

    fn request(id: u32, size: ValueSize) -> DataRequest {
        DataRequest::named(id, 'L', "TEST_VAR", size)
    }

    #[test]
    fn test_default_record_is_not_found_sentinel() {
        let record = DataRequestRecord::default();
        assert_eq!(record.request_id(), u32::MAX);
        assert_eq!(record.request.value_size.byte_len(), 0);
        assert_eq!(record.request.request_type, RequestType::None);
        assert!(!record.is_valid());
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        let registry = registry();
        let empty = DataRequest::named(1, 'L', "", ValueSize::Float64);
        assert!(registry.upsert(empty).is_err());

        let long = DataRequest::named(1, 'L', "x".repeat(STRSZ_REQ), ValueSize::Float64);
        assert!(registry.upsert(long).is_err());

        let unit = request(1, ValueSize::Float64).unit("u".repeat(STRSZ_UNIT));
        assert!(registry.upsert(unit).is_err());

        let huge = request(1, ValueSize::Bytes(8193));
        assert!(registry.upsert(huge).is_err());
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn test_total_capacity_limit() {
        let registry = RequestRegistry::new(64, 100);
        registry.upsert(request(1, ValueSize::Bytes(64))).unwrap();
        let err = registry.upsert(request(2, ValueSize::Bytes(40))).unwrap_err();
        assert!(matches!(err, WasimError::InvalidArgument(_)));
        registry.upsert(request(2, ValueSize::Bytes(36))).unwrap();
    }

    #[test]
    fn test_size_never_grows_past_first_declaration() {
        let registry = registry();
        assert_eq!(
            registry.upsert(request(1, ValueSize::Float64)).unwrap(),
            Upsert::Created
        );
        assert_eq!(
            registry.upsert(request(1, ValueSize::Int32)).unwrap(),
            Upsert::Redefined
        );

        // Back to 8 bytes is still within the original capacity.
        assert_eq!(
            registry.upsert(request(1, ValueSize::Float64)).unwrap(),
            Upsert::Redefined
        );

        let err = registry.upsert(request(1, ValueSize::Bytes(16))).unwrap_err();
        assert!(matches!(err, WasimError::InvalidArgument(_)));
        assert_eq!(
            registry.definition(1).unwrap().value_size,
            ValueSize::Float64
        );
    }

    #[test]
    fn test_epsilon_change_is_redefinition() {
        let registry = registry();
        registry.upsert(request(1, ValueSize::Float64)).unwrap();
        assert_eq!(
            registry
                .upsert(request(1, ValueSize::Float64).epsilon(0.5))
                .unwrap(),
            Upsert::Redefined
        );
        assert_eq!(
            registry
                .upsert(request(1, ValueSize::Float64).epsilon(0.5).unit("feet"))
                .unwrap(),
            Upsert::Updated
        );
    }

    #[test]
    fn test_apply_value_decodes_and_activates() {
        let registry = registry();
        registry.upsert(request(1, ValueSize::Float64)).unwrap();

        let record = registry
            .apply_value(1, &1.5f64.to_le_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(record.value, Some(DataValue::F64(1.5)));
        assert_eq!(record.status, SyncStatus::Active);
        assert!(record.last_update.is_some());
    }

    #[test]
    fn test_apply_value_rejects_unknown_and_short() {
        let registry = registry();
        assert!(registry.apply_value(3, &[0; 8]).is_err());

        registry.upsert(request(3, ValueSize::Float64)).unwrap();
        assert!(registry.apply_value(3, &[0; 4]).is_err());
    }

    #[test]
    fn test_epsilon_zero_applies_any_change() {
        let registry = registry();
        registry.upsert(request(1, ValueSize::Float64)).unwrap();
        registry.apply_value(1, &1.0f64.to_le_bytes()).unwrap();

        assert!(registry.apply_value(1, &1.0f64.to_le_bytes()).unwrap().is_none());
        assert!(registry.apply_value(1, &1.0001f64.to_le_bytes()).unwrap().is_some());
    }

    #[test]
    fn test_epsilon_threshold_suppresses_small_changes() {
        let registry = registry();
        registry
            .upsert(request(1, ValueSize::Float64).epsilon(0.5))
            .unwrap();
        registry.apply_value(1, &10.0f64.to_le_bytes()).unwrap();

        assert!(registry.apply_value(1, &10.4f64.to_le_bytes()).unwrap().is_none());
        let record = registry
            .apply_value(1, &10.6f64.to_le_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(record.value, Some(DataValue::F64(10.6)));
    }

    #[test]
    fn test_negative_epsilon_always_applies() {
        let registry = registry();
        registry
            .upsert(request(1, ValueSize::Int32).epsilon(-1.0))
            .unwrap();
        registry.apply_value(1, &5i32.to_le_bytes()).unwrap();
        assert!(registry.apply_value(1, &5i32.to_le_bytes()).unwrap().is_some());
    }

    #[test]
    fn test_integer_epsilon_truncates() {
        assert!(should_apply(
            ValueSize::Int32,
            0.9,
            Some(&5i32.to_le_bytes()),
            &6i32.to_le_bytes()
        ));
        assert!(!should_apply(
            ValueSize::Int32,
            2.5,
            Some(&5i32.to_le_bytes()),
            &7i32.to_le_bytes()
        ));
    }

    #[test]
    fn test_string_values_compare_bytes() {
        assert!(!should_apply(
            ValueSize::Bytes(4),
            10.0,
            Some(b"abc\0"),
            b"abc\0"
        ));
        assert!(should_apply(ValueSize::Bytes(4), 10.0, Some(b"abc\0"), b"abd\0"));
    }

    #[test]
    fn test_acknowledge_only_touches_pending() {
        let registry = registry();
        registry.upsert(request(1, ValueSize::Float64)).unwrap();

        registry.acknowledge(1, Ok(()));
        assert_eq!(registry.record(1).unwrap().status, SyncStatus::Queued);

        registry.set_status(1, SyncStatus::Pending);
        registry.acknowledge(1, Err("unknown variable".into()));
        assert_eq!(
            registry.record(1).unwrap().status,
            SyncStatus::Rejected("unknown variable".into())
        );
    }

    #[test]
    fn test_redefinition_clears_value_and_requeues() {
        let registry = registry();
        registry.upsert(request(1, ValueSize::Float64)).unwrap();
        registry.apply_value(1, &2.0f64.to_le_bytes()).unwrap();

        registry.upsert(request(1, ValueSize::Float32)).unwrap();
        let record = registry.record(1).unwrap();
        assert_eq!(record.value, None);
        assert_eq!(record.status, SyncStatus::Queued);
    }
}
