//! Marker command/event payloads.
//!
//! Markers are the specialised command/event pairs the engine uses to persist
//! side-effect results in history. Names and detail keys are part of the wire
//! contract and must stay stable.

use crate::command::RecordMarkerAttributes;
use crate::failure::Failure;
use crate::history::{EventAttributes, HistoryEvent};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub const SIDE_EFFECT_MARKER_NAME: &str = "SideEffect";
pub const MUTABLE_SIDE_EFFECT_MARKER_NAME: &str = "MutableSideEffect";
pub const VERSION_MARKER_NAME: &str = "Version";
pub const LOCAL_ACTIVITY_MARKER_NAME: &str = "LocalActivity";

pub const MARKER_ID_KEY: &str = "id";
pub const MARKER_DATA_KEY: &str = "data";
pub const MARKER_CHANGE_ID_KEY: &str = "changeId";
pub const MARKER_VERSION_KEY: &str = "version";
pub const MARKER_ACTIVITY_ID_KEY: &str = "activityId";
pub const MARKER_ACTIVITY_TYPE_KEY: &str = "activityType";
pub const MARKER_RESULT_KEY: &str = "result";
pub const MARKER_FAILURE_KEY: &str = "failure";
pub const MARKER_REPLAY_TIME_KEY: &str = "replayTimeMillis";
pub const MARKER_ATTEMPT_KEY: &str = "attempt";
pub const MARKER_BACKOFF_KEY: &str = "backoff";

/// The marker attributes of an event, if it is a marker event.
pub fn marker_attributes(event: &HistoryEvent) -> Option<&RecordMarkerAttributes> {
    match &event.attributes {
        EventAttributes::MarkerRecorded(attributes) => Some(attributes),
        _ => None,
    }
}

/// True if the event is a marker event with the given marker name.
pub fn verify_marker_name(event: &HistoryEvent, name: &str) -> bool {
    marker_attributes(event).is_some_and(|a| a.marker_name == name)
}

pub fn side_effect_marker(id: u64, data: Value) -> RecordMarkerAttributes {
    RecordMarkerAttributes {
        marker_name: SIDE_EFFECT_MARKER_NAME.to_string(),
        details: BTreeMap::from([
            (MARKER_ID_KEY.to_string(), json!(id)),
            (MARKER_DATA_KEY.to_string(), data),
        ]),
        failure: None,
    }
}

pub fn mutable_side_effect_marker(id: &str, data: Value) -> RecordMarkerAttributes {
    RecordMarkerAttributes {
        marker_name: MUTABLE_SIDE_EFFECT_MARKER_NAME.to_string(),
        details: BTreeMap::from([
            (MARKER_ID_KEY.to_string(), json!(id)),
            (MARKER_DATA_KEY.to_string(), data),
        ]),
        failure: None,
    }
}

pub fn version_marker(change_id: &str, version: i32) -> RecordMarkerAttributes {
    RecordMarkerAttributes {
        marker_name: VERSION_MARKER_NAME.to_string(),
        details: BTreeMap::from([
            (MARKER_CHANGE_ID_KEY.to_string(), json!(change_id)),
            (MARKER_VERSION_KEY.to_string(), json!(version)),
        ]),
        failure: None,
    }
}

/// True if the event is structurally a version marker: marker name and a
/// `changeId` detail are both present.
pub fn has_version_marker_structure(event: &HistoryEvent) -> bool {
    marker_attributes(event)
        .filter(|a| a.marker_name == VERSION_MARKER_NAME)
        .and_then(|a| a.details.get(MARKER_CHANGE_ID_KEY))
        .is_some()
}

/// The `changeId` of a version marker event, if extractable.
pub fn version_marker_change_id(event: &HistoryEvent) -> Option<String> {
    marker_attributes(event)
        .filter(|a| a.marker_name == VERSION_MARKER_NAME)
        .and_then(|a| a.details.get(MARKER_CHANGE_ID_KEY))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

pub fn version_marker_version(event: &HistoryEvent) -> Option<i32> {
    marker_attributes(event)
        .filter(|a| a.marker_name == VERSION_MARKER_NAME)
        .and_then(|a| a.details.get(MARKER_VERSION_KEY))
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
}

/// The string detail under `key`, for markers keyed by user-chosen ids.
pub fn marker_string_detail(attributes: &RecordMarkerAttributes, key: &str) -> Option<String> {
    attributes
        .details
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

pub fn marker_data(attributes: &RecordMarkerAttributes) -> Option<Value> {
    attributes.details.get(MARKER_DATA_KEY).cloned()
}

/// Payload of a local-activity marker.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalActivityMarkerData {
    pub activity_id: String,
    pub activity_type: String,
    pub result: Option<Value>,
    pub failure: Option<Failure>,
    pub replay_time_millis: i64,
    pub attempt: i32,
    pub backoff: Option<Duration>,
}

impl LocalActivityMarkerData {
    pub fn into_marker(self) -> RecordMarkerAttributes {
        let mut details = BTreeMap::from([
            (MARKER_ACTIVITY_ID_KEY.to_string(), json!(self.activity_id)),
            (
                MARKER_ACTIVITY_TYPE_KEY.to_string(),
                json!(self.activity_type),
            ),
            (
                MARKER_REPLAY_TIME_KEY.to_string(),
                json!(self.replay_time_millis),
            ),
            (MARKER_ATTEMPT_KEY.to_string(), json!(self.attempt)),
        ]);
        if let Some(result) = self.result {
            details.insert(MARKER_RESULT_KEY.to_string(), result);
        }
        if let Some(backoff) = self.backoff {
            details.insert(MARKER_BACKOFF_KEY.to_string(), json!(backoff.as_millis()));
        }
        RecordMarkerAttributes {
            marker_name: LOCAL_ACTIVITY_MARKER_NAME.to_string(),
            details,
            failure: self.failure,
        }
    }

    pub fn from_marker(attributes: &RecordMarkerAttributes) -> Option<Self> {
        if attributes.marker_name != LOCAL_ACTIVITY_MARKER_NAME {
            return None;
        }
        Some(Self {
            activity_id: marker_string_detail(attributes, MARKER_ACTIVITY_ID_KEY)?,
            activity_type: marker_string_detail(attributes, MARKER_ACTIVITY_TYPE_KEY)
                .unwrap_or_default(),
            result: attributes.details.get(MARKER_RESULT_KEY).cloned(),
            failure: attributes.failure.clone(),
            replay_time_millis: attributes
                .details
                .get(MARKER_REPLAY_TIME_KEY)
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            attempt: attributes
                .details
                .get(MARKER_ATTEMPT_KEY)
                .and_then(|v| v.as_i64())
                .unwrap_or(1) as i32,
            backoff: attributes
                .details
                .get(MARKER_BACKOFF_KEY)
                .and_then(|v| v.as_u64())
                .map(Duration::from_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn marker_event(attributes: RecordMarkerAttributes) -> HistoryEvent {
        HistoryEvent::new(5, Utc::now(), EventAttributes::MarkerRecorded(attributes))
    }

    #[test]
    fn test_version_marker_structure() {
        let event = marker_event(version_marker("feature-x", 2));
        assert!(has_version_marker_structure(&event));
        assert_eq!(
            version_marker_change_id(&event),
            Some("feature-x".to_string())
        );
        assert_eq!(version_marker_version(&event), Some(2));
    }

    #[test]
    fn test_side_effect_marker_is_not_version_structured() {
        let event = marker_event(side_effect_marker(1, json!(42)));
        assert!(!has_version_marker_structure(&event));
        assert!(verify_marker_name(&event, SIDE_EFFECT_MARKER_NAME));
        assert!(!verify_marker_name(&event, VERSION_MARKER_NAME));
    }

    #[test]
    fn test_marker_data_extraction() {
        let attributes = mutable_side_effect_marker("x", json!({"n": 42}));
        assert_eq!(marker_data(&attributes), Some(json!({"n": 42})));
        assert_eq!(
            marker_string_detail(&attributes, MARKER_ID_KEY),
            Some("x".to_string())
        );
    }

    #[test]
    fn test_local_activity_marker_round_trip() {
        let data = LocalActivityMarkerData {
            activity_id: "la-1".to_string(),
            activity_type: "resize-image".to_string(),
            result: Some(json!("ok")),
            failure: None,
            replay_time_millis: 12_345,
            attempt: 3,
            backoff: Some(Duration::from_millis(1500)),
        };
        let attributes = data.clone().into_marker();
        assert_eq!(attributes.marker_name, LOCAL_ACTIVITY_MARKER_NAME);
        let decoded = LocalActivityMarkerData::from_marker(&attributes).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_local_activity_marker_with_failure() {
        let data = LocalActivityMarkerData {
            activity_id: "la-2".to_string(),
            activity_type: "charge".to_string(),
            result: None,
            failure: Some(Failure::application("io-error", "boom", false, None)),
            replay_time_millis: 0,
            attempt: 1,
            backoff: None,
        };
        let decoded = LocalActivityMarkerData::from_marker(&data.clone().into_marker()).unwrap();
        assert_eq!(decoded.failure, data.failure);
        assert_eq!(decoded.result, None);
    }

    #[test]
    fn test_from_marker_rejects_other_names(){
        let attributes = version_marker("x", 1);
        assert!(LocalActivityMarkerData::from_marker(&attributes).is_none());
    }
}
