use serde::{Deserialize, Serialize};

/// Campaign send request as handed over by the CRUD layer: an explicit
/// contact list, a segment list, or everybody active — plus an optional
/// future dispatch time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSpec {
    #[serde(default)]
    pub send_to_all: bool,
    #[serde(default)]
    pub contact_ids: Vec<i64>,
    #[serde(default)]
    pub segment_ids: Vec<i64>,
    /// Unix seconds. Present = schedule for later, absent = send now.
    #[serde(default)]
    pub scheduled_at: Option<i64>,
}

impl SendSpec {
    pub fn to_all() -> Self {
        Self {
            send_to_all: true,
            ..Self::default()
        }
    }

    pub fn to_contacts(ids: Vec<i64>) -> Self {
        Self {
            contact_ids: ids,
            ..Self::default()
        }
    }

    pub fn to_segments(ids: Vec<i64>) -> Self {
        Self {
            segment_ids: ids,
            ..Self::default()
        }
    }

    /// A spec that names nobody at all, as opposed to one that resolved
    /// to zero eligible recipients.
    pub fn is_empty(&self) -> bool {
        !self.send_to_all && self.contact_ids.is_empty() && self.segment_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_camel_case_payloads() {
        let spec: SendSpec = serde_json::from_str(
            r#"{"sendToAll": false, "contactIds": [1, 2], "scheduledAt": 1700000000}"#,
        )
        .unwrap();
        assert_eq!(spec.contact_ids, vec![1, 2]);
        assert_eq!(spec.scheduled_at, Some(1700000000));
        assert!(!spec.is_empty());
    }

    #[test]
    fn empty_spec_is_detected() {
        let spec: SendSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.is_empty());
        assert!(!SendSpec::to_all().is_empty());
    }
}
