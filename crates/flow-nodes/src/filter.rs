//! Shared message filtering for bus-bound reactor nodes

use std::time::Duration;

use flow_engine::{Message, MessageBus, MetaNode, Variable};

/// Effective wait when no timeout is configured (24 hours)
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 86_400;

/// Match a message against a node's address/service/interface filter and an
/// optional value filter. `"*"` matches any service or interface.
pub(crate) fn message_matches(
    meta: &MetaNode,
    value_filter_enabled: bool,
    value_filter: &Variable,
    msg: &Message,
) -> bool {
    if !MessageBus::topic_matches(&meta.address, &msg.topic) {
        return false;
    }
    if msg.service != meta.service && meta.service != "*" {
        return false;
    }
    if msg.interface != meta.service_interface && meta.service_interface != "*" {
        return false;
    }
    !value_filter_enabled || msg.payload.value == value_filter.value
}

/// Translate a configured timeout in seconds into the wait duration;
/// zero means "effectively infinite"
pub(crate) fn effective_timeout(timeout_secs: u64) -> Duration {
    if timeout_secs == 0 {
        Duration::from_secs(DEFAULT_TIMEOUT_SECS)
    } else {
        Duration::from_secs(timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> MetaNode {
        MetaNode {
            address: "evt/dev/+/switch".to_string(),
            service: "out_bin_switch".to_string(),
            service_interface: "evt.binary.report".to_string(),
            ..Default::default()
        }
    }

    fn msg(topic: &str, service: &str, interface: &str, value: serde_json::Value) -> Message {
        Message {
            topic: topic.to_string(),
            service: service.to_string(),
            interface: interface.to_string(),
            payload: Variable::new("bool", value),
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_matching() {
        let meta = meta();
        let matching = msg(
            "evt/dev/1/switch",
            "out_bin_switch",
            "evt.binary.report",
            serde_json::json!(true),
        );
        assert!(message_matches(&meta, false, &Variable::default(), &matching));

        let wrong_service = msg(
            "evt/dev/1/switch",
            "sensor_lumin",
            "evt.binary.report",
            serde_json::json!(true),
        );
        assert!(!message_matches(&meta, false, &Variable::default(), &wrong_service));

        let mut wildcard = meta.clone();
        wildcard.service = "*".to_string();
        assert!(message_matches(&wildcard, false, &Variable::default(), &wrong_service));
    }

    #[test]
    fn test_value_filter() {
        let meta = meta();
        let msg_true = msg(
            "evt/dev/1/switch",
            "out_bin_switch",
            "evt.binary.report",
            serde_json::json!(true),
        );
        let filter = Variable::new("bool", serde_json::json!(false));
        assert!(!message_matches(&meta, true, &filter, &msg_true));
        let filter = Variable::new("bool", serde_json::json!(true));
        assert!(message_matches(&meta, true, &filter, &msg_true));
    }

    #[test]
    fn test_effective_timeout() {
        assert_eq!(effective_timeout(0), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(effective_timeout(5), Duration::from_secs(5));
    }
}
