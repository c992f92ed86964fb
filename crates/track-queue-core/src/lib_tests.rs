//! Tests for the core domain types

use super::*;

// ============================================================================
// Identifier Tests
// ============================================================================

#[test]
fn test_queue_item_id_round_trips_through_string() {
    let id = QueueItemId::new();

    let parsed: QueueItemId = id.as_str().parse().unwrap();

    assert_eq!(parsed, id);
}

#[test]
fn test_queue_item_id_rejects_garbage() {
    let result = "not-a-ulid".parse::<QueueItemId>();

    assert!(matches!(result, Err(ParseError::InvalidFormat { .. })));
}

#[test]
fn test_owner_id_parses_integers() {
    assert_eq!("42".parse::<OwnerId>().unwrap(), OwnerId::new(42));
    assert!("forty-two".parse::<OwnerId>().is_err());
}

#[test]
fn test_owner_id_serializes_as_plain_number() {
    let json = serde_json::to_string(&OwnerId::new(7)).unwrap();

    assert_eq!(json, "7");
}

// ============================================================================
// Queue Type Tests
// ============================================================================

#[test]
fn test_queue_type_parses_names_and_aliases() {
    assert_eq!("live-position".parse::<QueueType>().unwrap(), QueueType::LivePosition);
    assert_eq!("LIVE_POSITION".parse::<QueueType>().unwrap(), QueueType::LivePosition);
    assert_eq!("device".parse::<QueueType>().unwrap(), QueueType::DeviceFeed);
    assert_eq!("score".parse::<QueueType>().unwrap(), QueueType::DerivedScore);
    assert!("unknown".parse::<QueueType>().is_err());
}

#[test]
fn test_queue_type_display_matches_serde_name() {
    for queue_type in QueueType::ALL {
        let json = serde_json::to_string(&queue_type).unwrap();
        assert_eq!(json, format!("\"{}\"", queue_type));
    }
}

#[test]
fn test_queue_type_owner_check_follows_parent_table() {
    assert!(QueueType::LivePosition.requires_owner_check());
    assert!(QueueType::Upload.requires_owner_check());
    assert_eq!(QueueType::DeviceFeed.parent_table(), Some("devices"));
    assert!(!QueueType::DerivedScore.requires_owner_check());
}

#[test]
fn test_queue_types_have_distinct_target_tables() {
    let tables: std::collections::HashSet<_> =
        QueueType::ALL.iter().map(|q| q.target_table()).collect();

    assert_eq!(tables.len(), QueueType::ALL.len());
}

// ============================================================================
// Timestamp Tests
// ============================================================================

#[test]
fn test_timestamp_millis_round_trip() {
    let ts = Timestamp::from_millis(1_700_000_000_123);

    assert_eq!(ts.as_millis(), 1_700_000_000_123);
}

#[test]
fn test_timestamp_duration_arithmetic() {
    let base = Timestamp::from_millis(1_000_000);
    let later = base.add_duration(Duration::from_secs(5));

    assert_eq!(later.duration_since(base), Duration::from_secs(5));
    assert_eq!(base.duration_since(later), Duration::ZERO);
    assert_eq!(later.subtract_duration(Duration::from_secs(5)), base);
}

#[test]
fn test_timestamp_rfc3339() {
    let ts = Timestamp::from_rfc3339("2024-01-02T03:04:05Z").unwrap();

    assert_eq!(ts.as_millis(), 1_704_164_645_000);
    assert!(Timestamp::from_rfc3339("yesterday").is_err());
}

// ============================================================================
// Point and Item Tests
// ============================================================================

#[test]
fn test_point_identity_ignores_optional_fields() {
    let base = PointRecord::new(
        OwnerId::new(1),
        Timestamp::from_millis(1000),
        Position::new(52.1, 4.3),
    );
    let tagged = base.clone().with_elevation(12.0).with_device_tag("gps-1");

    assert_eq!(base.identity(), tagged.identity());
}

#[test]
fn test_point_identity_distinguishes_positions() {
    let a = PointRecord::new(OwnerId::new(1), Timestamp::from_millis(1000), Position::new(1.0, 2.0));
    let b = PointRecord::new(OwnerId::new(1), Timestamp::from_millis(1000), Position::new(1.0, 2.5));

    assert_ne!(a.identity(), b.identity());
}

#[test]
fn test_point_record_defaults_optional_fields_on_decode() {
    let json = r#"{
        "owner": 3,
        "recorded_at": "2024-01-02T03:04:05Z",
        "position": {"latitude": 1.5, "longitude": 2.5}
    }"#;

    let point: PointRecord = serde_json::from_str(json).unwrap();

    assert_eq!(point.owner, OwnerId::new(3));
    assert!(point.elevation.is_none());
    assert!(point.device_tag.is_none());
}

#[test]
fn test_dlq_item_from_item_keeps_identity_and_counts_subset() {
    let points: Vec<_> = (0..3)
        .map(|i| PointRecord::new(OwnerId::new(i), Timestamp::now(), Position::new(0.0, 0.0)))
        .collect();
    let mut item = QueueItem::new(QueueType::Upload, points.clone(), 1.0);
    item.retry_count = 2;

    let dlq = DlqItem::from_item(&item, points[..1].to_vec(), DlqReason::UnknownParentReference);

    assert_eq!(dlq.id, item.id);
    assert_eq!(dlq.count, 1);
    assert_eq!(dlq.retry_count, 2);
    assert_eq!(dlq.original_queue_type, QueueType::Upload);
    assert!(dlq.raw_payload.is_none());
}

#[test]
fn test_dlq_reason_display() {
    let reason = DlqReason::StructuralFailure {
        message: "value too long".to_string(),
    };

    assert_eq!(reason.to_string(), "structural failure: value too long");
    assert_eq!(DlqReason::MaxRetriesExceeded.to_string(), "max retries exceeded");
}

#[test]
fn test_requeue_failure_is_its_own_reason() {
    let reason = DlqReason::RequeueFailed {
        message: "store unavailable".to_string(),
    };

    assert_eq!(reason.category(), "requeue failed");
    assert_eq!(reason.to_string(), "requeue failed: store unavailable");
    assert_ne!(reason, DlqReason::MaxRetriesExceeded);
}

#[test]
fn test_dlq_reason_serializes_with_type_tag() {
    let json = serde_json::to_value(DlqReason::UnknownParentReference).unwrap();

    assert_eq!(json["type"], "unknown_parent_reference");
}
