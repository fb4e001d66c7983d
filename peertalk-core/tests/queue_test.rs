use peertalk_core::queue::{
    Backpressure, MessageQueue, Priority, PushOutcome, COALESCE_BUCKETS, SLOT_DATA_SIZE,
};
use peertalk_core::tick::Ticks;
use peertalk_core::PeerTalkError;

const NOW: Ticks = Ticks(1_000);

fn pop(q: &mut MessageQueue) -> Vec<u8> {
    let mut buf = [0u8; SLOT_DATA_SIZE];
    let n = q.pop_priority(&mut buf).expect("queue not empty");
    buf[..n].to_vec()
}

#[test]
fn test_capacity_must_be_power_of_two() {
    assert!(MessageQueue::new(8).is_ok());
    assert_eq!(MessageQueue::new(0).unwrap_err(), PeerTalkError::NotPowerOfTwo);
    assert_eq!(MessageQueue::new(6).unwrap_err(), PeerTalkError::NotPowerOfTwo);
    assert_eq!(MessageQueue::new(24).unwrap_err(), PeerTalkError::NotPowerOfTwo);
    // Power of two but over the hard limit: the auxiliary tables are
    // sized for 32 slots.
    assert_eq!(MessageQueue::new(64).unwrap_err(), PeerTalkError::InvalidParam);
}

#[test]
fn test_full_queue_rejects_then_accepts_after_pop() {
    let mut q = MessageQueue::new(4).unwrap();
    for i in 0..4u8 {
        q.push(&[i], Priority::Normal, 0, NOW).unwrap();
    }
    assert!(q.is_full());
    assert_eq!(
        q.push(b"x", Priority::Normal, 0, NOW).unwrap_err(),
        PeerTalkError::BufferFull
    );

    assert_eq!(pop(&mut q), vec![0]);
    q.push(b"x", Priority::Normal, 0, NOW).unwrap();
    assert_eq!(q.len(), 4);
}

#[test]
fn test_oversized_payload_is_refused() {
    let mut q = MessageQueue::new(4).unwrap();
    let big = vec![0u8; SLOT_DATA_SIZE + 1];
    assert_eq!(
        q.push(&big, Priority::Normal, 0, NOW).unwrap_err(),
        PeerTalkError::BufferFull
    );
    assert!(q.is_empty());
}

#[test]
fn test_fifo_within_priority() {
    let mut q = MessageQueue::new(8).unwrap();
    for i in 0..5u8 {
        q.push(&[i], Priority::Normal, 0, NOW).unwrap();
    }
    for i in 0..5u8 {
        assert_eq!(pop(&mut q), vec![i]);
    }
    assert!(q.is_empty());
}

#[test]
fn test_priority_order_critical_first() {
    let mut q = MessageQueue::new(8).unwrap();
    q.push(b"low", Priority::Low, 0, NOW).unwrap();
    q.push(b"normal", Priority::Normal, 0, NOW).unwrap();
    q.push(b"critical", Priority::Critical, 0, NOW).unwrap();
    q.push(b"high", Priority::High, 0, NOW).unwrap();

    assert_eq!(pop(&mut q), b"critical".to_vec());
    assert_eq!(pop(&mut q), b"high".to_vec());
    assert_eq!(pop(&mut q), b"normal".to_vec());
    assert_eq!(pop(&mut q), b"low".to_vec());
}

#[test]
fn test_per_priority_counts_sum_to_len() {
    let mut q = MessageQueue::new(16).unwrap();
    q.push(b"a", Priority::Critical, 0, NOW).unwrap();
    q.push(b"b", Priority::Normal, 0, NOW).unwrap();
    q.push(b"c", Priority::Normal, 0, NOW).unwrap();
    q.push(b"d", Priority::Low, 0, NOW).unwrap();
    let sum = q.priority_len(Priority::Critical)
        + q.priority_len(Priority::High)
        + q.priority_len(Priority::Normal)
        + q.priority_len(Priority::Low);
    assert_eq!(sum, q.len());
}

#[test]
fn test_coalescing_same_key_keeps_one_slot() {
    let mut q = MessageQueue::new(8).unwrap();
    for i in 1..=10u8 {
        let payload = [b'p', b'0' + i];
        let outcome = q
            .push_coalesce(&payload, Priority::Normal, 0, 7, NOW)
            .unwrap();
        if i == 1 {
            assert_eq!(outcome, PushOutcome::Stored);
        } else {
            assert_eq!(outcome, PushOutcome::Coalesced);
        }
    }
    assert_eq!(q.len(), 1, "only the latest payload is queued");
    assert_eq!(pop(&mut q), vec![b'p', b'0' + 10]);
}

#[test]
fn test_coalescing_preserves_queue_position() {
    let mut q = MessageQueue::new(8).unwrap();
    q.push_coalesce(b"first", Priority::Normal, 0, 3, NOW).unwrap();
    q.push(b"second", Priority::Normal, 0, NOW).unwrap();
    // The update replaces the payload but not the position.
    q.push_coalesce(b"FIRST", Priority::Normal, 0, 3, NOW).unwrap();

    assert_eq!(pop(&mut q), b"FIRST".to_vec());
    assert_eq!(pop(&mut q), b"second".to_vec());
}

#[test]
fn test_zero_key_never_coalesces() {
    let mut q = MessageQueue::new(8).unwrap();
    q.push_coalesce(b"a", Priority::Normal, 0, 0, NOW).unwrap();
    q.push_coalesce(b"b", Priority::Normal, 0, 0, NOW).unwrap();
    assert_eq!(q.len(), 2);
}

#[test]
fn test_hash_collision_keeps_both_messages() {
    let mut q = MessageQueue::new(8).unwrap();
    // Two keys in the same direct-mapped bucket.
    let k1 = 1u16;
    let k2 = 1 + COALESCE_BUCKETS as u16;

    q.push_coalesce(b"a1", Priority::Normal, 0, k1, NOW).unwrap();
    q.push_coalesce(b"b1", Priority::Normal, 0, k2, NOW).unwrap();
    assert_eq!(q.len(), 2, "a colliding key must not overwrite the other");

    // The bucket now tracks k2, so k2 still coalesces with its own
    // prior entry.
    assert_eq!(
        q.push_coalesce(b"b2", Priority::Normal, 0, k2, NOW).unwrap(),
        PushOutcome::Coalesced
    );
    assert_eq!(q.len(), 2);

    // k1 was evicted from the bucket; a new push stores a fresh slot
    // rather than touching k2's entry.
    assert_eq!(
        q.push_coalesce(b"a2", Priority::Normal, 0, k1, NOW).unwrap(),
        PushOutcome::Stored
    );
    assert_eq!(q.len(), 3);

    assert_eq!(pop(&mut q), b"a1".to_vec());
    assert_eq!(pop(&mut q), b"b2".to_vec());
    assert_eq!(pop(&mut q), b"a2".to_vec());
}

#[test]
fn test_backpressure_levels() {
    let mut q = MessageQueue::new(16).unwrap();
    assert_eq!(q.backpressure(), Backpressure::None);
    for i in 0..4u8 {
        q.push(&[i], Priority::Normal, 0, NOW).unwrap();
    }
    assert_eq!(q.backpressure(), Backpressure::Light, "25% fill");
    for i in 0..4u8 {
        q.push(&[i], Priority::Normal, 0, NOW).unwrap();
    }
    assert_eq!(q.backpressure(), Backpressure::Heavy, "50% fill");
    for i in 0..4u8 {
        q.push(&[i], Priority::Normal, 0, NOW).unwrap();
    }
    assert_eq!(q.backpressure(), Backpressure::Blocking, "75% fill");
}

#[test]
fn test_try_push_policy_under_pressure() {
    let mut q = MessageQueue::new(8).unwrap();
    // Fill to BLOCKING (6/8 = 75%).
    for i in 0..6u8 {
        q.push(&[i], Priority::Normal, 0, NOW).unwrap();
    }
    assert_eq!(q.backpressure(), Backpressure::Blocking);

    assert_eq!(
        q.try_push(b"low", Priority::Low, 0, 0, NOW).unwrap_err(),
        PeerTalkError::Backpressure
    );
    assert_eq!(
        q.try_push(b"high", Priority::High, 0, 0, NOW).unwrap_err(),
        PeerTalkError::Backpressure
    );
    let (outcome, pressure) = q.try_push(b"crit", Priority::Critical, 0, 0, NOW).unwrap();
    assert_eq!(outcome, PushOutcome::Stored);
    assert_eq!(pressure, Backpressure::Blocking);
}

#[test]
fn test_try_push_heavy_admits_high_and_above() {
    let mut q = MessageQueue::new(8).unwrap();
    for i in 0..4u8 {
        q.push(&[i], Priority::Normal, 0, NOW).unwrap();
    }
    assert_eq!(q.backpressure(), Backpressure::Heavy);

    assert!(q.try_push(b"n", Priority::Normal, 0, 0, NOW).is_err());
    assert!(q.try_push(b"h", Priority::High, 0, 0, NOW).is_ok());
}

#[test]
fn test_direct_pop_commit_semantics() {
    let mut q = MessageQueue::new(8).unwrap();
    q.push(b"payload", Priority::Normal, 0, NOW).unwrap();

    {
        let view = q.pop_priority_direct().unwrap();
        assert_eq!(view.data, b"payload");
        assert_eq!(view.priority, Priority::Normal);
        assert_eq!(view.timestamp, NOW);
    }
    assert_eq!(q.len(), 1, "count unchanged until commit");

    q.pop_priority_commit().unwrap();
    assert_eq!(q.len(), 0);
    assert_eq!(
        q.pop_priority_commit().unwrap_err(),
        PeerTalkError::InvalidParam,
        "commit without a pending direct pop"
    );
}

#[test]
fn test_direct_pop_abort_leaves_message_queued() {
    let mut q = MessageQueue::new(8).unwrap();
    q.push(b"keep", Priority::Normal, 0, NOW).unwrap();
    {
        let _ = q.pop_priority_direct().unwrap();
    }
    q.pop_priority_abort();
    assert_eq!(q.len(), 1);
    assert_eq!(pop(&mut q), b"keep".to_vec());
}

#[test]
fn test_isr_push_has_zero_timestamp() {
    let mut q = MessageQueue::new(8).unwrap();
    q.push_coalesce_isr(b"from isr", Priority::High, 0, 9).unwrap();

    let view = q.pop_priority_direct().unwrap();
    assert_eq!(
        view.timestamp,
        Ticks(0),
        "interrupt-context entries carry no timestamp"
    );
    drop(view);
    q.pop_priority_commit().unwrap();
}

#[test]
fn test_isr_push_coalesces_and_reports_full() {
    let mut q = MessageQueue::new(2).unwrap();
    assert_eq!(
        q.push_coalesce_isr(b"a", Priority::Normal, 0, 5).unwrap(),
        PushOutcome::Stored
    );
    assert_eq!(
        q.push_coalesce_isr(b"b", Priority::Normal, 0, 5).unwrap(),
        PushOutcome::Coalesced
    );
    assert_eq!(q.len(), 1);

    q.push_coalesce_isr(b"x", Priority::Normal, 0, 0).unwrap();
    assert_eq!(
        q.push_coalesce_isr(b"y", Priority::Normal, 0, 0).unwrap_err(),
        PeerTalkError::BufferFull
    );

    // The deferred flags drain without touching queue contents.
    q.check_isr_flags();
    assert_eq!(q.len(), 2);
}

#[test]
fn test_has_data_signal_tracks_occupancy() {
    let mut q = MessageQueue::new(4).unwrap();
    assert!(!q.has_data());
    q.push(b"a", Priority::Normal, 0, NOW).unwrap();
    assert!(q.has_data());
    pop(&mut q);
    assert!(!q.has_data());
}

#[test]
fn test_clear_resets_everything_in_place() {
    let mut q = MessageQueue::new(8).unwrap();
    for i in 0..5u8 {
        q.push_coalesce(&[i], Priority::Low, 0, i as u16 + 1, NOW).unwrap();
    }
    q.clear();
    assert!(q.is_empty());
    assert!(!q.has_data());
    // The ring is immediately usable again.
    q.push(b"fresh", Priority::Critical, 0, NOW).unwrap();
    assert_eq!(pop(&mut q), b"fresh".to_vec());
}

#[test]
fn test_interleaved_churn_preserves_order() {
    // Push/pop churn across priorities with wrap-around of the ring.
    let mut q = MessageQueue::new(4).unwrap();
    for round in 0u8..20 {
        q.push(&[round], Priority::Normal, 0, NOW).unwrap();
        q.push(&[100 + round], Priority::High, 0, NOW).unwrap();
        assert_eq!(pop(&mut q), vec![100 + round], "high first");
        assert_eq!(pop(&mut q), vec![round]);
    }
    assert!(q.is_empty());
}
