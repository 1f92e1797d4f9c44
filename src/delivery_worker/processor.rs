// ============================================================================
// Message Processor
// ============================================================================
//
// Outcome handling as a pure state transition:
//
//   transition(message, outcome) -> (next_state, side_effects[])
//
// The worker applies the side effects in order against the store. Nothing in
// here performs I/O, so every branch of the retry / DLQ state machine is
// testable without a store.
//
// State machine per message:
//
//   ENQUEUED -> CLAIMED -> DELIVERED                          (terminal)
//                       -> renew, backoff, requeue(attempt+1) -> ENQUEUED
//                       -> DEAD_LETTERED                      (terminal)
//
// A failed entry stays owned by this consumer while the backoff runs. The
// requeue appends its successor and acks + deletes it in one step, and only
// if this consumer still owns it, so a crash inside the window leaves the
// entry reclaimable and a consumer that lost it changes nothing.
//
// Attempt accounting: attempt_count counts failed attempts before this copy.
// A transient failure is retried while attempt_count < max_attempts, so a
// message gets at most max_attempts + 1 sends before it is dead-lettered.
//
// ============================================================================

use crate::delivery_worker::backoff::RetryPolicy;
use crate::delivery_worker::executor::DeliveryError;
use crate::message::QueueMessage;
use std::time::Duration;

/// What happened when the worker tried the entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { provider_ref: String },
    /// A delivered marker exists; the transport was not called
    AlreadyDelivered,
    Failed(DeliveryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextState {
    Delivered,
    Skipped,
    Retrying { attempt_count: u32, delay: Duration },
    DeadLettered { reason: String, total_attempts: u32 },
}

/// Store operation to apply, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    MarkDelivered,
    /// Reset the entry's idle time; stop here if it is no longer ours
    RenewClaim,
    AckDelete,
    Sleep(Duration),
    /// Replace the entry with this copy, if it is still ours
    Requeue(QueueMessage),
    DeadLetter { reason: String, total_attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: NextState,
    pub effects: Vec<SideEffect>,
}

/// Decide the next state for `message` given the outcome of its attempt
///
/// `jitter` is the backoff jitter factor (see [`RetryPolicy::jitter`]).
pub fn transition(
    message: &QueueMessage,
    outcome: &DeliveryOutcome,
    policy: &RetryPolicy,
    jitter: f64,
) -> Transition {
    match outcome {
        DeliveryOutcome::Delivered { .. } => Transition {
            next: NextState::Delivered,
            effects: vec![SideEffect::MarkDelivered, SideEffect::AckDelete],
        },
        DeliveryOutcome::AlreadyDelivered => Transition {
            next: NextState::Skipped,
            effects: vec![SideEffect::AckDelete],
        },
        DeliveryOutcome::Failed(err)
            if err.is_retriable() && policy.should_retry(message.attempt_count) =>
        {
            let delay = policy.delay(message.attempt_count, jitter);
            let retry = message.next_attempt();
            Transition {
                next: NextState::Retrying {
                    attempt_count: retry.attempt_count,
                    delay,
                },
                effects: vec![
                    SideEffect::RenewClaim,
                    SideEffect::Sleep(delay),
                    SideEffect::Requeue(retry),
                ],
            }
        }
        DeliveryOutcome::Failed(err) => {
            let reason = err.to_string();
            let total_attempts = message.attempt_number();
            Transition {
                next: NextState::DeadLettered {
                    reason: reason.clone(),
                    total_attempts,
                },
                effects: vec![SideEffect::DeadLetter {
                    reason,
                    total_attempts,
                }],
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NewMessage;
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }

    fn message(attempt_count: u32) -> QueueMessage {
        QueueMessage {
            attempt_count,
            ..QueueMessage::new("sms", NewMessage::new("m1", "r1", json!("hi")))
        }
    }

    fn transient() -> DeliveryOutcome {
        DeliveryOutcome::Failed(DeliveryError::Transient("503".into()))
    }

    #[test]
    fn test_success_marks_then_acks() {
        let t = transition(
            &message(0),
            &DeliveryOutcome::Delivered {
                provider_ref: "p1".into(),
            },
            &policy(),
            1.0,
        );
        assert_eq!(t.next, NextState::Delivered);
        assert_eq!(t.effects, vec![SideEffect::MarkDelivered, SideEffect::AckDelete]);
    }

    #[test]
    fn test_already_delivered_only_acks() {
        let t = transition(&message(2), &DeliveryOutcome::AlreadyDelivered, &policy(), 1.0);
        assert_eq!(t.next, NextState::Skipped);
        assert_eq!(t.effects, vec![SideEffect::AckDelete]);
    }

    #[test]
    fn test_transient_failure_requeues_with_incremented_count() {
        let t = transition(&message(2), &transient(), &policy(), 1.0);

        assert_eq!(
            t.next,
            NextState::Retrying {
                attempt_count: 3,
                delay: Duration::from_millis(400)
            }
        );
        assert_eq!(t.effects.len(), 3);
        assert_eq!(t.effects[0], SideEffect::RenewClaim);
        assert_eq!(t.effects[1], SideEffect::Sleep(Duration::from_millis(400)));
        match &t.effects[2] {
            SideEffect::Requeue(retry) => {
                assert_eq!(retry.attempt_count, 3);
                assert_eq!(retry.message_id, "m1");
            }
            other => panic!("expected requeue, got {:?}", other),
        }
        assert!(!t.effects.contains(&SideEffect::AckDelete));
    }

    #[test]
    fn test_transient_failure_at_ceiling_dead_letters() {
        let t = transition(&message(5), &transient(), &policy(), 1.0);
        assert_eq!(
            t.next,
            NextState::DeadLettered {
                reason: "transient delivery failure: 503".into(),
                total_attempts: 6
            }
        );
        assert!(matches!(t.effects.as_slice(), [SideEffect::DeadLetter { .. }]));
    }

    #[test]
    fn test_permanent_failure_dead_letters_immediately() {
        let outcome = DeliveryOutcome::Failed(DeliveryError::Permanent("invalid recipient".into()));
        let t = transition(&message(0), &outcome, &policy(), 1.0);
        assert_eq!(
            t.effects,
            vec![SideEffect::DeadLetter {
                reason: "permanent delivery failure: invalid recipient".into(),
                total_attempts: 1
            }]
        );
    }

    #[test]
    fn test_attempt_count_never_decreases() {
        let mut m = message(0);
        for expected in 1..=5 {
            let t = transition(&m, &transient(), &policy(), 0.5);
            let SideEffect::Requeue(next) = &t.effects[2] else {
                panic!("expected requeue");
            };
            assert_eq!(next.attempt_count, expected);
            m = next.clone();
        }
        let t = transition(&m, &transient(), &policy(), 0.5);
        assert!(matches!(t.next, NextState::DeadLettered { total_attempts: 6, .. }));
    }
}
