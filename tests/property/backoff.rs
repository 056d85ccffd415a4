//! Property-based tests for the monitoring schedule

use darkroom::workflow::backoff::{is_due, is_expired, BackoffPolicy};
use proptest::prelude::*;

fn policy_strategy() -> impl Strategy<Value = BackoffPolicy> {
    (100u64..10_000, 1.0f64..4.0, 100u64..60_000, 1_000u64..120_000).prop_map(
        |(initial_interval_ms, multiplier, max_interval_ms, deadline_ms)| BackoffPolicy {
            initial_interval_ms,
            multiplier,
            max_interval_ms,
            deadline_ms,
        },
    )
}

/// Polls never land past the deadline, intervals never shrink or exceed the cap.
#[test]
fn test_schedule_stays_within_deadline_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(policy_strategy(), 0u64..4_000_000_000_000),
            |(policy, start)| {
                let mut state = policy.start(start);
                prop_assert_eq!(state.next_poll_at_ms, start);
                prop_assert_eq!(state.deadline_at_ms, start + policy.deadline_ms);

                let mut now = start;
                let mut polls = 0u32;
                while !is_expired(&state, now) {
                    prop_assert!(is_due(&state, now));
                    let next = policy.advance(&state, now);
                    prop_assert!(next.next_poll_at_ms > now);
                    prop_assert!(next.next_poll_at_ms <= state.deadline_at_ms);
                    prop_assert!(next.interval_ms >= state.interval_ms);
                    prop_assert!(next.interval_ms <= policy.max_interval_ms);
                    prop_assert_eq!(next.polls, state.polls + 1);
                    polls += 1;
                    now = next.next_poll_at_ms;
                    state = next;
                }

                // The final scheduled poll is the deadline itself
                prop_assert_eq!(now, state.deadline_at_ms);
                prop_assert!(polls as u64 <= policy.deadline_ms / 100 + 1);
                Ok(())
            },
        )
        .unwrap();
}

proptest! {
    /// A late sweep reschedules from when it actually polled.
    #[test]
    fn late_poll_reschedules_from_poll_time(policy in policy_strategy(), lateness in 0u64..5_000) {
        let state = policy.start(0);
        let polled_at = lateness.min(policy.deadline_ms.saturating_sub(1));
        let next = policy.advance(&state, polled_at);
        let expected = (polled_at + state.interval_ms).min(state.deadline_at_ms);
        prop_assert_eq!(next.next_poll_at_ms, expected);
    }
}
