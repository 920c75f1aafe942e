//! Property test from spec §8: for any sequence of `START name k` and
//! `CANCEL name`, the set of timers that eventually fire equals the
//! multiset of inserts minus, for each cancel, one matching pending insert
//! (oldest preferred).

use std::time::{Duration, Instant};

use proptest::prelude::*;

use upscore::timer::TimerQueue;

#[derive(Debug, Clone)]
enum Op {
    Start(String, u64),
    Cancel(String),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let name = "[a-c]";
    prop_oneof![
        (name, 0u64..5).prop_map(|(n, k)| Op::Start(n, k)),
        name.prop_map(Op::Cancel),
    ]
}

proptest! {
    #[test]
    fn fired_set_matches_inserts_minus_cancels(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut queue = TimerQueue::new();
        // Models the same FIFO-by-name semantics in plain Rust, to compare
        // against the real queue's behavior.
        let mut model: Vec<String> = Vec::new();

        for op in &ops {
            match op {
                Op::Start(name, offset) => {
                    queue.insert(name.clone(), Duration::from_secs(*offset));
                    model.push(name.clone());
                }
                Op::Cancel(name) => {
                    let found_in_queue = queue.cancel_first(name);
                    let model_pos = model.iter().position(|n| n == name);
                    prop_assert_eq!(found_in_queue, model_pos.is_some());
                    if let Some(pos) = model_pos {
                        model.remove(pos);
                    }
                }
            }
        }

        let fired = queue.sweep(Instant::now() + Duration::from_secs(10));
        let fired_names: Vec<String> = fired.into_iter().map(|t| t.name).collect();
        prop_assert_eq!(fired_names, model);
        prop_assert!(queue.is_empty());
    }
}
