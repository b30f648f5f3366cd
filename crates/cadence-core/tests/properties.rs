use proptest::prelude::*;

use fixtures::*;

use cadence_core::cascade::UpdateRequest;
use cadence_core::error::EngineError;
use cadence_core::model::{
    Belong, ItemType, IterationId, ProjectId, State, StateId, StateRelation,
};
use cadence_core::schedule;
use cadence_core::store::SqliteStore;
use cadence_core::transition::{self, Identity};
use chrono::{DateTime, Duration, TimeZone, Utc};

const TASK_STATES: [StateId; 4] = [TODO, DOING, DONE, REOPENED];

fn arb_instant() -> impl Strategy<Value = DateTime<Utc>> {
    // 1970 .. 2096, second precision plus a sub-second offset.
    (0i64..4_000_000_000, 0u32..1_000_000_000)
        .prop_map(|(secs, nanos)| Utc.timestamp_opt(secs, nanos).unwrap())
}

fn arb_edges() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0usize..4, 0usize..4), 0..12)
}

fn graph_store(edges: &[(usize, usize)]) -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    let belongs = [Belong::Open, Belong::Working, Belong::Done, Belong::Reopen];
    for (index, (id, belong)) in TASK_STATES.into_iter().zip(belongs).enumerate() {
        store
            .put_state(&State {
                id,
                project_id: PROJECT,
                item_type: ItemType::Task,
                name: format!("s{}", id.get()),
                belong,
                index: i64::try_from(index).unwrap(),
            })
            .unwrap();
    }
    // Same ids in another project must never leak into this one.
    store
        .put_state(&State {
            id: StateId(50),
            project_id: ProjectId(2),
            item_type: ItemType::Task,
            name: "elsewhere".into(),
            belong: Belong::Working,
            index: 0,
        })
        .unwrap();
    for &(from, to) in edges {
        store
            .put_state_relation(&StateRelation {
                project_id: PROJECT,
                item_type: ItemType::Task,
                start_state_id: TASK_STATES[from],
                end_state_id: TASK_STATES[to],
            })
            .unwrap();
    }
    store
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(64))]

    #[test]
    fn batch_and_single_buttons_agree(edges in arb_edges()) {
        let store = graph_store(&edges);
        let batch = transition::compute_legal_transitions_batch(
            &store,
            PROJECT,
            &[ItemType::Task, ItemType::Task],
        )
        .unwrap();
        let by_state = &batch[&ItemType::Task];
        prop_assert_eq!(by_state.len(), TASK_STATES.len());

        for state in TASK_STATES {
            let single =
                transition::compute_legal_transitions(&store, PROJECT, ItemType::Task, state).unwrap();
            prop_assert_eq!(&single, &by_state[&state]);
        }
    }

    #[test]
    fn buttons_reflect_edges_exactly(edges in arb_edges()) {
        let store = graph_store(&edges);
        for (i, state) in TASK_STATES.into_iter().enumerate() {
            let buttons =
                transition::compute_legal_transitions(&store, PROJECT, ItemType::Task, state).unwrap();
            let has_exit = edges.iter().any(|&(from, to)| from == i && to != i);

            let own = buttons.iter().find(|b| b.state_id == state);
            prop_assert!(own.is_some_and(|b| b.permission));
            prop_assert!(buttons.iter().all(|b| b.state_id != StateId(50)));

            if has_exit {
                prop_assert_eq!(buttons.len(), TASK_STATES.len());
                for (j, button) in buttons.iter().enumerate() {
                    let expected = i == j || edges.contains(&(i, j));
                    prop_assert_eq!(button.permission, expected);
                }
            } else {
                prop_assert_eq!(buttons.len(), 1);
            }
        }
    }

    #[test]
    fn truncate_to_day_is_idempotent_and_keeps_the_date(t in arb_instant()) {
        let day = schedule::truncate_to_day(t);
        prop_assert_eq!(schedule::truncate_to_day(day), day);
        prop_assert_eq!(day.date_naive(), t.date_naive());
        prop_assert!(day <= t);
        prop_assert!(t - day < Duration::days(1));
    }

    #[test]
    fn start_repair_always_restores_order(a in arb_instant(), b in arb_instant()) {
        let mut started = Some(a);
        let finished = Some(b);
        if schedule::validate_order(started, finished).is_err() {
            started = schedule::adjust_plan_started(true, finished);
        }
        prop_assert!(schedule::validate_order(started, finished).is_ok());
        prop_assert!(started.is_some());
    }

    #[test]
    fn expiry_buckets_never_get_closer_as_finish_moves_out(
        now in arb_instant(),
        offset in 0i64..400,
        step in 1i64..40,
    ) {
        let near = schedule::expiry_status(Some(now + Duration::days(offset)), now);
        let far = schedule::expiry_status(Some(now + Duration::days(offset + step)), now);
        prop_assert!(rank(far) >= rank(near));
    }
}

fn rank(status: cadence_core::model::ExpiryStatus) -> u8 {
    use cadence_core::model::ExpiryStatus as E;
    match status {
        E::Unspecified => 0,
        E::Expired => 1,
        E::ExpireIn1Day => 2,
        E::ExpireIn2Days => 3,
        E::ExpireIn7Days => 4,
        E::ExpireIn30Days => 5,
        E::ExpireInFuture => 6,
    }
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(24))]

    #[test]
    fn lifecycle_counters_hold_over_any_walk(targets in prop::collection::vec(0usize..4, 1..16)) {
        let fx = Fixture::new();
        let task = fx.create(ItemType::Task, TODO, SPRINT_1, None, (None, None));

        let mut reopens = 0u32;
        let mut last_count = 0u32;
        for target in targets {
            let target = TASK_STATES[target];
            let result = fx
                .engine
                .update_item(&UpdateRequest::new(task.id, Identity::user("ann")).state(target));
            let item = match result {
                Ok(outcome) => {
                    if target == REOPENED && !outcome.deltas.is_empty() {
                        reopens += 1;
                    }
                    outcome.item
                }
                Err(EngineError::IllegalTransition { .. }) => fx.get(task.id),
                Err(other) => return Err(TestCaseError::fail(other.to_string())),
            };

            prop_assert!(item.reopen_count >= last_count);
            last_count = item.reopen_count;
            prop_assert_eq!(item.reopen_count, reopens);
            prop_assert_eq!(item.finish_time.is_some(), item.state == DONE);
            prop_assert_eq!(item.start_time.is_some(), item.state != TODO);
        }
    }
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(24))]

    #[test]
    fn applying_the_same_update_twice_writes_once(
        target in 0usize..4,
        iteration in prop::sample::select(vec![SPRINT_1, SPRINT_2, IterationId::UNASSIGNED]),
        start_day in 1u32..20,
        length in 0u32..8,
    ) {
        let fx = Fixture::new();
        let req = fx.create(
            ItemType::Requirement,
            REQ_NEW,
            IterationId::UNASSIGNED,
            None,
            (None, None),
        );
        let task = fx.create(
            ItemType::Task,
            TODO,
            SPRINT_1,
            Some(req.id),
            (Some(at(2, start_day)), Some(at(2, start_day + length))),
        );

        let request = UpdateRequest::new(task.id, Identity::user("ann"))
            .state(TASK_STATES[target])
            .iteration(iteration);
        if fx.engine.update_item(&request).is_err() {
            return Ok(());
        }
        let task_after = fx.get(task.id);
        let req_after = fx.get(req.id);
        let deltas = (fx.delta_count(task.id), fx.delta_count(req.id));

        let second = fx.engine.update_item(&request).unwrap();
        prop_assert!(second.deltas.is_empty());
        prop_assert_eq!(fx.get(task.id), task_after);
        prop_assert_eq!(fx.get(req.id), req_after);
        prop_assert_eq!((fx.delta_count(task.id), fx.delta_count(req.id)), deltas);
    }
}
