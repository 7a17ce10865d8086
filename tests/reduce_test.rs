mod common;

use admpi_rs::tool::Active;
use admpi_rs::{
    shared, ActiveType, Input, Loc, Operator, PassiveTool, PassiveType, Tape, ValueLocType,
};
use common::{reverse, run_ranks};
use proptest::prelude::*;

#[test]
fn test_product_reduce_distributes_product_of_others() {
    const N: usize = 10;
    const SEEDED: usize = 3;
    let value = |rank: usize, i: usize| (rank + 1) as f64 + 0.5 * i as f64;

    let grads = run_ranks(4, move |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let xs: Vec<_> = (0..N).map(|i| tape.input(value(comm.rank(), i))).collect();
        let mut out = vec![Active::default(); if comm.rank() == 0 { N } else { 0 }];
        comm.reduce(Input::Buf(&xs), &mut out, &ty, &Operator::prod(), 0).unwrap();

        let mut seeds = Vec::new();
        if comm.rank() == 0 {
            for (i, y) in out.iter().enumerate() {
                let expected: f64 = (0..4).map(|r| value(r, i)).product();
                assert!((y.value() - expected).abs() < 1e-9);
            }
            seeds.push((out[SEEDED].index(), 1.0));
        }
        reverse(&tape, &seeds);
        xs.iter().map(|x| tape.gradient(x.index())).collect::<Vec<_>>()
    });

    for (rank, grad) in grads.iter().enumerate() {
        for (i, g) in grad.iter().enumerate() {
            let expected = if i == SEEDED {
                (0..4).filter(|&r| r != rank).map(|r| value(r, i)).product()
            } else {
                0.0
            };
            assert!((g - expected).abs() < 1e-9, "rank {rank} element {i}: {g} != {expected}");
        }
    }
}

#[test]
fn test_product_gradient_through_zero_input() {
    let grads = run_ranks(3, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let x = tape.input([2.0, 0.0, 5.0][comm.rank()]);
        let mut out = vec![Active::default()];
        comm.allreduce(Input::Buf(&[x.clone()]), &mut out, &ty, &Operator::prod()).unwrap();
        assert_eq!(out[0].value(), 0.0);
        let seed = if comm.rank() == 0 { 1.0 } else { 0.0 };
        reverse(&tape, &[(out[0].index(), seed)]);
        tape.gradient(x.index())
    });
    // Only the zero input has a nonzero partial: 2 * 5.
    assert_eq!(grads, vec![0.0, 10.0, 0.0]);
}

#[test]
fn test_product_reduce_to_root_with_zero_inputs() {
    // Element 0 has one zero input, element 1 two, element 2 none.
    let inputs = [[3.0, 0.0, 2.0], [0.0, 0.0, 4.0], [4.0, 5.0, 0.5]];
    let grads = run_ranks(3, move |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let xs: Vec<_> = inputs[comm.rank()].iter().map(|v| tape.input(*v)).collect();
        let mut out = vec![Active::default(); if comm.rank() == 2 { 3 } else { 0 }];
        comm.reduce(Input::Buf(&xs), &mut out, &ty, &Operator::prod(), 2).unwrap();

        let mut seeds = Vec::new();
        if comm.rank() == 2 {
            assert_eq!(out.iter().map(Active::value).collect::<Vec<_>>(), vec![0.0, 0.0, 4.0]);
            seeds.extend(out.iter().map(|y| (y.index(), 1.0)));
        }
        reverse(&tape, &seeds);
        xs.iter().map(|x| tape.gradient(x.index())).collect::<Vec<_>>()
    });
    assert_eq!(grads[0], vec![0.0, 0.0, 2.0]);
    assert_eq!(grads[1], vec![12.0, 0.0, 1.0]);
    assert_eq!(grads[2], vec![0.0, 0.0, 8.0]);
}

#[test]
fn test_max_reduce_routes_gradient_to_selected_rank() {
    let grads = run_ranks(2, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let own = if comm.rank() == 0 { 5.0 } else { 9.0 };
        let xs: Vec<_> = (0..3).map(|_| tape.input(own)).collect();
        let mut out = vec![Active::default(); 3];
        comm.reduce(Input::Buf(&xs), &mut out, &ty, &Operator::max(), 0).unwrap();

        let mut seeds = Vec::new();
        if comm.rank() == 0 {
            assert!(out.iter().all(|y| y.value() == 9.0));
            seeds.push((out[1].index(), 1.0));
        }
        reverse(&tape, &seeds);
        xs.iter().map(|x| tape.gradient(x.index())).collect::<Vec<_>>()
    });
    assert_eq!(grads[0], vec![0.0, 0.0, 0.0]);
    assert_eq!(grads[1], vec![0.0, 1.0, 0.0]);
}

#[test]
fn test_max_ties_go_to_lowest_rank() {
    let grads = run_ranks(3, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let x = tape.input(if comm.rank() == 0 { 1.0 } else { 7.0 });
        let mut out = vec![Active::default()];
        comm.allreduce(Input::Buf(&[x.clone()]), &mut out, &ty, &Operator::max()).unwrap();
        reverse(&tape, &[(out[0].index(), 1.0)]);
        tape.gradient(x.index())
    });
    assert_eq!(grads, vec![0.0, 3.0, 0.0]);
}

#[test]
fn test_min_loc_selects_lowest_location_and_rank() {
    let results = run_ranks(3, |comm, tape| {
        let ty = ValueLocType::new(ActiveType::<Tape>::new());
        tape.set_active();
        let own = Loc::new(tape.input([4.0, 2.0, 2.0][comm.rank()]), comm.rank() as i32);
        let mut out = vec![Loc::default()];
        comm.allreduce(Input::Buf(&[own.clone()]), &mut out, &ty, &Operator::min_loc()).unwrap();
        let (value, loc) = (out[0].value.value(), out[0].loc);
        reverse(&tape, &[(out[0].value.index(), 1.0)]);
        (value, loc, tape.gradient(own.value.index()))
    });
    for (value, loc, _) in &results {
        assert_eq!((*value, *loc), (2.0, 1));
    }
    let grads: Vec<_> = results.iter().map(|r| r.2).collect();
    assert_eq!(grads, vec![0.0, 3.0, 0.0]);
}

#[test]
fn test_scan_and_exscan_gradients() {
    let grads = run_ranks(3, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let x = tape.input(comm.rank() as f64 + 1.0);
        let mut inclusive = vec![Active::default()];
        let mut exclusive = vec![Active::default()];
        comm.scan(Input::Buf(&[x.clone()]), &mut inclusive, &ty, &Operator::sum()).unwrap();
        comm.exscan(Input::Buf(&[x.clone()]), &mut exclusive, &ty, &Operator::sum()).unwrap();

        let rank = comm.rank() as f64;
        assert_eq!(inclusive[0].value(), (rank + 1.0) * (rank + 2.0) / 2.0);
        if comm.rank() == 0 {
            assert!(!exclusive[0].is_active());
        } else {
            assert_eq!(exclusive[0].value(), rank * (rank + 1.0) / 2.0);
        }
        reverse(&tape, &[(inclusive[0].index(), 1.0), (exclusive[0].index(), 10.0)]);
        tape.gradient(x.index())
    });
    // Inclusive: x_s reaches ranks s..3. Exclusive: x_s reaches ranks s+1..3.
    assert_eq!(grads, vec![3.0 + 20.0, 2.0 + 10.0, 1.0]);
}

#[test]
fn test_nonblocking_allreduce_records_at_issue_and_completion() {
    let grads = run_ranks(2, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let x = tape.input(comm.rank() as f64 + 2.0);
        let out = shared(vec![Active::default()]);
        let mut request = comm
            .iallreduce(Input::Buf(&[x.clone()]), out.clone(), &ty, &Operator::sum())
            .unwrap();
        assert_eq!(tape.pending_actions(), 1);
        request.wait().unwrap();
        assert_eq!(tape.pending_actions(), 2);

        let y = out.borrow()[0].clone();
        assert_eq!(y.value(), 5.0);
        let z = y.clone() * y;
        reverse(&tape, &[(z.index(), 1.0)]);
        tape.gradient(x.index())
    });
    // Each rank's z = s^2 contributes 2s = 10 to every input.
    assert_eq!(grads, vec![20.0, 20.0]);
}

#[test]
fn test_nonblocking_max_reduce_resolves_ties_at_completion() {
    let grads = run_ranks(3, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let x = tape.input([1.0, 7.0, 7.0][comm.rank()]);
        let out = shared(vec![Active::default(); if comm.rank() == 0 { 1 } else { 0 }]);
        let mut request = comm
            .ireduce(Input::Buf(&[x.clone()]), out.clone(), &ty, &Operator::max(), 0)
            .unwrap();
        assert_eq!(tape.pending_actions(), 1);
        request.wait().unwrap();
        assert_eq!(tape.pending_actions(), 2);

        let mut seeds = Vec::new();
        if comm.rank() == 0 {
            let y = out.borrow()[0].clone();
            assert_eq!(y.value(), 7.0);
            seeds.push((y.index(), 1.0));
        }
        reverse(&tape, &seeds);
        tape.gradient(x.index())
    });
    assert_eq!(grads, vec![0.0, 1.0, 0.0]);
}

#[test]
fn test_nonblocking_forward_only_allreduce_folds_after_gather() {
    let grads = run_ranks(3, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let x = tape.input(comm.rank() as f64 + 1.0);
        let out = shared(vec![Active::default()]);
        let op = Operator::forward_only(user_sum, true);
        let mut request = comm.iallreduce(Input::Buf(&[x.clone()]), out.clone(), &ty, &op).unwrap();
        request.wait().unwrap();

        let y = out.borrow()[0].clone();
        assert_eq!(y.value(), 6.0);
        reverse(&tape, &[(y.index(), comm.rank() as f64 + 1.0)]);
        tape.gradient(x.index())
    });
    // Every input reaches every rank's sum, weighted 1 + 2 + 3.
    assert_eq!(grads, vec![6.0, 6.0, 6.0]);
}

#[test]
fn test_passive_reduce_in_place_and_fold_order() {
    fn digits(input: &[i64], inout: &mut [i64]) {
        for (a, b) in input.iter().zip(inout.iter_mut()) {
            *b = *b * 10 + a;
        }
    }

    let handles: Vec<_> = admpi_rs::LocalWorld::new(3)
        .into_iter()
        .map(|endpoint| {
            std::thread::spawn(move || {
                let comm = admpi_rs::AdComm::new(endpoint.into_comm(), PassiveTool);
                let ty = PassiveType::<i64>::new();
                let own = comm.rank() as i64 + 1;

                let mut buf = vec![own];
                let own_buf = [own];
                let send = if comm.rank() == 1 { Input::InPlace } else { Input::Buf(&own_buf) };
                comm.reduce(send, &mut buf, &ty, &Operator::sum(), 1).unwrap();
                if comm.rank() == 1 {
                    assert_eq!(buf, vec![6]);
                }

                let mut folded = vec![0];
                let op = Operator::forward_only(digits, false);
                comm.allreduce(Input::Buf(&[own]), &mut folded, &ty, &op).unwrap();
                assert_eq!(folded, vec![321]);

                let mut none: Vec<i64> = Vec::new();
                if comm.rank() != 1 {
                    let sum = Operator::sum();
                    assert!(comm.reduce(Input::InPlace, &mut none, &ty, &sum, 1).is_err());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Sum,
    Prod,
    Min,
    Max,
}

fn user_sum(input: &[Active], inout: &mut [Active]) {
    for (a, b) in input.iter().zip(inout.iter_mut()) {
        *b = a.clone() + b.clone();
    }
}

fn user_prod(input: &[Active], inout: &mut [Active]) {
    for (a, b) in input.iter().zip(inout.iter_mut()) {
        *b = a.clone() * b.clone();
    }
}

fn user_min(input: &[Active], inout: &mut [Active]) {
    for (a, b) in input.iter().zip(inout.iter_mut()) {
        if a <= b {
            *b = a.clone();
        }
    }
}

fn user_max(input: &[Active], inout: &mut [Active]) {
    for (a, b) in input.iter().zip(inout.iter_mut()) {
        if a >= b {
            *b = a.clone();
        }
    }
}

fn operator(kind: Kind, forward_only: bool) -> Operator<Tape, ActiveType<Tape>> {
    match (kind, forward_only) {
        (Kind::Sum, false) => Operator::sum(),
        (Kind::Prod, false) => Operator::prod(),
        (Kind::Min, false) => Operator::min(),
        (Kind::Max, false) => Operator::max(),
        (Kind::Sum, true) => Operator::forward_only(user_sum, true),
        (Kind::Prod, true) => Operator::forward_only(user_prod, true),
        (Kind::Min, true) => Operator::forward_only(user_min, true),
        (Kind::Max, true) => Operator::forward_only(user_max, true),
    }
}

/// Gradients of `Σ_r (r + 1) · allreduce(x)_r` for every rank's inputs.
fn allreduce_gradients(values: Vec<f64>, kind: Kind, forward_only: bool) -> Vec<Vec<f64>> {
    const RANKS: usize = 3;
    let count = values.len() / RANKS;
    run_ranks(RANKS, move |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        let own = &values[comm.rank() * count..(comm.rank() + 1) * count];
        let xs: Vec<_> = own.iter().map(|v| tape.input(*v)).collect();
        let mut out = vec![Active::default(); count];
        comm.allreduce(Input::Buf(&xs), &mut out, &ty, &operator(kind, forward_only)).unwrap();
        let weight = comm.rank() as f64 + 1.0;
        let seeds: Vec<_> = out.iter().map(|y| (y.index(), weight)).collect();
        reverse(&tape, &seeds);
        xs.iter().map(|x| tape.gradient(x.index())).collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_adjoint_reduce_matches_local_fold(
        values in prop::collection::vec(prop_oneof![1 => Just(0.0), 3 => 0.5f64..4.0], 6),
        kind in prop_oneof![Just(Kind::Sum), Just(Kind::Prod), Just(Kind::Min), Just(Kind::Max)],
    ) {
        let direct = allreduce_gradients(values.clone(), kind, false);
        let folded = allreduce_gradients(values, kind, true);
        for (a, b) in direct.iter().flatten().zip(folded.iter().flatten()) {
            prop_assert!((a - b).abs() <= 1e-9 * (1.0 + b.abs()), "{kind:?}: {a} != {b}");
        }
    }

    #[test]
    fn prop_max_loc_tie_break_is_lowest_rank(values in prop::collection::vec(0i32..3, 4)) {
        let expected_value = values.iter().copied().max().unwrap_or_default();
        let expected_rank =
            values.iter().position(|v| *v == expected_value).unwrap_or_default() as i32;
        let results = {
            let values = values.clone();
            run_ranks(4, move |comm, _tape| {
                let ty = ValueLocType::new(PassiveType::<i32>::new());
                let own = Loc::new(values[comm.rank()], comm.rank() as i32);
                let mut out = vec![Loc::default()];
                comm.allreduce(Input::Buf(&[own]), &mut out, &ty, &Operator::max_loc()).unwrap();
                out[0]
            })
        };
        for result in results {
            prop_assert_eq!(result, Loc::new(expected_value, expected_rank));
        }
    }
}
