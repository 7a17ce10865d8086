use admpi_rs::request::{test_all, wait_all, Request};
use admpi_rs::transport::SendMode;
use admpi_rs::{Error, LocalWorld, Source, Transport};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

fn single() -> Rc<dyn Transport> {
    Rc::new(LocalWorld::new(1).remove(0).into_comm())
}

/// Builds a pending receive with `depth` chained continuations that append their
/// position to `log`.
fn chained_recv(
    transport: &Rc<dyn Transport>,
    tag: i32,
    depth: usize,
    log: &Rc<RefCell<Vec<(i32, usize)>>>,
) -> Request {
    let raw = transport.irecv(Source::Rank(0), tag, 8).unwrap();
    let mut request = Request::new(transport.clone(), raw);
    for k in 0..depth {
        let log = log.clone();
        request = request
            .chain(move |_| {
                log.borrow_mut().push((tag, k));
                Ok(())
            })
            .unwrap();
    }
    request
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_continuations_fire_once_in_order(
        depths in prop::collection::vec(1usize..5, 1..5),
        polls_before_send in 0usize..4,
        polls_after_send in 0usize..3,
    ) {
        let transport = single();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut requests: Vec<Request> = depths
            .iter()
            .enumerate()
            .map(|(tag, depth)| chained_recv(&transport, tag as i32, *depth, &log))
            .collect();

        for _ in 0..polls_before_send {
            prop_assert_eq!(test_all(&mut requests).unwrap(), None);
        }
        prop_assert!(log.borrow().is_empty());

        for tag in 0..depths.len() {
            transport.send(&[tag as u8], 0, tag as i32, SendMode::Standard).unwrap();
        }
        for _ in 0..polls_after_send {
            test_all(&mut requests).unwrap();
        }
        wait_all(&mut requests).unwrap();
        prop_assert!(requests.iter().all(Request::is_null));

        // Every continuation ran once, and each chain ran front to back.
        let mut log = log.borrow().clone();
        prop_assert_eq!(log.len(), depths.iter().sum::<usize>());
        for (tag, depth) in depths.iter().enumerate() {
            let chain: Vec<usize> =
                log.iter().filter(|(t, _)| *t == tag as i32).map(|(_, k)| *k).collect();
            prop_assert_eq!(chain, (0..*depth).collect::<Vec<_>>());
        }
        log.sort();
        log.dedup();
        prop_assert_eq!(log.len(), depths.iter().sum::<usize>());

        wait_all(&mut requests).unwrap();
        prop_assert_eq!(test_all(&mut requests).unwrap().map(|s| s.len()), Some(depths.len()));
    }
}

#[test]
fn test_null_request_calls_are_no_ops() {
    let mut request = Request::null();
    request.wait().unwrap();
    assert!(request.test().unwrap().is_some());
    request.free().unwrap();
    request.free().unwrap();
    assert!(request.is_null());
}

#[test]
fn test_chain_on_null_runs_immediately() {
    let ran = Rc::new(RefCell::new(0));
    let counter = ran.clone();
    let mut request = Request::null()
        .chain(move |_| {
            *counter.borrow_mut() += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(*ran.borrow(), 1);
    request.wait().unwrap();
    assert_eq!(*ran.borrow(), 1);

    let failed = Request::null().chain(|_| Err(Error::InvalidArgument("late bookkeeping".into())));
    assert!(matches!(failed, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_failing_continuation_surfaces_from_wait() {
    let transport = single();
    let raw = transport.isend(vec![0], 0, 3, SendMode::Standard).unwrap();
    let mut request = Request::with_continuation(transport.clone(), raw, |_| {
        Err(Error::InvalidArgument("decode failed".into()))
    });
    assert!(request.wait().is_err());
    assert!(request.is_null());
    let (data, _) = transport.recv(Source::Any, 3, 1).unwrap();
    assert_eq!(data, vec![0]);
}
