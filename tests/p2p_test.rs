mod common;

use admpi_rs::request::{wait_all, wait_any};
use admpi_rs::transport::status;
use admpi_rs::tool::Active;
use admpi_rs::{shared, ActiveType, Error, PassiveType, Source, Tape};
use common::{reverse, run_ranks};

#[test]
fn test_send_recv_gradient_flows_back_to_sender() {
    let grads = run_ranks(2, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        if comm.rank() == 0 {
            let x = tape.input(3.0);
            comm.send(&[x.clone()], &ty, 1, 42).unwrap();
            reverse(&tape, &[]);
            tape.gradient(x.index())
        } else {
            let mut y = vec![Default::default()];
            let status = comm.recv(&mut y, &ty, Source::Rank(0), 42).unwrap();
            assert_eq!(status.source, 0);
            assert_eq!(status.tag, 42);
            assert_eq!(comm.count(&status, &ty), 1);
            assert_eq!(y[0].value(), 3.0);
            reverse(&tape, &[(y[0].index(), 100.0)]);
            0.0
        }
    });
    assert_eq!(grads[0], 100.0);
}

#[test]
fn test_send_modes_share_the_same_reverse() {
    let grads = run_ranks(2, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        if comm.rank() == 0 {
            let xs: Vec<_> = (0..4).map(|i| tape.input(i as f64)).collect();
            comm.send(&xs[0..1], &ty, 1, 0).unwrap();
            comm.bsend(&xs[1..2], &ty, 1, 1).unwrap();
            comm.ssend(&xs[2..3], &ty, 1, 2).unwrap();
            comm.rsend(&xs[3..4], &ty, 1, 3).unwrap();
            reverse(&tape, &[]);
            xs.iter().map(|x| tape.gradient(x.index())).collect()
        } else {
            let mut seeds = Vec::new();
            for tag in 0..4 {
                let mut y = vec![Default::default()];
                comm.recv(&mut y, &ty, Source::Rank(0), tag).unwrap();
                seeds.push((y[0].index(), (tag + 1) as f64));
            }
            reverse(&tape, &seeds);
            Vec::new()
        }
    });
    assert_eq!(grads[0], vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_nonblocking_ring_exchange() {
    // Each rank sends x_r to its right neighbour and squares what it receives.
    let grads = run_ranks(3, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        let (rank, size) = (comm.rank(), comm.size());
        tape.set_active();
        let x = tape.input(rank as f64 + 1.0);
        let inbox = shared(vec![Default::default(); 1]);
        let mut requests = vec![
            comm.irecv(inbox.clone(), &ty, Source::Rank((rank + size - 1) % size), 7).unwrap(),
            comm.isend(&[x.clone()], &ty, (rank + 1) % size, 7).unwrap(),
        ];
        wait_all(&mut requests).unwrap();
        assert!(requests.iter().all(|r| r.is_null()));

        let y = inbox.borrow()[0].clone();
        let z = y.clone() * y;
        reverse(&tape, &[(z.index(), 1.0)]);
        tape.gradient(x.index())
    });
    // d(x_r^2)/dx_r = 2 x_r, computed on the right neighbour.
    assert_eq!(grads, vec![2.0, 4.0, 6.0]);
}

#[test]
fn test_sendrecv_swaps_and_reverses() {
    let grads = run_ranks(2, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        let peer = 1 - comm.rank();
        tape.set_active();
        let x = tape.input(10.0 * (comm.rank() as f64 + 1.0));
        let mut y = vec![Default::default()];
        comm.sendrecv(&[x.clone()], &ty, peer, 3, &mut y, &ty, Source::Rank(peer), 3).unwrap();
        assert_eq!(y[0].value(), 10.0 * (peer as f64 + 1.0));
        let w = y[0].clone() * admpi_rs::tool::Active::constant(comm.rank() as f64 + 2.0);
        reverse(&tape, &[(w.index(), 1.0)]);
        tape.gradient(x.index())
    });
    // Rank 0's value is scaled by 3 on rank 1, rank 1's by 2 on rank 0.
    assert_eq!(grads, vec![3.0, 2.0]);
}

#[test]
fn test_persistent_rounds_record_separately() {
    const ROUNDS: usize = 2;
    let grads = run_ranks(2, |comm, tape| {
        let ty = ActiveType::<Tape>::new();
        tape.set_active();
        if comm.rank() == 0 {
            let x = tape.input(3.0);
            let mut send = comm.send_init(shared(vec![x.clone()]), &ty, 1, 9);
            for _ in 0..ROUNDS {
                send.start().unwrap();
                send.wait().unwrap();
            }
            assert_eq!(tape.pending_actions(), 2 * ROUNDS);
            reverse(&tape, &[]);
            tape.gradient(x.index())
        } else {
            let buf = shared(vec![Active::default()]);
            let mut recv = comm.recv_init(buf.clone(), &ty, Source::Rank(0), 9);
            let mut seeds = Vec::new();
            for round in 0..ROUNDS {
                recv.start().unwrap();
                recv.wait().unwrap();
                assert_eq!(buf.borrow()[0].value(), 3.0);
                seeds.push((buf.borrow()[0].index(), round as f64 + 1.0));
            }
            reverse(&tape, &seeds);
            0.0
        }
    });
    assert_eq!(grads[0], 3.0);
}

#[test]
fn test_wait_any_and_probe_on_passive_data() {
    run_ranks(2, |comm, _tape| {
        let ty = PassiveType::<u64>::new();
        if comm.rank() == 0 {
            comm.send(&[11, 12, 13], &ty, 1, 5).unwrap();
            comm.send(&[21], &ty, 1, 6).unwrap();
        } else {
            let probed = comm.probe(Source::Any, 5).unwrap();
            assert_eq!(comm.count(&probed, &ty), 3);

            let (a, b) = (shared(vec![0u64; 4]), shared(vec![0u64; 1]));
            let mut requests = vec![
                comm.irecv(a.clone(), &ty, Source::Rank(0), 5).unwrap(),
                comm.irecv(b.clone(), &ty, Source::Rank(0), 6).unwrap(),
            ];
            let mut seen = Vec::new();
            while let Some((i, status)) = wait_any(&mut requests).unwrap() {
                seen.push((i, comm.count(&status, &ty)));
            }
            seen.sort();
            assert_eq!(seen, vec![(0, 3), (1, 1)]);
            assert_eq!(*a.borrow(), vec![11, 12, 13, 0]);
            assert_eq!(*b.borrow(), vec![21]);
            assert!(comm.iprobe(Source::Any, admpi_rs::transport::ANY_TAG).unwrap().is_none());
        }
    });
}

#[test]
fn test_transport_status_is_reported_verbatim() {
    run_ranks(1, |comm, _tape| {
        let ty = PassiveType::<f32>::new();
        let err = comm.send(&[1.0], &ty, 5, 0).unwrap_err();
        assert_eq!(err.status(), Some(status::ERR_RANK));
        assert!(matches!(err, Error::Transport { .. }));
    });
}

#[test]
fn test_truncated_receive_is_an_error() {
    run_ranks(1, |comm, _tape| {
        let ty = PassiveType::<i16>::new();
        comm.send(&[1, 2, 3], &ty, 0, 1).unwrap();
        let mut small = [0i16; 2];
        assert!(comm.recv(&mut small, &ty, Source::Rank(0), 1).is_err());
    });
}
