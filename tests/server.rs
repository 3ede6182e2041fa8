use std::cell::RefCell;
use std::net::Shutdown;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use sable_io::{
    Address, ConstBuffer, Deadline, MutableBuffer, SelectorOptions, Server, SocketOptions, Status,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn silent_listener(server: &mut Server) -> Address {
    let addr = Address::parse("tcp://127.0.0.1:0").unwrap();
    let lfd = server
        .add_listener(
            &addr,
            Box::new(|ctl, _lfd, cfd, _remote| {
                if cfd < 0 {
                    return;
                }
                ctl.accept_channel(
                    cfd,
                    Box::new(|_ctl, _fd, _status, _buf| {}),
                    Box::new(|_ctl, _fd, _status, _buf| {}),
                    Box::new(|_ctl, _fd| {}),
                );
            }),
        )
        .unwrap();
    server.listener_addr(lfd).unwrap()
}

#[test]
fn shutdown_cancels_queued_sends_in_order() {
    init();

    let mut server = Server::new().unwrap();
    let local = silent_listener(&mut server);

    // (buffer tag, status) per completion, in delivery order
    let completions: Rc<RefCell<Vec<(u8, Status)>>> = Rc::new(RefCell::new(Vec::new()));
    let cp = completions.clone();

    server
        .open_channel(
            &local,
            SocketOptions::empty(),
            Deadline::after(Duration::from_secs(5)),
            Box::new(|ctl, fd, status| {
                assert_eq!(status, Status::Ok);
                for tag in 1..=5u8 {
                    ctl.send(fd, ConstBuffer::from(vec![tag; 1024]), Deadline::NEVER);
                }
            }),
            Box::new(|_ctl, _fd, _status, _buf| {}),
            Box::new(move |ctl, fd, status, buf| {
                // a drained buffer identifies itself by what went out, a
                // cancelled one by what never did
                let tag = buf
                    .sent()
                    .first()
                    .or_else(|| buf.pending().first())
                    .copied()
                    .unwrap_or(0);
                cp.borrow_mut().push((tag, status));

                if status == Status::Ok && tag == 1 {
                    // first buffer drained; the queued rest must cancel
                    ctl.shutdown_channel(fd, Shutdown::Write);
                    ctl.close_channel(fd);
                }
            }),
            Box::new(|ctl, _fd| ctl.exit_loop()),
        )
        .unwrap();

    server.run().unwrap();

    let completions = completions.borrow();
    assert_eq!(completions[0], (1, Status::Ok));
    assert_eq!(
        &completions[1..],
        &[
            (2, Status::Cancelled),
            (3, Status::Cancelled),
            (4, Status::Cancelled),
            (5, Status::Cancelled),
        ]
    );
}

#[test]
fn accept_drains_backlog() {
    init();

    const CLIENTS: usize = 10;

    let mut server = Server::new().unwrap();
    let addr = Address::parse("tcp://127.0.0.1:0").unwrap();

    let accepted: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
    let acc = accepted.clone();

    let lfd = server
        .add_listener(
            &addr,
            Box::new(move |ctl, _lfd, cfd, remote| {
                assert!(cfd >= 0);
                assert!(remote.is_some());
                acc.borrow_mut().push(cfd);
                ctl.accept_channel(
                    cfd,
                    Box::new(|_ctl, _fd, _status, _buf| {}),
                    Box::new(|_ctl, _fd, _status, _buf| {}),
                    Box::new(|_ctl, _fd| {}),
                );
                if acc.borrow().len() == CLIENTS {
                    ctl.exit_loop();
                }
            }),
        )
        .unwrap();

    let local = server.listener_addr(lfd).unwrap();
    let target = format!("{}:{}", local.host(), local.port());

    let t = thread::spawn(move || {
        let streams: Vec<_> = (0..CLIENTS)
            .map(|_| std::net::TcpStream::connect(&target).unwrap())
            .collect();
        // hold the sockets open until the server has counted them
        thread::sleep(Duration::from_secs(2));
        drop(streams);
    });

    server.set_idle_interval(Some(Duration::from_millis(100)));
    server.run().unwrap();
    t.join().unwrap();

    let accepted = accepted.borrow();
    assert_eq!(accepted.len(), CLIENTS);

    let mut distinct = accepted.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), CLIENTS, "client fds must be distinct");
}

#[test]
fn cross_thread_wakeup_interrupts_idle_wait() {
    init();

    let mut server = Server::with_options(SelectorOptions::thread_safe()).unwrap();
    server.set_idle_interval(Some(Duration::from_secs(60)));

    let waker = server.waker().unwrap();
    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        waker.wake().unwrap();
    });

    let start = Instant::now();
    let n = server.run_once().unwrap();
    let elapsed = start.elapsed();
    t.join().unwrap();

    assert!(n >= 1, "the wake-up must end the wait");
    assert!(
        elapsed < Duration::from_secs(5),
        "run_once blocked for {:?}",
        elapsed
    );
}

#[test]
fn waker_requires_thread_safe_option() {
    let server = Server::new().unwrap();
    assert!(server.waker().is_err());

    let server = Server::with_options(SelectorOptions::thread_safe()).unwrap();
    assert!(server.waker().is_ok());
}

#[test]
fn receive_completions_follow_submission_order() {
    init();

    let mut server = Server::new().unwrap();
    let addr = Address::parse("tcp://127.0.0.1:0").unwrap();

    let chunks: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let ch = chunks.clone();

    let lfd = server
        .add_listener(
            &addr,
            Box::new(move |ctl, _lfd, cfd, _remote| {
                if cfd < 0 {
                    return;
                }
                let ch = ch.clone();
                ctl.accept_channel(
                    cfd,
                    Box::new(move |ctl, fd, status, buf| {
                        assert_eq!(status, Status::Ok);
                        ch.borrow_mut().push(buf.filled().to_vec());
                        if ch.borrow().len() == 3 {
                            ctl.close_channel(fd);
                            ctl.exit_loop();
                        }
                    }),
                    Box::new(|_ctl, _fd, _status, _buf| {}),
                    Box::new(|_ctl, _fd| {}),
                );
                // three exact receives queued up-front, in order
                for _ in 0..3 {
                    ctl.begin_receive(cfd, MutableBuffer::with_capacity(3), Deadline::NEVER);
                }
            }),
        )
        .unwrap();

    let local = server.listener_addr(lfd).unwrap();

    server
        .open_channel(
            &local,
            SocketOptions::empty(),
            Deadline::after(Duration::from_secs(5)),
            Box::new(|ctl, fd, status| {
                assert_eq!(status, Status::Ok);
                ctl.send(fd, ConstBuffer::copy_from(b"abcdefghi"), Deadline::NEVER);
            }),
            Box::new(|_ctl, _fd, _status, _buf| {}),
            Box::new(|_ctl, _fd, status, _buf| {
                assert_eq!(status, Status::Ok);
            }),
            Box::new(|_ctl, _fd| {}),
        )
        .unwrap();

    server.run().unwrap();

    assert_eq!(
        chunks.borrow().as_slice(),
        &[b"abc".to_vec(), b"def".to_vec(), b"ghi".to_vec()]
    );
}

#[test]
fn zero_length_send_completes_immediately() {
    init();

    let mut server = Server::new().unwrap();
    let local = silent_listener(&mut server);

    let sent = Rc::new(RefCell::new(None));
    let st = sent.clone();

    server
        .open_channel(
            &local,
            SocketOptions::empty(),
            Deadline::after(Duration::from_secs(5)),
            Box::new(|ctl, fd, status| {
                assert_eq!(status, Status::Ok);
                ctl.send(fd, ConstBuffer::from(Vec::new()), Deadline::NEVER);
            }),
            Box::new(|_ctl, _fd, _status, _buf| {}),
            Box::new(move |ctl, fd, status, _buf| {
                *st.borrow_mut() = Some(status);
                ctl.close_channel(fd);
            }),
            Box::new(|ctl, _fd| ctl.exit_loop()),
        )
        .unwrap();

    server.run().unwrap();

    assert_eq!(*sent.borrow(), Some(Status::Ok));
}

#[test]
fn idle_callback_fires_on_empty_round() {
    init();

    let mut server = Server::new().unwrap();
    server.set_idle_interval(Some(Duration::from_millis(50)));

    let idles = Rc::new(RefCell::new(0u32));
    let id = idles.clone();

    server.set_idle_callback(Box::new(move |ctl, status| {
        assert_eq!(status, Status::Ok);
        *id.borrow_mut() += 1;
        ctl.exit_loop();
    }));

    let start = Instant::now();
    server.run().unwrap();

    assert_eq!(*idles.borrow(), 1);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn send_on_unknown_fd_is_rejected() {
    let mut server = Server::new().unwrap();

    let err = server
        .send(999, ConstBuffer::copy_from(b"x"), Deadline::NEVER)
        .unwrap_err();
    assert!(matches!(err, sable_io::Error::UnknownFd(999)));

    let err = server
        .begin_receive(999, MutableBuffer::with_capacity(4), Deadline::NEVER)
        .unwrap_err();
    assert!(matches!(err, sable_io::Error::UnknownFd(999)));

    assert!(server.close_channel(999).is_err());
    assert!(server.shutdown_channel(999, Shutdown::Both).is_err());
}

#[test]
fn double_shutdown_is_rejected() {
    init();

    let mut server = Server::new().unwrap();
    let local = silent_listener(&mut server);

    let fd = server
        .open_channel(
            &local,
            SocketOptions::empty(),
            Deadline::after(Duration::from_secs(5)),
            Box::new(|_ctl, _fd, status| {
                assert_eq!(status, Status::Ok);
            }),
            Box::new(|_ctl, _fd, _status, _buf| {}),
            Box::new(|_ctl, _fd, _status, _buf| {}),
            Box::new(|_ctl, _fd| {}),
        )
        .unwrap();

    // drive the loop until the connect completes
    server.set_idle_interval(Some(Duration::from_millis(20)));
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.channel_state(fd) != Some(sable_io::ChannelState::Open) {
        server.run_once().unwrap();
        assert!(Instant::now() < deadline, "channel never opened");
    }

    server.shutdown_channel(fd, Shutdown::Write).unwrap();
    let err = server.shutdown_channel(fd, Shutdown::Write).unwrap_err();
    assert!(matches!(err, sable_io::Error::Closed(_)));
}
