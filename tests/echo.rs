use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use sable_io::{Address, ConstBuffer, Deadline, MutableBuffer, Server, SocketOptions, Status};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Installs an echoing accept callback: every accepted channel receives up
/// to `chunk` bytes at a time and sends them straight back.
fn add_echo_listener(server: &mut Server, addr: &Address, chunk: usize) -> i32 {
    server
        .add_listener(
            addr,
            Box::new(move |ctl, _lfd, cfd, _remote| {
                if cfd < 0 {
                    return;
                }

                ctl.accept_channel(
                    cfd,
                    Box::new(|ctl, fd, status, buf| {
                        if status != Status::Ok {
                            return;
                        }
                        let len = buf.end();
                        if let Some(mem) = buf.detach() {
                            let mut out = ConstBuffer::attach(mem);
                            out.set_limit(len);
                            ctl.send(fd, out, Deadline::NEVER);
                        }
                    }),
                    Box::new(move |ctl, fd, status, _buf| {
                        if status == Status::Ok {
                            ctl.begin_receive_some(
                                fd,
                                MutableBuffer::with_capacity(chunk),
                                Deadline::NEVER,
                            );
                        }
                    }),
                    Box::new(|_ctl, _fd| {}),
                );
                ctl.begin_receive_some(cfd, MutableBuffer::with_capacity(chunk), Deadline::NEVER);
            }),
        )
        .unwrap()
}

#[test]
fn tcp_echo_roundtrip() {
    init();

    let mut server = Server::new().unwrap();
    let addr = Address::parse("tcp://127.0.0.1:0").unwrap();

    let lfd = add_echo_listener(&mut server, &addr, 1024);

    let local = server.listener_addr(lfd).unwrap();
    assert_ne!(local.port(), 0);
    assert_eq!(local.host(), "127.0.0.1");

    let got = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(RefCell::new(0u32));

    let got2 = got.clone();
    let closed2 = closed.clone();

    server
        .open_channel(
            &local,
            SocketOptions::linger() | SocketOptions::tcp_nodelay(),
            Deadline::after(Duration::from_secs(5)),
            Box::new(|ctl, fd, status| {
                assert_eq!(status, Status::Ok);
                ctl.send(fd, ConstBuffer::copy_from(b"hello\n"), Deadline::NEVER);
                ctl.begin_receive(
                    fd,
                    MutableBuffer::with_capacity(6),
                    Deadline::after(Duration::from_secs(5)),
                );
            }),
            Box::new(move |ctl, fd, status, buf| {
                assert_eq!(status, Status::Ok);
                got2.borrow_mut().extend_from_slice(buf.filled());
                ctl.close_channel(fd);
            }),
            Box::new(|_ctl, _fd, status, _buf| {
                assert_eq!(status, Status::Ok);
            }),
            Box::new(move |ctl, _fd| {
                *closed2.borrow_mut() += 1;
                ctl.exit_loop();
            }),
        )
        .unwrap();

    server.run().unwrap();

    assert_eq!(got.borrow().as_slice(), b"hello\n");
    assert_eq!(*closed.borrow(), 1);
}

#[test]
fn unix_echo_roundtrip() {
    init();

    let path = std::env::temp_dir().join(format!("sable-echo-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let addr = Address::unix(path.to_str().unwrap()).unwrap();

    let mut server = Server::new().unwrap();
    add_echo_listener(&mut server, &addr, 256);

    let done = Rc::new(RefCell::new(false));
    let done2 = done.clone();

    server
        .open_channel(
            &addr,
            SocketOptions::empty(),
            Deadline::after(Duration::from_secs(5)),
            Box::new(|ctl, fd, status| {
                assert_eq!(status, Status::Ok);
                ctl.send(fd, ConstBuffer::copy_from(b"ping"), Deadline::NEVER);
                ctl.begin_receive(
                    fd,
                    MutableBuffer::with_capacity(4),
                    Deadline::after(Duration::from_secs(5)),
                );
            }),
            Box::new(move |ctl, fd, status, buf| {
                assert_eq!(status, Status::Ok);
                assert_eq!(buf.filled(), b"ping");
                *done2.borrow_mut() = true;
                ctl.close_channel(fd);
            }),
            Box::new(|_ctl, _fd, _status, _buf| {}),
            Box::new(|ctl, _fd| ctl.exit_loop()),
        )
        .unwrap();

    server.run().unwrap();

    assert!(*done.borrow());

    let _ = std::fs::remove_file(&path);
}

#[test]
fn large_payload_echo() {
    init();

    let mut server = Server::new().unwrap();
    let addr = Address::parse("tcp://127.0.0.1:0").unwrap();
    let lfd = add_echo_listener(&mut server, &addr, 16 * 1024);
    let local = server.listener_addr(lfd).unwrap();

    let payload: Vec<u8> = (0..512 * 1024).map(|_| rand::random::<u8>()).collect();
    let len = payload.len();
    let expect = payload.clone();

    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();

    server
        .open_channel(
            &local,
            SocketOptions::tcp_nodelay(),
            Deadline::after(Duration::from_secs(5)),
            Box::new(move |ctl, fd, status| {
                assert_eq!(status, Status::Ok);
                ctl.send(
                    fd,
                    ConstBuffer::from(payload.clone()),
                    Deadline::after(Duration::from_secs(10)),
                );
                ctl.begin_receive(
                    fd,
                    MutableBuffer::with_capacity(len),
                    Deadline::after(Duration::from_secs(10)),
                );
            }),
            Box::new(move |ctl, fd, status, buf| {
                assert_eq!(status, Status::Ok);
                got2.borrow_mut().extend_from_slice(buf.filled());
                ctl.close_channel(fd);
            }),
            Box::new(|_ctl, _fd, status, _buf| {
                assert_eq!(status, Status::Ok);
            }),
            Box::new(|ctl, _fd| ctl.exit_loop()),
        )
        .unwrap();

    server.run().unwrap();

    assert_eq!(got.borrow().len(), expect.len());
    assert_eq!(got.borrow().as_slice(), expect.as_slice());
}
