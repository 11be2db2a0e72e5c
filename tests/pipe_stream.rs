//! Integration tests: streams over real pipes.
//!
//! Each test builds a reactor, registers both ends of a pipe as
//! streams, and drives data through `run()`.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::rc::Rc;

use eddyline::{BackendKind, Buffer, ConfigBuilder, Reactor, Stream};

fn pipe_pair(reactor: &Reactor) -> (Stream, Stream) {
    let (read_end, write_end) = eddyline::pipe().expect("pipe");
    let rx = Stream::open(reactor, read_end).expect("open read end");
    let tx = Stream::open(reactor, write_end).expect("open write end");
    (rx, tx)
}

#[test]
fn single_byte_end_to_end() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = pipe_pair(&reactor);

    let received = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(0));

    let sink = Rc::clone(&received);
    rx.on_read(move |stream, buffer| {
        sink.borrow_mut().extend_from_slice(buffer.as_slice());
        stream.close();
    });
    for stream in [&rx, &tx] {
        let counter = Rc::clone(&closed);
        stream.on_close(move |_| counter.set(counter.get() + 1));
    }

    tx.push_buffer(&Buffer::from("a"), 0, 0).unwrap();
    tx.shutdown();

    reactor.run().unwrap();

    assert_eq!(&*received.borrow(), b"a");
    assert_eq!(closed.get(), 2);
    assert_eq!(reactor.descriptor_count(), 0);
}

#[test]
fn thousand_buffers_arrive_in_order() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = pipe_pair(&reactor);

    let total = Rc::new(Cell::new(0usize));
    let clean = Rc::new(Cell::new(true));

    let sink = Rc::clone(&total);
    let all_a = Rc::clone(&clean);
    rx.on_read(move |_, buffer| {
        sink.set(sink.get() + buffer.len());
        if buffer.as_slice().iter().any(|&b| b != b'a') {
            all_a.set(false);
        }
    });

    let chunk = Buffer::from_static(b"aaaaaaaaaaaaaaaaaaaa");
    for _ in 0..1000 {
        tx.push_buffer(&chunk, 0, 0).unwrap();
    }
    tx.shutdown();

    reactor.run().unwrap();

    assert_eq!(total.get(), 20_000);
    assert!(clean.get());
}

#[test]
fn views_and_offsets_concatenate_in_push_order() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = pipe_pair(&reactor);

    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    rx.on_read(move |_, buffer| {
        sink.borrow_mut().extend_from_slice(buffer.as_slice());
    });

    let base = Buffer::from_static(b"0123456789");
    tx.push_buffer(&base, 0, 3).unwrap(); // 012
    tx.push_buffer(&base.view(4, 2), 0, 0).unwrap(); // 45
    tx.push_buffer(&base, 7, 0).unwrap(); // 789
    write!(tx, "-{}-", 42).unwrap(); // -42-
    tx.shutdown();

    reactor.run().unwrap();

    assert_eq!(&*received.borrow(), b"01245789-42-");
}

#[test]
fn file_entries_relay_between_buffers() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"FILECONTENT").unwrap();
    file.flush().unwrap();

    let reactor = Reactor::new().unwrap();
    let (rx, tx) = pipe_pair(&reactor);

    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    rx.on_read(move |_, buffer| {
        sink.borrow_mut().extend_from_slice(buffer.as_slice());
    });

    tx.push_buffer(&Buffer::from("pre:"), 0, 0).unwrap();
    tx.push_file(file.reopen().unwrap(), 4, 7).unwrap(); // CONTENT
    tx.push_buffer(&Buffer::from(":post"), 0, 0).unwrap();
    tx.shutdown();

    reactor.run().unwrap();

    assert_eq!(&*received.borrow(), b"pre:CONTENT:post");
}

#[test]
fn peer_close_delivers_exactly_one_close() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = pipe_pair(&reactor);

    let reads_after_eof = Rc::new(Cell::new(0));
    let eof_seen = Rc::new(Cell::new(false));
    let rx_closed = Rc::new(Cell::new(0));

    let late = Rc::clone(&reads_after_eof);
    let eof = Rc::clone(&eof_seen);
    rx.on_read(move |_, _| {
        if eof.get() {
            late.set(late.get() + 1);
        }
    });
    let counter = Rc::clone(&rx_closed);
    let eof = Rc::clone(&eof_seen);
    rx.on_close(move |_| {
        eof.set(true);
        counter.set(counter.get() + 1);
    });

    tx.push_buffer(&Buffer::from("bye"), 0, 0).unwrap();
    tx.shutdown();

    reactor.run().unwrap();

    assert_eq!(rx_closed.get(), 1);
    assert_eq!(reads_after_eof.get(), 0);
}

#[test]
fn shutdown_drains_but_close_discards() {
    // Graceful shutdown: queued bytes arrive.
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = pipe_pair(&reactor);
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    rx.on_read(move |_, buffer| sink.borrow_mut().extend_from_slice(buffer.as_slice()));
    tx.push_buffer(&Buffer::from("drained"), 0, 0).unwrap();
    tx.shutdown();
    reactor.run().unwrap();
    assert_eq!(&*received.borrow(), b"drained");

    // Hard close: queued bytes are discarded.
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = pipe_pair(&reactor);
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    rx.on_read(move |_, buffer| sink.borrow_mut().extend_from_slice(buffer.as_slice()));
    tx.push_buffer(&Buffer::from("discarded"), 0, 0).unwrap();
    tx.close();
    reactor.run().unwrap();
    assert!(received.borrow().is_empty());
}

#[test]
fn every_backend_agrees_on_pipe_flow() {
    let mut kinds = vec![BackendKind::Poll, BackendKind::Select];
    if cfg!(target_os = "linux") {
        kinds.push(BackendKind::Epoll);
    }

    for kind in kinds {
        let config = ConfigBuilder::new().backend(kind).build().unwrap();
        let reactor = Reactor::with_config(config).unwrap();
        let (rx, tx) = pipe_pair(&reactor);

        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        rx.on_read(move |_, buffer| {
            sink.borrow_mut().extend_from_slice(buffer.as_slice());
        });

        for chunk in [&b"alpha "[..], b"beta ", b"gamma"] {
            tx.push_buffer(&Buffer::new(chunk.to_vec()), 0, 0).unwrap();
        }
        tx.shutdown();

        reactor.run().unwrap();
        assert_eq!(&*received.borrow(), b"alpha beta gamma", "{kind:?}");
    }
}

#[test]
fn push_after_close_is_refused() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = pipe_pair(&reactor);

    tx.close();
    assert!(tx.push_buffer(&Buffer::from("late"), 0, 0).is_err());

    rx.close();
    reactor.run().unwrap();
}

#[test]
fn write_handler_fires_when_queue_drains() {
    let reactor = Reactor::new().unwrap();
    let (rx, tx) = pipe_pair(&reactor);

    let drained = Rc::new(Cell::new(0));
    let counter = Rc::clone(&drained);
    tx.on_write(move |stream| {
        counter.set(counter.get() + 1);
        stream.shutdown();
    });
    rx.on_read(|stream, _| stream.close());

    tx.push_buffer(&Buffer::from("payload"), 0, 0).unwrap();
    reactor.run().unwrap();

    assert_eq!(drained.get(), 1);
}
