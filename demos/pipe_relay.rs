//! Pipe relay: pushes a greeting and a timer-driven follow-up through
//! a pipe registered as two streams.

use std::time::Duration;

use eddyline::{Buffer, Reactor, Stream, Timer};

fn main() -> Result<(), eddyline::Error> {
    let reactor = Reactor::new()?;
    let (read_end, write_end) = eddyline::pipe()?;

    let rx = Stream::open(&reactor, read_end)?;
    let tx = Stream::open(&reactor, write_end)?;

    rx.on_read(|_, buffer| {
        println!("received: {}", String::from_utf8_lossy(buffer.as_slice()));
    });

    tx.push_buffer(&Buffer::from("hello from the write end\n"), 0, 0)?;

    let follow_up = tx.clone();
    let _timer = Timer::new(&reactor, Duration::from_millis(500), move |_| {
        let _ = follow_up.write_fmt(format_args!("and a delayed line\n"));
        follow_up.shutdown();
    });

    reactor.run()
}
