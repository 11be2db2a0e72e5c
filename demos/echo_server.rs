//! TCP echo server on a single reactor.
//!
//! Run with `cargo run --example echo_server`, then connect with
//! `nc 127.0.0.1 7878`.

use eddyline::{Reactor, Stream, TcpServer};

fn main() -> Result<(), eddyline::Error> {
    let reactor = Reactor::new()?;
    println!("backend: {}", reactor.backend_name());

    let accept_reactor = reactor.clone();
    let server = TcpServer::bind(&reactor, "127.0.0.1", 7878, move |_server, fd, peer| {
        println!("accepted {peer}");
        match Stream::open(&accept_reactor, fd) {
            Ok(conn) => {
                conn.on_read(|stream, buffer| {
                    let _ = stream.push_buffer(&buffer, 0, 0);
                });
                conn.on_close(|stream| println!("closed fd {}", stream.fd()));
            }
            Err(err) => eprintln!("accept failed: {err}"),
        }
    })?;

    println!("listening on {}", server.local_addr()?);
    reactor.run()
}
