//! Integration tests: timer wheel accuracy and lifecycle through a
//! live reactor.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use eddyline::{Config, ConfigBuilder, Reactor, Timer};

fn fast_config() -> Config {
    ConfigBuilder::new()
        .wheel_slots(64)
        .tick_resolution_ms(20)
        .build()
        .unwrap()
}

#[test]
fn fires_once_near_twice_resolution() {
    let reactor = Reactor::with_config(fast_config()).unwrap();
    let fired = Rc::new(Cell::new(0));

    let counter = Rc::clone(&fired);
    let _timer = Timer::new(&reactor, Duration::from_millis(40), move |_| {
        counter.set(counter.get() + 1);
    });

    let start = Instant::now();
    reactor.run().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(fired.get(), 1);
    // No earlier than the delay rounded down to the resolution; a
    // little scheduling slop on the upper bound.
    assert!(elapsed >= Duration::from_millis(36), "fired at {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(120), "fired at {elapsed:?}");
}

#[test]
fn multi_round_delay_fires_once() {
    // 8 slots x 20ms = one 160ms revolution; 400ms needs three.
    let config = ConfigBuilder::new()
        .wheel_slots(8)
        .tick_resolution_ms(20)
        .build()
        .unwrap();
    let reactor = Reactor::with_config(config).unwrap();
    let fired = Rc::new(Cell::new(0));

    let counter = Rc::clone(&fired);
    let _timer = Timer::new(&reactor, Duration::from_millis(400), move |_| {
        counter.set(counter.get() + 1);
    });

    let start = Instant::now();
    reactor.run().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(fired.get(), 1);
    assert!(elapsed >= Duration::from_millis(380), "fired at {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(520), "fired at {elapsed:?}");
}

#[test]
fn cancelled_timer_never_fires() {
    let reactor = Reactor::with_config(fast_config()).unwrap();
    let fired = Rc::new(Cell::new(0));

    let counter = Rc::clone(&fired);
    let timer = Timer::new(&reactor, Duration::from_millis(100), move |_| {
        counter.set(counter.get() + 1);
    });

    timer.cancel();
    timer.cancel(); // double cancel is a no-op

    let start = Instant::now();
    reactor.run().unwrap();

    assert_eq!(fired.get(), 0);
    // Nothing left to wait for: run returns immediately.
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn reset_from_inside_handler_rearms() {
    let reactor = Reactor::with_config(fast_config()).unwrap();
    let fired = Rc::new(Cell::new(0));

    let counter = Rc::clone(&fired);
    let _timer = Timer::new(&reactor, Duration::from_millis(40), move |timer| {
        counter.set(counter.get() + 1);
        if counter.get() == 1 {
            timer.reset(Duration::from_millis(40));
        }
    });

    let start = Instant::now();
    reactor.run().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(fired.get(), 2);
    assert!(elapsed >= Duration::from_millis(72), "finished at {elapsed:?}");
}

#[test]
fn timers_fire_in_deadline_order() {
    let reactor = Reactor::with_config(fast_config()).unwrap();
    let order = Rc::new(RefCell::new(Vec::<&'static str>::new()));

    let log = Rc::clone(&order);
    let _late = Timer::new(&reactor, Duration::from_millis(80), move |_| {
        log.borrow_mut().push("late");
    });
    let log = Rc::clone(&order);
    let _early = Timer::new(&reactor, Duration::from_millis(40), move |_| {
        log.borrow_mut().push("early");
    });

    reactor.run().unwrap();

    assert_eq!(&*order.borrow(), &["early", "late"]);
}

#[test]
fn reset_before_run_uses_new_delay() {
    let reactor = Reactor::with_config(fast_config()).unwrap();
    let fired = Rc::new(Cell::new(0));

    let counter = Rc::clone(&fired);
    let timer = Timer::new(&reactor, Duration::from_millis(40), move |_| {
        counter.set(counter.get() + 1);
    });
    timer.reset(Duration::from_millis(100));

    let start = Instant::now();
    reactor.run().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(fired.get(), 1);
    assert!(elapsed >= Duration::from_millis(90), "fired at {elapsed:?}");
}

#[test]
fn handler_can_cancel_a_same_batch_timer() {
    let reactor = Reactor::with_config(fast_config()).unwrap();
    let second_fired = Rc::new(Cell::new(false));

    // Both land in the same wheel slot; the first handler cancels the
    // second before the batch reaches it.
    let victim_slot: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&victim_slot);
    let _first = Timer::new(&reactor, Duration::from_millis(40), move |_| {
        if let Some(victim) = slot.borrow_mut().take() {
            victim.cancel();
        }
    });
    let fired = Rc::clone(&second_fired);
    let second = Timer::new(&reactor, Duration::from_millis(40), move |_| {
        fired.set(true);
    });
    *victim_slot.borrow_mut() = Some(second);

    reactor.run().unwrap();
    assert!(!second_fired.get());
}

#[test]
fn dropping_the_handle_does_not_cancel() {
    let reactor = Reactor::with_config(fast_config()).unwrap();
    let fired = Rc::new(Cell::new(0));

    let counter = Rc::clone(&fired);
    let timer = Timer::new(&reactor, Duration::from_millis(40), move |_| {
        counter.set(counter.get() + 1);
    });
    drop(timer); // the wheel keeps its own reference

    reactor.run().unwrap();
    assert_eq!(fired.get(), 1);
}
