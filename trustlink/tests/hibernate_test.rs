//! Hibernate gating, context save/restore and wake-up

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{wait_for, SimBus, SimPower, SimState, UID_APDU};
use trustlink::{Apdu, ApduOutcome, Options, SecureElement, HIBERNATE_EXEMPT_SESSIONS};

fn powered_element(state: &Arc<SimState>) -> SecureElement {
    let options = Options {
        power: Some(Box::new(SimPower::new(Arc::clone(state)))),
        hibernate_delay: Duration::from_millis(50),
        ..Options::default()
    };
    SecureElement::start(SimBus::with_uid_device(Arc::clone(state)), options).unwrap()
}

#[test]
fn test_idle_chip_hibernates_and_wakes() {
    let state = SimState::new();
    let element = powered_element(&state);

    // Nothing reserved: the idle timeout closes the application (without
    // saving context) and cuts power
    wait_for("hibernate", || !state.powered.load(Ordering::SeqCst));
    assert_eq!(state.closes.load(Ordering::SeqCst), 1);
    assert_eq!(state.hibernate_closes.load(Ordering::SeqCst), 0);

    // New work wakes the chip transparently
    let (apdu, handle) = Apdu::new(UID_APDU, 1024);
    element.enqueue(apdu);
    assert!(matches!(handle.wait(), Ok(ApduOutcome::Ok(_))));

    assert!(state.power_ups.load(Ordering::SeqCst) >= 2);
    assert_eq!(state.restores.load(Ordering::SeqCst), 0);
}

#[test]
fn test_non_exempt_reservation_blocks_hibernate() {
    let state = SimState::new();
    // Keep the chip from hibernating before the reservation is placed
    state.hibernate_ready.store(false, Ordering::SeqCst);
    let element = powered_element(&state);

    assert!(element.acquire_session(HIBERNATE_EXEMPT_SESSIONS));
    state.hibernate_ready.store(true, Ordering::SeqCst);

    // Give the worker several idle periods; the wake-lock must hold
    thread::sleep(Duration::from_millis(300));
    assert!(state.powered.load(Ordering::SeqCst));
    assert_eq!(state.closes.load(Ordering::SeqCst), 0);
    assert_eq!(state.hibernate_closes.load(Ordering::SeqCst), 0);

    // Releasing the slot lets the chip power down
    element.release_session(HIBERNATE_EXEMPT_SESSIONS);
    wait_for("hibernate", || !state.powered.load(Ordering::SeqCst));
}

#[test]
fn test_exempt_reservation_rides_the_saved_context() {
    let state = SimState::new();
    state.hibernate_ready.store(false, Ordering::SeqCst);
    let element = powered_element(&state);

    // An exempt slot doesn't hold the chip awake; its context travels
    // through the hibernate handle instead
    assert!(element.acquire_session(0));
    state.hibernate_ready.store(true, Ordering::SeqCst);
    wait_for("hibernate", || !state.powered.load(Ordering::SeqCst));
    assert_eq!(state.hibernate_closes.load(Ordering::SeqCst), 1);

    // Wake restores the exact handle the chip handed out
    let (apdu, handle) = Apdu::new(UID_APDU, 1024);
    element.enqueue(apdu);
    assert!(matches!(handle.wait(), Ok(ApduOutcome::Ok(_))));

    assert_eq!(state.restores.load(Ordering::SeqCst), 1);
    assert!(
        !state.handle_mismatch.load(Ordering::SeqCst),
        "context handle must round-trip bit-identically"
    );

    element.release_session(0);
}

#[test]
fn test_failed_wake_fails_the_apdu_and_recovers() {
    let state = SimState::new();
    let element = powered_element(&state);

    wait_for("hibernate", || !state.powered.load(Ordering::SeqCst));

    // The first bus transaction of the wake-up sequence fails
    state.fail_n.store(1, Ordering::SeqCst);

    let (apdu, handle) = Apdu::new(UID_APDU, 1024);
    element.enqueue(apdu);
    assert!(matches!(handle.wait(), Err(trustlink::Error::Transport(_))));

    // The reset path brings the chip back; later requests succeed
    let outcome = loop {
        let (apdu, handle) = Apdu::new(UID_APDU, 1024);
        element.enqueue(apdu);
        match handle.wait() {
            Err(trustlink::Error::DeviceReset) => continue,
            other => break other,
        }
    };
    assert!(matches!(outcome, Ok(ApduOutcome::Ok(_))));
}

#[test]
fn test_chip_not_ready_stays_awake() {
    let state = SimState::new();
    // The chip refuses to close from the start
    state.hibernate_ready.store(false, Ordering::SeqCst);
    let element = powered_element(&state);
    assert!(element.acquire_session(0));

    thread::sleep(Duration::from_millis(300));
    assert!(state.powered.load(Ordering::SeqCst));
    assert_eq!(state.hibernate_closes.load(Ordering::SeqCst), 0);

    // The chip keeps answering in the meantime
    let (apdu, handle) = Apdu::new(UID_APDU, 1024);
    element.enqueue(apdu);
    assert!(matches!(handle.wait(), Ok(ApduOutcome::Ok(_))));

    // Once it is ready, hibernate goes through
    state.hibernate_ready.store(true, Ordering::SeqCst);
    wait_for("hibernate", || !state.powered.load(Ordering::SeqCst));
    assert_eq!(state.hibernate_closes.load(Ordering::SeqCst), 1);
}
