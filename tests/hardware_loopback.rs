//! Hardware-in-the-loop scenarios from `spec.md` §8's end-to-end list.
//!
//! These need a physical device plugged into the test host (a loopback
//! test fixture for scenarios 3-5, a device whose cable the operator
//! physically removes for scenario 6), so they never run as part of an
//! ordinary `cargo test`. Enable with:
//!
//! ```text
//! RUSTFLAGS="--cfg usbx_hardware_tests" cargo test --test hardware_loopback -- --ignored --test-threads=1
//! ```
//!
//! and set `USBX_TEST_VID`/`USBX_TEST_PID` to identify the fixture.

#![cfg(usbx_hardware_tests)]

use std::env;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;
use usb_host::{ControlTransfer, DeviceFilter, Recipient, Registry, RequestType, TransferDirection, UsbDevice};

// All four scenarios drive the same physical fixture through the process
// global `Registry`, so they must not run concurrently with each other.

const OUT_ENDPOINT: u8 = 1;
const IN_ENDPOINT: u8 = 1;

fn fixture_filter() -> DeviceFilter {
    let vid = env::var("USBX_TEST_VID")
        .expect("set USBX_TEST_VID to the loopback fixture's vendor ID")
        .trim_start_matches("0x")
        .parse::<u16>()
        .expect("USBX_TEST_VID must be a valid u16");
    let pid = env::var("USBX_TEST_PID")
        .expect("set USBX_TEST_PID to the loopback fixture's product ID")
        .trim_start_matches("0x")
        .parse::<u16>()
        .expect("USBX_TEST_PID must be a valid u16");
    DeviceFilter {
        vid: Some(vid),
        pid: Some(pid),
        ..Default::default()
    }
}

// Scenario 3: loopback round trip.
#[test]
#[serial]
#[ignore = "requires a physical loopback fixture; run with --cfg usbx_hardware_tests --ignored"]
fn loopback_round_trip() {
    let registry = Registry::global();
    let device = registry
        .find_device(&fixture_filter(), None)
        .unwrap()
        .expect("loopback fixture not connected");

    device.open().unwrap();
    device.claim_interface(0).unwrap();

    let sent: Vec<u8> = (0..12u8).collect();
    device.transfer_out(OUT_ENDPOINT, &sent, Some(Duration::from_secs(1))).unwrap();
    let received = device.transfer_in(IN_ENDPOINT, Some(Duration::from_secs(1))).unwrap();
    assert_eq!(received, sent);

    device.release_interface(0).unwrap();
    device.close();
}

// Scenario 4: halt and recover.
#[test]
#[serial]
#[ignore = "requires a physical loopback fixture; run with --cfg usbx_hardware_tests --ignored"]
fn halt_then_clear_halt_recovers() {
    let registry = Registry::global();
    let device = registry
        .find_device(&fixture_filter(), None)
        .unwrap()
        .expect("loopback fixture not connected");

    device.open().unwrap();
    device.claim_interface(0).unwrap();

    // The fixture is expected to expose a vendor request that halts its
    // OUT endpoint on command.
    let halt_request = ControlTransfer {
        request_type: RequestType::Vendor,
        recipient: Recipient::Endpoint,
        request: 0x01,
        value: 0,
        index: OUT_ENDPOINT as u16,
    };
    device.control_transfer_out(halt_request, None).unwrap();

    let err = device
        .transfer_out(OUT_ENDPOINT, &[0u8; 4], Some(Duration::from_secs(1)))
        .unwrap_err();
    assert!(err.is_stall());

    device.clear_halt(OUT_ENDPOINT, TransferDirection::Out).unwrap();
    let sent = vec![1u8, 2, 3, 4];
    device.transfer_out(OUT_ENDPOINT, &sent, Some(Duration::from_secs(1))).unwrap();
    let received = device.transfer_in(IN_ENDPOINT, Some(Duration::from_secs(1))).unwrap();
    assert_eq!(received, sent);

    device.release_interface(0).unwrap();
    device.close();
}

// Scenario 5: timeout then abort, endpoint remains usable afterward.
#[test]
#[serial]
#[ignore = "requires a physical loopback fixture; run with --cfg usbx_hardware_tests --ignored"]
fn timeout_then_reusable_endpoint() {
    let registry = Registry::global();
    let device = registry
        .find_device(&fixture_filter(), None)
        .unwrap()
        .expect("loopback fixture not connected");

    device.open().unwrap();
    device.claim_interface(0).unwrap();

    let start = Instant::now();
    let err = device.transfer_in(IN_ENDPOINT, Some(Duration::from_millis(200))).unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(1));

    let sent = vec![9u8, 8, 7, 6];
    device.transfer_out(OUT_ENDPOINT, &sent, Some(Duration::from_secs(1))).unwrap();
    let received = device.transfer_in(IN_ENDPOINT, Some(Duration::from_secs(1))).unwrap();
    assert_eq!(received, sent);

    device.release_interface(0).unwrap();
    device.close();
}

// Scenario 6: hot-unplug while a reader is blocked.
#[test]
#[serial]
#[ignore = "requires the operator to physically unplug the fixture; run with --cfg usbx_hardware_tests --ignored"]
fn hot_unplug_wakes_blocked_reader() {
    let registry = Registry::global();
    let device = registry
        .find_device(&fixture_filter(), None)
        .unwrap()
        .expect("loopback fixture not connected");
    device.open().unwrap();
    device.claim_interface(0).unwrap();

    let reader = {
        let device = device.clone();
        thread::spawn(move || device.transfer_in(IN_ENDPOINT, Some(Duration::from_secs(10))))
    };

    eprintln!("physically unplug the fixture now (waiting up to 10s)");
    let result = reader.join().unwrap();
    assert!(result.is_err());
    assert!(!device.is_connected());
    assert!(device.open().is_err());
}
