//! Integration tests using vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded with two capture devices
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Expected vivid configuration:
//! - Device 1: Gray Ramp pattern (gradient) - `test_pattern=20`
//! - Device 2: 100% Colorbar pattern - `test_pattern=1`
//! - Format: 640x480 YUYV
//!
//! Tests will fail if vivid is not available or not configured correctly.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;

use cam_pipeline::device::V4l2Node;
use cam_pipeline::traits::{Format, FourCC, VideoNode};
use cam_pipeline::validation::{validate_color_bars, validate_gradient};
use serial_test::serial;

/// Find all available vivid virtual camera devices.
///
/// Uses sysfs to check device driver name before opening, avoiding
/// unnecessary device opens on real cameras.
fn find_vivid_devices() -> Vec<u32> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    for index in 0..10 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };

        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        if V4l2Node::open(index).is_ok() {
            devices.push(index);
        }
    }
    devices
}

/// Fail the test if vivid is not available. Returns the first vivid device index.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices().first().copied() {
            Some(idx) => idx,
            None => {
                panic!(
                    "vivid virtual camera not available.\n\
                     Load vivid with: sudo modprobe vivid n_devs=2\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

/// Both vivid devices: (gradient device index, colorbar device index).
macro_rules! require_vivid_pair {
    () => {{
        let devices = find_vivid_devices();
        if devices.len() < 2 {
            panic!(
                "Two vivid devices required but found {}.\n\
                 Load vivid with: sudo modprobe vivid n_devs=2\n\
                 Or run unit tests only: cargo test --lib",
                devices.len()
            );
        }
        (devices[0], devices[1])
    }};
}

/// Open `index`, set 640x480 YUYV and start streaming with every buffer queued.
fn streaming_node(index: u32, buffers: u32) -> (V4l2Node, Format) {
    let mut node = V4l2Node::open(index).expect("Failed to open vivid device");
    let format = node
        .set_format(&Format::new(640, 480, FourCC::YUYV))
        .expect("Failed to set format");
    let granted = node
        .request_buffers(buffers)
        .expect("Failed to request buffers");
    for buffer in 0..granted as usize {
        node.queue(buffer, None).expect("Failed to queue buffer");
    }
    node.stream_on().expect("Failed to start streaming");
    (node, format)
}

#[test]
#[serial]
fn test_vivid_device_open() {
    let device_index = require_vivid!();

    let node = V4l2Node::open(device_index).expect("Failed to open vivid device");
    let caps = node.capabilities();

    assert!(caps.driver.contains("vivid"), "Expected vivid driver");
    assert!(caps.can_capture, "vivid should support capture");
    assert!(caps.can_stream, "vivid should support streaming");
    assert!(node.name().contains("/dev/video"));
}

#[test]
#[serial]
fn test_vivid_set_format() {
    let device_index = require_vivid!();

    let mut node = V4l2Node::open(device_index).expect("Failed to open vivid device");
    let actual = node
        .set_format(&Format::new(640, 480, FourCC::YUYV))
        .expect("Failed to set format");

    assert_eq!(actual.width, 640, "Width mismatch");
    assert_eq!(actual.height, 480, "Height mismatch");
    assert_eq!(actual.fourcc, FourCC::YUYV);

    let queried = node.format().expect("Failed to query format");
    assert_eq!(queried, actual);
}

#[test]
#[serial]
fn test_vivid_indexed_exchange() {
    let device_index = require_vivid!();
    let (mut node, format) = streaming_node(device_index, 4);

    let mut last_timestamp = None;
    for expected in [0usize, 1, 2, 3] {
        let done = node.dequeue().expect("Failed to dequeue frame");
        assert_eq!(done.index, expected, "buffers come back in queue order");
        assert!(done.metadata.is_none());

        let data = node.buffer(done.index).expect("dequeued buffer is mapped");
        assert!(data.len() >= (format.width * format.height * 2) as usize);

        if let Some(prev) = last_timestamp {
            assert!(done.timestamp >= prev, "timestamps go forwards");
        }
        last_timestamp = Some(done.timestamp);
    }

    // Everything is dequeued now: nothing left to hand back.
    assert!(node.dequeue().is_err());

    node.queue(2, None).expect("Failed to requeue buffer");
    assert_eq!(node.dequeue().expect("Failed to dequeue frame").index, 2);
    node.stream_off().expect("Failed to stop streaming");
}

#[test]
#[serial]
fn test_vivid_queue_rejects_bad_index() {
    let device_index = require_vivid!();
    let (mut node, _) = streaming_node(device_index, 2);

    assert!(node.queue(7, None).is_err(), "index out of range");
    assert!(node.queue(0, None).is_err(), "buffer already queued");
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let (gradient_device, _) = require_vivid_pair!();
    let (mut node, format) = streaming_node(gradient_device, 4);

    let done = node.dequeue().expect("Failed to dequeue frame");
    let frame = node.buffer(done.index).expect("dequeued buffer is mapped");

    let result = validate_gradient(frame, &format);
    assert!(
        result.is_ok(),
        "Gradient validation failed on first vivid device.\n\
         Expected Gray Ramp pattern (test_pattern=20).\n\
         Error: {:?}",
        result.err()
    );
}

#[test]
#[serial]
fn test_vivid_colorbar_pattern() {
    let (_, colorbar_device) = require_vivid_pair!();
    let (mut node, format) = streaming_node(colorbar_device, 4);

    let done = node.dequeue().expect("Failed to dequeue frame");
    let frame = node.buffer(done.index).expect("dequeued buffer is mapped");

    let result = validate_color_bars(frame, &format);
    assert!(
        result.is_ok(),
        "Color bars validation failed on second vivid device.\n\
         Expected 100% Colorbar pattern (test_pattern=1).\n\
         Error: {:?}",
        result.err()
    );
}
