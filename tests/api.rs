//! Facade-level checks that only need the environment, not a server.

use segue::{Client, OpenFlags, Status};

#[test]
fn test_open_honors_nojack_env() {
    std::env::set_var("PIPEWIRE_NOJACK", "1");
    let err = Client::open("x", OpenFlags::NULL).unwrap_err();
    assert_eq!(err.status, Status::FAILURE | Status::SERVER_FAILED);
    std::env::remove_var("PIPEWIRE_NOJACK");
}

#[test]
fn test_latency_env_default() {
    let config = segue::ClientConfig::from_env("x");
    assert_eq!(config.latency, "1024/48000");
}

#[test]
fn test_port_type_strings() {
    assert_eq!(segue::port_types::DEFAULT_AUDIO_TYPE, "32 bit float mono audio");
    assert_eq!(segue::port_types::DEFAULT_MIDI_TYPE, "8 bit raw midi");
    assert_eq!(segue::port_types::DEFAULT_VIDEO_TYPE, "32 bit float RGBA video");
    assert_eq!(segue::port_types::OTHER_TYPE, "other");
}

#[test]
fn test_midi_buffer_reexport() {
    let mut mem = vec![0u8; 1024];
    let mut mb = segue::MidiBufferRef::init(&mut mem, 256);
    assert!(mb.event_reserve(0, 3).is_some());
    assert!(mb.event_reserve(5, 10).is_some());
    assert!(mb.event_reserve(4, 1).is_none());
    assert_eq!(mb.lost_event_count(), 1);
    assert_eq!(mb.event_count(), 2);
}
