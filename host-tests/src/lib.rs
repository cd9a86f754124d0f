//! Host-based tests for the OTA updater
//! These tests run on the development machine, not on the ESP32

pub mod device;
