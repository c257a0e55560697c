//! Bluetooth communication layer for Pybricks hubs.
//!
//! This module provides the BlueZ-backed implementation of the transport
//! seam: adapter setup, device discovery, and address lookup.

pub mod transport;
