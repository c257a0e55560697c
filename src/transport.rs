//! Transport and session seams for hub connectivity.
//!
//! The manager talks to the wireless stack exclusively through the
//! [`Transport`] and [`HubSession`] traits so its lifecycle policy can be
//! exercised against mocks. The production implementation lives in
//! [`crate::bluetooth::transport`].

use std::{future::Future, path::Path, time::Duration};

use bluer::Address;
use serde_json::json;
use smol_str::SmolStr;

use crate::error::Result;

/// A device seen during discovery, carrying the opaque raw handle a
/// session can be opened from.
#[derive(Debug)]
pub struct Discovered<H> {
   pub name: SmolStr,
   pub address: Address,
   pub handle: H,
}

/// A candidate hub as reported to callers of a scan.
///
/// Scan results are transient; two entries refer to the same hub iff their
/// addresses match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubInfo {
   pub name: SmolStr,
   pub address: Address,
}

impl HubInfo {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "name": self.name.as_str(),
          "address": self.address.to_string(),
      })
   }
}

/// Raw discovery and connection primitives of the wireless link layer.
pub trait Transport: Send + Sync + 'static {
   type Handle: Send + 'static;
   type Session: HubSession;

   /// Discovers nearby devices for the given window. Unfiltered; the
   /// manager applies the firmware-name filter on top.
   fn discover(
      &self,
      timeout: Duration,
   ) -> impl Future<Output = Result<Vec<Discovered<Self::Handle>>>> + Send;

   /// Looks up a single device by address, waiting up to `timeout` for it
   /// to appear. `Ok(None)` means the device was not seen in time.
   fn find_by_address(
      &self,
      address: Address,
      timeout: Duration,
   ) -> impl Future<Output = Result<Option<Self::Handle>>> + Send;

   /// Wraps a raw handle into an unconnected session.
   fn open(&self, handle: Self::Handle) -> Result<Self::Session>;
}

/// A stateful session with one hub, built from a raw transport handle.
///
/// Sessions are cheaply cloneable; all clones refer to the same link. The
/// manager owns the lifecycle and never holds more than one live session.
pub trait HubSession: Clone + Send + Sync + 'static {
   /// Address of the device this session was built from.
   fn address(&self) -> Address;

   /// Establishes the link. Fails on any link-level error; a failed
   /// session must be discarded, not retried.
   fn connect(&self) -> impl Future<Output = Result<()>> + Send;

   /// Tears down the link.
   fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;

   /// Transfers the script file to the hub and starts it. With `wait` the
   /// call returns only once the hub reports program completion; with
   /// `stream_output` each line the program prints is delivered through
   /// the session's event sink as it arrives.
   fn run(
      &self,
      script: &Path,
      wait: bool,
      stream_output: bool,
   ) -> impl Future<Output = Result<()>> + Send;

   /// Halts the running user program without dropping the link.
   fn stop_program(&self) -> impl Future<Output = Result<()>> + Send;
}
