// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::object::ObjectRef;
use core::fmt;

/// A process hook failed and the tick had no `on_error` callback to absorb it.
#[derive(Debug)]
pub struct HookError {
    pub object: ObjectRef,
    pub(crate) source: anyhow::Error,
}

impl HookError {
    /// The error returned by the hook.
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }

    pub fn into_source(self) -> anyhow::Error {
        self.source
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process hook of {:?} failed: {}", self.object, self.source)
    }
}

impl core::error::Error for HookError {}

/// Errors produced by the ASAP emulation loop.
#[derive(Debug)]
pub enum DriveError {
    /// A process hook failed.
    Hook(HookError),
    /// The controller reported no pending deadline while live objects remain;
    /// virtual time can never advance again.
    Stalled,
}

impl From<HookError> for DriveError {
    fn from(err: HookError) -> Self {
        Self::Hook(err)
    }
}

impl fmt::Display for DriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveError::Hook(err) => err.fmt(f),
            DriveError::Stalled => {
                f.write_str("no pending deadline while live objects remain; emulated time is stuck")
            }
        }
    }
}

impl core::error::Error for DriveError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            DriveError::Hook(err) => Some(err),
            DriveError::Stalled => None,
        }
    }
}
