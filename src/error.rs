// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Error types shared across the crate, mirroring the numeric return-code
//! contract in the external interface (`SUCCESS/FAILED/STATE/PARAMETERS/TIMEOUT`).

/// The crate's public error type. Every operation that the external contract
/// gives a return code returns `Result<T, Error>`; `i32::from(&Error)` recovers
/// that code for callers that want the C-style contract.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    Parameters(String),

    #[error("invalid operation for current state: {0}")]
    State(String),

    #[error("operation timed out")]
    Timeout,

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("device fatal error: {0}")]
    DeviceFatal(String),

    #[error("{0}")]
    Failed(String),
}

impl Error {
    pub fn parameters(msg: impl Into<String>) -> Self {
        Error::Parameters(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }

    pub fn device_fatal(msg: impl Into<String>) -> Self {
        Error::DeviceFatal(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }
}

impl From<&Error> for i32 {
    fn from(e: &Error) -> i32 {
        match e {
            Error::Failed(_) => -1,
            Error::State(_) => -2,
            Error::Parameters(_) => -3,
            Error::Timeout => -4,
            // Resource and DeviceFatal don't have a dedicated slot in the
            // original four-code contract; they surface as FAILED to
            // external callers while remaining distinguishable internally.
            Error::Resource(_) => -1,
            Error::DeviceFatal(_) => -1,
        }
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> i32 {
        (&e).into()
    }
}

/// Converts an internal `anyhow` failure (scaler carrier setup, device
/// session bring-up, NAL scanning, ...) into the public error type at an API
/// boundary.
pub fn from_anyhow(e: anyhow::Error) -> Error {
    Error::Failed(e.to_string())
}

pub type Result<T> = std::result::Result<T, Error>;
