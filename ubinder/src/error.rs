/*
 * Copyright (C) 2023 The Android Open Source Project
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io;
use std::result;

/// Raw status value used on the wire and in reply headers.
#[allow(non_camel_case_types)]
pub type status_t = i32;

/// Low-level status codes from `libutils`.
// All error codes are negative integer values, derived from the anonymous
// enum in utils/Errors.h. `OK` is the only non-error value.
#[allow(non_camel_case_types)]
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    OK = 0,
    UNKNOWN_ERROR = i32::MIN,
    NO_MEMORY = -libc::ENOMEM,
    INVALID_OPERATION = -libc::ENOSYS,
    BAD_VALUE = -libc::EINVAL,
    BAD_TYPE = i32::MIN + 1,
    NAME_NOT_FOUND = -libc::ENOENT,
    PERMISSION_DENIED = -libc::EPERM,
    NO_INIT = -libc::ENODEV,
    ALREADY_EXISTS = -libc::EEXIST,
    DEAD_OBJECT = -libc::EPIPE,
    FAILED_TRANSACTION = i32::MIN + 2,
    BAD_INDEX = -libc::EOVERFLOW,
    NOT_ENOUGH_DATA = -libc::ENODATA,
    WOULD_BLOCK = -libc::EWOULDBLOCK,
    TIMED_OUT = -libc::ETIMEDOUT,
    UNKNOWN_TRANSACTION = -libc::EBADMSG,
    FDS_NOT_ALLOWED = i32::MIN + 7,
    UNEXPECTED_NULL = i32::MIN + 8,
}

/// A specialized [`Result`](result::Result) for binder operations.
pub type Result<T> = result::Result<T, StatusCode>;

/// Convert a low-level status code into an empty result.
///
/// An OK status is converted into an `Ok` result, any other status is
/// converted into an `Err` result holding the status code.
pub fn status_result(status: status_t) -> Result<()> {
    match parse_status_code(status) {
        StatusCode::OK => Ok(()),
        e => Err(e),
    }
}

/// Convert an empty result back into the raw status value it came from.
pub fn result_status(result: Result<()>) -> status_t {
    match result {
        Ok(()) => StatusCode::OK as status_t,
        Err(e) => e as status_t,
    }
}

pub(crate) fn parse_status_code(code: i32) -> StatusCode {
    match code {
        e if e == StatusCode::OK as i32 => StatusCode::OK,
        e if e == StatusCode::NO_MEMORY as i32 => StatusCode::NO_MEMORY,
        e if e == StatusCode::INVALID_OPERATION as i32 => StatusCode::INVALID_OPERATION,
        e if e == StatusCode::BAD_VALUE as i32 => StatusCode::BAD_VALUE,
        e if e == StatusCode::BAD_TYPE as i32 => StatusCode::BAD_TYPE,
        e if e == StatusCode::NAME_NOT_FOUND as i32 => StatusCode::NAME_NOT_FOUND,
        e if e == StatusCode::PERMISSION_DENIED as i32 => StatusCode::PERMISSION_DENIED,
        e if e == StatusCode::NO_INIT as i32 => StatusCode::NO_INIT,
        e if e == StatusCode::ALREADY_EXISTS as i32 => StatusCode::ALREADY_EXISTS,
        e if e == StatusCode::DEAD_OBJECT as i32 => StatusCode::DEAD_OBJECT,
        e if e == StatusCode::FAILED_TRANSACTION as i32 => StatusCode::FAILED_TRANSACTION,
        e if e == StatusCode::BAD_INDEX as i32 => StatusCode::BAD_INDEX,
        e if e == StatusCode::NOT_ENOUGH_DATA as i32 => StatusCode::NOT_ENOUGH_DATA,
        e if e == StatusCode::WOULD_BLOCK as i32 => StatusCode::WOULD_BLOCK,
        e if e == StatusCode::TIMED_OUT as i32 => StatusCode::TIMED_OUT,
        e if e == StatusCode::UNKNOWN_TRANSACTION as i32 => StatusCode::UNKNOWN_TRANSACTION,
        e if e == StatusCode::FDS_NOT_ALLOWED as i32 => StatusCode::FDS_NOT_ALLOWED,
        e if e == StatusCode::UNEXPECTED_NULL as i32 => StatusCode::UNEXPECTED_NULL,
        _ => StatusCode::UNKNOWN_ERROR,
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            StatusCode::OK => "OK",
            StatusCode::UNKNOWN_ERROR => "UNKNOWN_ERROR",
            StatusCode::NO_MEMORY => "NO_MEMORY",
            StatusCode::INVALID_OPERATION => "INVALID_OPERATION",
            StatusCode::BAD_VALUE => "BAD_VALUE",
            StatusCode::BAD_TYPE => "BAD_TYPE",
            StatusCode::NAME_NOT_FOUND => "NAME_NOT_FOUND",
            StatusCode::PERMISSION_DENIED => "PERMISSION_DENIED",
            StatusCode::NO_INIT => "NO_INIT",
            StatusCode::ALREADY_EXISTS => "ALREADY_EXISTS",
            StatusCode::DEAD_OBJECT => "DEAD_OBJECT",
            StatusCode::FAILED_TRANSACTION => "FAILED_TRANSACTION",
            StatusCode::BAD_INDEX => "BAD_INDEX",
            StatusCode::NOT_ENOUGH_DATA => "NOT_ENOUGH_DATA",
            StatusCode::WOULD_BLOCK => "WOULD_BLOCK",
            StatusCode::TIMED_OUT => "TIMED_OUT",
            StatusCode::UNKNOWN_TRANSACTION => "UNKNOWN_TRANSACTION",
            StatusCode::FDS_NOT_ALLOWED => "FDS_NOT_ALLOWED",
            StatusCode::UNEXPECTED_NULL => "UNEXPECTED_NULL",
        };
        f.write_str(name)
    }
}

impl error::Error for StatusCode {}

// The socket transport surfaces I/O failures; a broken stream means the
// peer is gone.
impl From<io::Error> for StatusCode {
    fn from(e: io::Error) -> StatusCode {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => StatusCode::DEAD_OBJECT,
            io::ErrorKind::WouldBlock => StatusCode::WOULD_BLOCK,
            io::ErrorKind::TimedOut => StatusCode::TIMED_OUT,
            io::ErrorKind::PermissionDenied => StatusCode::PERMISSION_DENIED,
            io::ErrorKind::InvalidInput => StatusCode::BAD_VALUE,
            _ => StatusCode::FAILED_TRANSACTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for code in [
            StatusCode::OK,
            StatusCode::DEAD_OBJECT,
            StatusCode::UNKNOWN_TRANSACTION,
            StatusCode::UNEXPECTED_NULL,
            StatusCode::PERMISSION_DENIED,
        ] {
            assert_eq!(parse_status_code(code as i32), code);
        }
    }

    #[test]
    fn unknown_values_collapse() {
        assert_eq!(parse_status_code(12345), StatusCode::UNKNOWN_ERROR);
        assert_eq!(status_result(0), Ok(()));
        assert_eq!(
            status_result(StatusCode::BAD_VALUE as i32),
            Err(StatusCode::BAD_VALUE)
        );
    }
}
