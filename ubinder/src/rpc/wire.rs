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

//! Private frame format of the RPC transport.
//!
//! Every message is one fixed-size header followed by a parcel byte
//! payload. The format carries no capability or fd slots; parcels that
//! hold either are rejected before framing.

use crate::error::{Result, StatusCode};
use crate::parcel::Parcel;

use std::io::{self, Read, Write};

pub(crate) const CMD_TRANSACT: u32 = 1;
pub(crate) const CMD_REPLY: u32 = 2;

// Bound on a single transaction payload; anything larger is a protocol
// violation, not a legitimate call.
pub(crate) const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

const HEADER_SIZE: usize = 20;

#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub command: u32,
    pub code: u32,
    pub flags: u32,
    pub status: i32,
    pub body_len: u32,
}

impl FrameHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.command.to_le_bytes());
        out[4..8].copy_from_slice(&self.code.to_le_bytes());
        out[8..12].copy_from_slice(&self.flags.to_le_bytes());
        out[12..16].copy_from_slice(&self.status.to_le_bytes());
        out[16..20].copy_from_slice(&self.body_len.to_le_bytes());
        out
    }

    fn from_bytes(bytes: [u8; HEADER_SIZE]) -> FrameHeader {
        FrameHeader {
            command: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            code: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            status: i32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            body_len: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        }
    }
}

pub(crate) fn write_frame(
    w: &mut impl Write,
    command: u32,
    code: u32,
    flags: u32,
    status: i32,
    body: &[u8],
) -> io::Result<()> {
    let header = FrameHeader {
        command,
        code,
        flags,
        status,
        body_len: body.len() as u32,
    };
    w.write_all(&header.to_bytes())?;
    w.write_all(body)
}

pub(crate) fn read_frame(r: &mut impl Read) -> io::Result<(FrameHeader, Vec<u8>)> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    r.read_exact(&mut header_bytes)?;
    let header = FrameHeader::from_bytes(header_bytes);
    if header.body_len as usize > MAX_BODY_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "oversized RPC frame",
        ));
    }
    let mut body = vec![0u8; header.body_len as usize];
    r.read_exact(&mut body)?;
    Ok((header, body))
}

/// A parcel may only cross the socket transport if it carries no
/// capability or file descriptor slots.
pub(crate) fn check_wire_safe(parcel: &Parcel) -> Result<()> {
    if parcel.has_binders() {
        return Err(StatusCode::INVALID_OPERATION);
    }
    if parcel.has_file_descriptors() {
        return Err(StatusCode::FDS_NOT_ALLOWED);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, CMD_TRANSACT, 7, 1, 0, b"payload").unwrap();
        let (header, body) = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(header.command, CMD_TRANSACT);
        assert_eq!(header.code, 7);
        assert_eq!(header.flags, 1);
        assert_eq!(body, b"payload");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let header = FrameHeader {
            command: CMD_TRANSACT,
            code: 1,
            flags: 0,
            status: 0,
            body_len: (MAX_BODY_SIZE + 1) as u32,
        };
        let bytes = header.to_bytes();
        assert!(read_frame(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn capabilities_cannot_cross_the_wire() {
        use crate::binder::Interface;
        let mut parcel = Parcel::new();
        parcel
            .write_binder(Some(&crate::Binder::new(()).as_binder()))
            .unwrap();
        assert_eq!(
            check_wire_safe(&parcel),
            Err(StatusCode::INVALID_OPERATION)
        );
    }
}
