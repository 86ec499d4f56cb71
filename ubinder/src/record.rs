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

//! Serialized snapshots of dispatched transactions.
//!
//! The on-file layout is a sequence of chunks, each preceded by a
//! descriptor (type and size) and followed by a checksum of the padded
//! payload. Unknown chunk types are skipped on read, so the format can
//! grow fields without breaking old readers. A file is terminated by an
//! end chunk.

use crate::error::{Result, StatusCode};
use crate::parcel::Parcel;

use std::io::{Read, Write};
use std::os::unix::io::BorrowedFd;
use std::time::{SystemTime, UNIX_EPOCH};

const HEADER_CHUNK: u32 = 1;
const DATA_PARCEL_CHUNK: u32 = 2;
const REPLY_PARCEL_CHUNK: u32 = 3;
const INTERFACE_NAME_CHUNK: u32 = 4;
const END_CHUNK: u32 = 0x00ff_ffff;

const MAX_CHUNK_DATA_SIZE: usize = 0xffff_fff0;

fn pad8(len: usize) -> usize {
    (len + 7) & !7
}

fn checksum(bytes: &[u8]) -> u64 {
    let mut sum = 0u64;
    for chunk in bytes.chunks(8) {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        sum ^= u64::from_le_bytes(word);
    }
    sum
}

/// One recorded transaction: what was asked of an interface, and what
/// came back.
pub struct RecordedTransaction {
    code: u32,
    flags: u32,
    returned_status: i32,
    timestamp_secs: i64,
    timestamp_nanos: i32,
    interface_name: String,
    data_parcel: Vec<u8>,
    reply_parcel: Vec<u8>,
}

impl RecordedTransaction {
    /// Snapshot a dispatched transaction. Returns `None` when the payload
    /// cannot be represented in the recording format.
    pub fn from_details(
        interface_name: &str,
        code: u32,
        flags: u32,
        timestamp: SystemTime,
        data: &Parcel,
        reply: &Parcel,
        returned_status: i32,
    ) -> Option<RecordedTransaction> {
        if data.data_size() > MAX_CHUNK_DATA_SIZE || reply.data_size() > MAX_CHUNK_DATA_SIZE {
            log::error!("Transaction too large to record");
            return None;
        }
        let since_epoch = timestamp.duration_since(UNIX_EPOCH).ok()?;
        Some(RecordedTransaction {
            code,
            flags,
            returned_status,
            timestamp_secs: since_epoch.as_secs() as i64,
            timestamp_nanos: since_epoch.subsec_nanos() as i32,
            interface_name: interface_name.to_string(),
            data_parcel: data.data().to_vec(),
            reply_parcel: reply.data().to_vec(),
        })
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn returned_status(&self) -> i32 {
        self.returned_status
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp_secs
    }

    pub fn data_parcel(&self) -> &[u8] {
        &self.data_parcel
    }

    pub fn reply_parcel(&self) -> &[u8] {
        &self.reply_parcel
    }

    fn header_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[0..4].copy_from_slice(&self.code.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..12].copy_from_slice(&self.returned_status.to_le_bytes());
        // bytes 12..16 reserved for a format version
        out[16..24].copy_from_slice(&self.timestamp_secs.to_le_bytes());
        out[24..28].copy_from_slice(&self.timestamp_nanos.to_le_bytes());
        out
    }

    /// Append this transaction to `fd` in chunked form.
    pub fn dump_to_file(&self, fd: BorrowedFd<'_>) -> Result<()> {
        let owned = fd
            .try_clone_to_owned()
            .map_err(|_| StatusCode::BAD_VALUE)?;
        let mut file = std::fs::File::from(owned);
        write_chunk(&mut file, HEADER_CHUNK, &self.header_bytes())?;
        write_chunk(
            &mut file,
            INTERFACE_NAME_CHUNK,
            self.interface_name.as_bytes(),
        )?;
        write_chunk(&mut file, DATA_PARCEL_CHUNK, &self.data_parcel)?;
        write_chunk(&mut file, REPLY_PARCEL_CHUNK, &self.reply_parcel)?;
        write_chunk(&mut file, END_CHUNK, &[])?;
        Ok(())
    }

    /// Read the next recorded transaction from `fd`, consuming chunks up
    /// to and including the end chunk.
    pub fn from_file(fd: BorrowedFd<'_>) -> Result<RecordedTransaction> {
        let owned = fd
            .try_clone_to_owned()
            .map_err(|_| StatusCode::BAD_VALUE)?;
        let mut file = std::fs::File::from(owned);
        let mut out = RecordedTransaction {
            code: 0,
            flags: 0,
            returned_status: 0,
            timestamp_secs: 0,
            timestamp_nanos: 0,
            interface_name: String::new(),
            data_parcel: Vec::new(),
            reply_parcel: Vec::new(),
        };
        loop {
            let (chunk_type, payload) = read_chunk(&mut file)?;
            match chunk_type {
                HEADER_CHUNK => {
                    if payload.len() < 28 {
                        return Err(StatusCode::BAD_VALUE);
                    }
                    out.code = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                    out.flags = u32::from_le_bytes(payload[4..8].try_into().unwrap());
                    out.returned_status = i32::from_le_bytes(payload[8..12].try_into().unwrap());
                    out.timestamp_secs = i64::from_le_bytes(payload[16..24].try_into().unwrap());
                    out.timestamp_nanos = i32::from_le_bytes(payload[24..28].try_into().unwrap());
                }
                INTERFACE_NAME_CHUNK => {
                    out.interface_name =
                        String::from_utf8(payload).map_err(|_| StatusCode::BAD_VALUE)?;
                }
                DATA_PARCEL_CHUNK => out.data_parcel = payload,
                REPLY_PARCEL_CHUNK => out.reply_parcel = payload,
                END_CHUNK => return Ok(out),
                // Forward compatibility: checksummed and skipped.
                _ => {}
            }
        }
    }
}

fn write_chunk(w: &mut impl Write, chunk_type: u32, payload: &[u8]) -> Result<()> {
    let mut descriptor = [0u8; 8];
    descriptor[0..4].copy_from_slice(&chunk_type.to_le_bytes());
    descriptor[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());

    let padded_len = pad8(payload.len());
    let mut padded = vec![0u8; padded_len];
    padded[..payload.len()].copy_from_slice(payload);

    w.write_all(&descriptor)?;
    w.write_all(&padded)?;
    w.write_all(&checksum(&padded).to_le_bytes())?;
    Ok(())
}

fn read_chunk(r: &mut impl Read) -> Result<(u32, Vec<u8>)> {
    let mut descriptor = [0u8; 8];
    r.read_exact(&mut descriptor)?;
    let chunk_type = u32::from_le_bytes(descriptor[0..4].try_into().unwrap());
    let size = u32::from_le_bytes(descriptor[4..8].try_into().unwrap()) as usize;
    if size > MAX_CHUNK_DATA_SIZE {
        return Err(StatusCode::BAD_VALUE);
    }

    let mut padded = vec![0u8; pad8(size)];
    r.read_exact(&mut padded)?;
    let mut stored_sum = [0u8; 8];
    r.read_exact(&mut stored_sum)?;
    if checksum(&padded) != u64::from_le_bytes(stored_sum) {
        log::error!("Checksum mismatch while reading recorded transaction chunk");
        return Err(StatusCode::BAD_VALUE);
    }
    padded.truncate(size);
    Ok((chunk_type, padded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use std::os::unix::io::AsFd;

    fn tempfile() -> std::fs::File {
        tempfile_named("record")
    }

    fn tempfile_named(tag: &str) -> std::fs::File {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "ubinder_{}_{}_{:?}",
            tag,
            std::process::id(),
            std::thread::current().id()
        ));
        let file = std::fs::File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        file
    }

    #[test]
    fn dump_and_reload() {
        let mut data = Parcel::new();
        data.write(&13i32).unwrap();
        let mut reply = Parcel::new();
        reply.write("result").unwrap();

        let recorded = RecordedTransaction::from_details(
            "android.os.ITest",
            crate::binder::PING_TRANSACTION,
            0,
            SystemTime::now(),
            &data,
            &reply,
            0,
        )
        .unwrap();

        let mut file = tempfile();
        recorded.dump_to_file(file.as_fd()).unwrap();
        file.rewind().unwrap();

        let loaded = RecordedTransaction::from_file(file.as_fd()).unwrap();
        assert_eq!(loaded.code(), crate::binder::PING_TRANSACTION);
        assert_eq!(loaded.interface_name(), "android.os.ITest");
        assert_eq!(loaded.data_parcel(), data.data());
        assert_eq!(loaded.reply_parcel(), reply.data());
        assert_eq!(loaded.returned_status(), 0);
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let recorded = RecordedTransaction::from_details(
            "iface",
            1,
            0,
            SystemTime::now(),
            &Parcel::new(),
            &Parcel::new(),
            0,
        )
        .unwrap();
        let mut file = tempfile_named("corrupt");
        recorded.dump_to_file(file.as_fd()).unwrap();

        use std::io::SeekFrom;
        file.seek(SeekFrom::Start(8)).unwrap();
        file.write_all(&[0xff]).unwrap();
        file.rewind().unwrap();

        assert!(RecordedTransaction::from_file(file.as_fd()).is_err());
    }
}
