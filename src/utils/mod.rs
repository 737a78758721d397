pub(crate) mod bytes;
mod time;
mod utf16;

pub(crate) use self::time::{
    filetime_to_timestamp, timestamp_to_filetime, timestamp_to_unix_secs, unix_secs_to_timestamp,
};
pub(crate) use self::utf16::{decode_utf16le_bytes_z, push_utf16le_z, read_utf16z_r};
