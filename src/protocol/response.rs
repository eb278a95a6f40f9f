//! Status-line and reply builders.
//!
//! These only format bytes; writing them to a connection goes through the
//! scatter/gather writer in `net::segment` so a `VALUE` reply can share a
//! single buffer with its `suffix`+value segments instead of copying.

pub const STORED: &[u8] = b"STORED\r\n";
pub const NOT_STORED: &[u8] = b"NOT_STORED\r\n";
pub const EXISTS: &[u8] = b"EXISTS\r\n";
pub const NOT_FOUND: &[u8] = b"NOT_FOUND\r\n";
pub const DELETED: &[u8] = b"DELETED\r\n";
pub const OK: &[u8] = b"OK\r\n";
pub const RESET: &[u8] = b"RESET\r\n";
pub const END: &[u8] = b"END\r\n";
pub const ERROR: &[u8] = b"ERROR\r\n";

pub fn client_error(msg: &str) -> Vec<u8> {
    format!("CLIENT_ERROR {msg}\r\n").into_bytes()
}

pub fn server_error(msg: &str) -> Vec<u8> {
    format!("SERVER_ERROR {msg}\r\n").into_bytes()
}

/// A bare `ERROR <reason>\r\n` line, distinct from `ERROR\r\n` (unrecognized
/// command) and `*_ERROR <msg>` (client/server fault): used for `flush_all`'s
/// documented `ERROR READ_ONLY` / `ERROR OPTIMIZE_RUNNING` replies.
pub fn error_line(reason: &str) -> Vec<u8> {
    format!("ERROR {reason}\r\n").into_bytes()
}

pub fn version(v: &str) -> Vec<u8> {
    format!("VERSION {v}\r\n").into_bytes()
}

pub fn numeric(n: u64) -> Vec<u8> {
    format!("{n}\r\n").into_bytes()
}

pub fn optimize_bucket(bucket: u32) -> Vec<u8> {
    format!("OK {bucket:x}\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_wraps_message() {
        assert_eq!(
            &client_error("bad command line format")[..],
            b"CLIENT_ERROR bad command line format\r\n"
        );
    }
}
