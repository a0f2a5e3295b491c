//! Shared protocol constants for the filesync framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"FSYN";
pub const VERSION: u16 = 1;

/// Frame header length: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub const HEADER_LEN: usize = 11;

// Maximum frame payload size (64MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Byte payload per CHUNK frame. The last chunk of a file may be shorter or empty.
pub const CHUNK_SIZE: usize = 1_000_000;

// Frame type IDs (keep numeric stable)
pub mod frame {
    pub const REQUEST: u8 = 1;
    pub const OK: u8 = 2;
    pub const ERROR: u8 = 3;

    // LIST protocol:
    // Client sends: REQUEST(ListFolder)
    // Server responds: ENTRY, ENTRY, ..., END
    pub const ENTRY: u8 = 4;
    pub const END: u8 = 5;

    // Byte payloads in either direction. The message with done=true is the
    // only valid terminator; EOF before it is a disconnection.
    pub const CHUNK: u8 = 6;

    pub fn name(t: u8) -> &'static str {
        match t {
            REQUEST => "REQUEST",
            OK => "OK",
            ERROR => "ERROR",
            ENTRY => "ENTRY",
            END => "END",
            CHUNK => "CHUNK",
            _ => "UNKNOWN",
        }
    }
}

// Centralized timeout constants
pub mod timeouts {
    // Default idle deadline for any single frame read (ms)
    pub const IDLE_MS: u64 = 30_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 5_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 100;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Calculate write deadline based on payload size (ms)
    // base + PER_MB_MS per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64).div_ceil(1_048_576);
        WRITE_BASE_MS + mb * PER_MB_MS
    }
}
