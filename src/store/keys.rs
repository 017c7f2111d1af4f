/// Key layout for Fjall partitions
///
/// Primary records use a type prefix; the size index formats sizes as
/// zero-padded decimal so lexicographic partition order matches numeric
/// order and range scans work without decoding.

pub fn encode_session_key(session_id: &str) -> Vec<u8> {
    format!("sess:{}", session_id).into_bytes()
}

pub fn encode_file_key(file_id: &str) -> Vec<u8> {
    format!("file:{}", file_id).into_bytes()
}

pub fn encode_job_key(job_id: &str) -> Vec<u8> {
    format!("job:{}", job_id).into_bytes()
}

/// Checksum index entry: ck:{checksum}:{file_id}
pub fn encode_checksum_key(checksum: &str, file_id: &str) -> Vec<u8> {
    format!("ck:{}:{}", checksum, file_id).into_bytes()
}

/// Prefix for scanning every file sharing a checksum.
pub fn encode_checksum_prefix(checksum: &str) -> Vec<u8> {
    format!("ck:{}:", checksum).into_bytes()
}

/// Size index entry: {size:020}:{file_id}
pub fn encode_size_key(size: u64, file_id: &str) -> Vec<u8> {
    format!("{:020}:{}", size, file_id).into_bytes()
}

/// Lower bound (inclusive) for a size range scan.
pub fn encode_size_bound(size: u64) -> Vec<u8> {
    format!("{:020}", size).into_bytes()
}
