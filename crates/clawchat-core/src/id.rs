use rand::Rng;

const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LENGTH: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Federated,
}

impl Prefix {
    fn as_str(&self) -> &'static str {
        match self {
            Prefix::Federated => "fed",
        }
    }
}

fn random_base62(length: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut result = String::with_capacity(length);
    for _ in 0..length {
        let idx = rng.gen_range(0..62);
        result.push(BASE62_CHARS[idx] as char);
    }
    result
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Create a prefixed id whose lexicographic order follows creation time:
/// a hex-encoded millisecond timestamp followed by a random base62 tail.
pub fn create(prefix: Prefix) -> String {
    let mut time_bytes = [0u8; 6];
    let now = now_millis();
    for (i, byte) in time_bytes.iter_mut().enumerate() {
        *byte = ((now >> (40 - 8 * i)) & 0xff) as u8;
    }

    let hex_time = hex::encode(time_bytes);
    let random_part = random_base62(LENGTH - 12);

    format!("{}_{}{}", prefix.as_str(), hex_time, random_part)
}

/// Correlation id for an upstream request.
///
/// The sequence number comes from a per-connection counter and the
/// timestamp makes ids unique across reconnects of the same connection,
/// so a late response from a previous socket can never match a pending
/// slot on the current one.
pub fn request_id(seq: u64) -> String {
    format!("r{}-{:x}", seq, now_millis())
}
