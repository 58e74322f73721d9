use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// `uuid4().hex` truncated to `len` hex characters (max 32).
#[inline]
pub(crate) fn random_hex(len: usize) -> String {
    let mut hex = uuid::Uuid::new_v4().simple().to_string();
    hex.truncate(len.min(32));
    hex
}

/// Client-facing completion id: `chatcmpl-` followed by 24 hex characters.
#[must_use]
pub fn new_completion_id() -> String {
    let mut out = String::with_capacity(33);
    out.push_str("chatcmpl-");
    out.push_str(&random_hex(24));
    out
}

/// Deterministic call id used when the upstream never supplies one.
#[inline]
#[must_use]
pub fn synthesized_call_id(index: u32) -> String {
    format!("call_{index}")
}
