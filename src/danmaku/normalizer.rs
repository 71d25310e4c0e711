//! Normalization of raw `DANMU_MSG` payloads into [`Danmaku`] records.
//!
//! Bilibili encodes chat messages as a positional `info` array:
//! `info[1]` is the text, `info[2][0]`/`info[2][1]` are the sender uid and
//! name, and `info[9].ts` carries the send time.

use serde_json::Value;

use crate::danmaku::message::Danmaku;
use crate::error::{Error, Result};

/// Base URL for sender profile links.
const PROFILE_URL_BASE: &str = "https://space.bilibili.com/";

/// Convert a raw `DANMU_MSG` payload into a [`Danmaku`].
///
/// Fails with [`Error::MalformedPayload`] when any required field (sender id,
/// sender name, text, timestamp) is absent. Callers are expected to log and
/// drop the single message rather than tear down the owning connection.
pub fn normalize(room_id: u64, raw: &Value) -> Result<Danmaku> {
    let info = raw
        .get("info")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::malformed("missing info array"))?;

    let text = info
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::malformed("missing text at info[1]"))?;

    let sender_info = info
        .get(2)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::malformed("missing sender info at info[2]"))?;

    let uid = sender_info
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::malformed("missing sender uid at info[2][0]"))?;

    let username = sender_info
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::malformed("missing sender name at info[2][1]"))?;

    let timestamp_millis = info
        .get(9)
        .and_then(|v| v.get("ts"))
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::malformed("missing timestamp at info[9].ts"))?;

    Ok(Danmaku::new(
        uid,
        username,
        format!("{PROFILE_URL_BASE}{uid}"),
        text,
        timestamp_millis,
        room_id,
    ))
}
