use std::time::Duration;

use redis::{ConnectionLike, RedisResult};

/// Claims the key for `ARGV[1]` when it is free or already held by that
/// token, setting a `ARGV[2]` millisecond expiry in the same step.
pub const ACQUIRE_OR_RENEW: &str = r"local current = redis.call('get', KEYS[1])
                                     if current == ARGV[1] or current == false then
                                       redis.call('psetex', KEYS[1], ARGV[2], ARGV[1])
                                       return 1
                                     end
                                     return 0";

/// Deletes the key only while it still holds `ARGV[1]`.
pub const RELEASE_IF_OWNER: &str = r"if redis.call('get', KEYS[1]) == ARGV[1] then
                                       return redis.call('del', KEYS[1])
                                     else
                                       return 0
                                     end";

pub(crate) fn acquire_or_renew(
    con: &mut dyn ConnectionLike,
    key: &str,
    token: &[u8],
    ttl_ms: u64,
) -> RedisResult<bool> {
    let script = redis::Script::new(ACQUIRE_OR_RENEW);
    let result: i32 = script.key(key).arg(token).arg(ttl_ms).invoke(con)?;
    Ok(result == 1)
}

pub(crate) fn release_if_owner(
    con: &mut dyn ConnectionLike,
    key: &str,
    token: &[u8],
) -> RedisResult<bool> {
    let script = redis::Script::new(RELEASE_IF_OWNER);
    let result: i32 = script.key(key).arg(token).invoke(con)?;
    Ok(result == 1)
}

/// `PTTL` answers -2 for a missing key and -1 for a key without expiry.
pub(crate) fn time_to_live(
    con: &mut dyn ConnectionLike,
    key: &str,
) -> RedisResult<Option<Duration>> {
    let pttl: i64 = redis::cmd("PTTL").arg(key).query(con)?;
    Ok(u64::try_from(pttl).ok().map(Duration::from_millis))
}
