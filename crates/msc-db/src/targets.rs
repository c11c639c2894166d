// Target lock + observation SQL.
//
// Design notes:
// - Lock acquisition never waits. Creation of a never-seen target and the
//   empty -> token transition are each a single statement, so there is no
//   window between "row exists" and "row is locked".
// - Release is compare-and-swap on the token: a late release from a previous
//   holder cannot clear a newer holder's lock.
// - The target upsert and the message append share one transaction.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use crate::{
    LockAttempt, LockToken, MessageRow, NewObservation, RecordedObservation, TargetKey, TargetRow,
};

/// Leases are clamped so `$n * interval '1 second'` cannot overflow.
const MAX_LEASE_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Try to take the advisory lock on `key` with `token`.
///
/// `lease = Some(d)` additionally allows taking over a lock whose
/// `lock_acquired_at` is older than `d`.
pub async fn target_try_lock(
    pool: &PgPool,
    key: &TargetKey,
    token: &LockToken,
    lease: Option<Duration>,
) -> Result<LockAttempt> {
    key.check_storable().context("target_try_lock rejected key")?;

    let created: Option<i64> = sqlx::query_scalar(
        r#"
        insert into targets (ip, port, lock_token, lock_acquired_at)
        values ($1, $2, $3, now())
        on conflict (ip, port) do nothing
        returning id
        "#,
    )
    .bind(&key.ip)
    .bind(i32::from(key.port))
    .bind(token.as_str())
    .fetch_optional(pool)
    .await
    .context("target_try_lock insert failed")?;

    if created.is_some() {
        return Ok(LockAttempt::Created);
    }

    let lease_secs: Option<i64> = lease.map(|d| d.as_secs().min(MAX_LEASE_SECS) as i64);

    // `prev` is read FOR UPDATE so the predicate sees the latest committed
    // holder, not the statement snapshot.
    let prev: Option<Option<String>> = sqlx::query_scalar(
        r#"
        with prev as (
            select id, lock_token, lock_acquired_at
            from targets
            where ip = $1 and port = $2
            for update
        )
        update targets t
        set lock_token = $3,
            lock_acquired_at = now()
        from prev
        where t.id = prev.id
          and (
            prev.lock_token is null
            or prev.lock_token = ''
            or ($4::bigint is not null
                and prev.lock_acquired_at < now() - ($4::bigint * interval '1 second'))
          )
        returning prev.lock_token
        "#,
    )
    .bind(&key.ip)
    .bind(i32::from(key.port))
    .bind(token.as_str())
    .bind(lease_secs)
    .fetch_optional(pool)
    .await
    .context("target_try_lock update failed")?;

    Ok(match prev {
        None => LockAttempt::Held,
        Some(None) => LockAttempt::Acquired,
        Some(Some(t)) if t.is_empty() => LockAttempt::Acquired,
        Some(Some(_)) => LockAttempt::Reclaimed,
    })
}

/// Clear the lock only if `token` is still the stored holder.
///
/// Returns `false` when the stored token differs (or the target is unknown).
pub async fn target_unlock(pool: &PgPool, key: &TargetKey, token: &LockToken) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update targets
        set lock_token = null,
            lock_acquired_at = null
        where ip = $1 and port = $2 and lock_token = $3
        "#,
    )
    .bind(&key.ip)
    .bind(i32::from(key.port))
    .bind(token.as_str())
    .execute(pool)
    .await
    .context("target_unlock failed")?;

    Ok(res.rows_affected() == 1)
}

/// Upsert the target (last write wins on service / last_updated) and append
/// the message row, atomically.
pub async fn observation_record(
    pool: &PgPool,
    obs: &NewObservation,
) -> Result<RecordedObservation> {
    obs.check_storable().context("observation_record rejected observation")?;

    let mut tx = pool
        .begin()
        .await
        .context("observation_record begin failed")?;

    let target_id: i64 = sqlx::query_scalar(
        r#"
        insert into targets (ip, port, service, last_updated)
        values ($1, $2, $3, $4)
        on conflict (ip, port) do update set
            service = excluded.service,
            last_updated = excluded.last_updated
        returning id
        "#,
    )
    .bind(&obs.key.ip)
    .bind(i32::from(obs.key.port))
    .bind(&obs.service)
    .bind(obs.observed_at)
    .fetch_one(&mut *tx)
    .await
    .context("observation_record target upsert failed")?;

    let message_id: i64 = sqlx::query_scalar(
        r#"
        insert into messages (target_id, message_content, service, response, insertion_time)
        values ($1, $2, $3, $4, $5)
        returning id
        "#,
    )
    .bind(target_id)
    .bind(&obs.message_content)
    .bind(&obs.service)
    .bind(&obs.response)
    .bind(obs.observed_at)
    .fetch_one(&mut *tx)
    .await
    .context("observation_record message insert failed")?;

    tx.commit()
        .await
        .context("observation_record commit failed")?;

    Ok(RecordedObservation {
        target_id,
        message_id,
    })
}

pub async fn target_fetch(pool: &PgPool, key: &TargetKey) -> Result<Option<TargetRow>> {
    let row = sqlx::query(
        r#"
        select id, ip, port, service, last_updated, lock_token, lock_acquired_at
        from targets
        where ip = $1 and port = $2
        "#,
    )
    .bind(&key.ip)
    .bind(i32::from(key.port))
    .fetch_optional(pool)
    .await
    .context("target_fetch failed")?;

    let Some(row) = row else {
        return Ok(None);
    };

    let port: i32 = row.try_get("port")?;
    Ok(Some(TargetRow {
        id: row.try_get("id")?,
        ip: row.try_get("ip")?,
        port: u16::try_from(port).with_context(|| format!("stored port out of range: {port}"))?,
        service: row.try_get("service")?,
        last_updated: row.try_get("last_updated")?,
        lock_token: row.try_get("lock_token")?,
        lock_acquired_at: row.try_get("lock_acquired_at")?,
    }))
}

/// All messages recorded for `key`, oldest first.
pub async fn messages_fetch_for_target(pool: &PgPool, key: &TargetKey) -> Result<Vec<MessageRow>> {
    let rows = sqlx::query(
        r#"
        select m.id, m.target_id, m.message_content, m.service, m.response, m.insertion_time
        from messages m
        join targets t on t.id = m.target_id
        where t.ip = $1 and t.port = $2
        order by m.id asc
        "#,
    )
    .bind(&key.ip)
    .bind(i32::from(key.port))
    .fetch_all(pool)
    .await
    .context("messages_fetch_for_target failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(MessageRow {
            id: row.try_get("id")?,
            target_id: row.try_get("target_id")?,
            message_content: row.try_get("message_content")?,
            service: row.try_get("service")?,
            response: row.try_get("response")?,
            insertion_time: row.try_get("insertion_time")?,
        });
    }
    Ok(out)
}
